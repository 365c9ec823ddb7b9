//! Shared-secret API key authentication.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::http::Headers;

/// Validates a presented credential against the configured secret.
#[derive(Clone)]
pub struct ApiKeyAuth {
    secret: String,
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth").finish_non_exhaustive()
    }
}

impl ApiKeyAuth {
    /// Fails with [`Error::Config`] on an empty secret.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Config {
                field: "UPGUARD_API_SECRET",
                reason: "must not be empty".into(),
            });
        }
        Ok(Self { secret })
    }

    /// Missing and mismatched credentials fail identically.
    pub fn verify(&self, headers: &Headers) -> Result<()> {
        match extract_credential(headers) {
            Some(presented) if constant_time_eq(presented.as_bytes(), self.secret.as_bytes()) => {
                Ok(())
            }
            _ => Err(Error::Unauthorized),
        }
    }
}

/// The credential from `Authorization: Bearer <token>` (scheme matched
/// case-insensitively), otherwise from `X-API-Key`.
pub fn extract_credential(headers: &Headers) -> Option<&str> {
    let bearer = headers.get("authorization").and_then(|value| {
        let (scheme, token) = value.trim().split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
            .filter(|token| !token.is_empty())
    });
    bearer.or_else(|| {
        headers
            .get("x-api-key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
    })
}

/// Compares without short-circuiting on the first differing byte.
///
/// Both sides are hashed to fixed-size SHA-256 digests first, so a length
/// mismatch costs the same as any other mismatch and the time taken does not
/// depend on the secret's length.
///
/// # Examples
///
/// ```
/// use upguard::security::constant_time_eq;
///
/// assert!(constant_time_eq(b"s3cret", b"s3cret"));
/// assert!(!constant_time_eq(b"s3cret", b"s3cret-but-longer"));
/// ```
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(digest(a)[..].ct_eq(&digest(b)[..]))
}

fn digest(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(*name, *value);
        }
        headers
    }

    #[test]
    fn bearer_and_api_key_are_accepted() {
        let auth = ApiKeyAuth::new("s3cret").unwrap();
        assert!(auth.verify(&headers(&[("Authorization", "Bearer s3cret")])).is_ok());
        assert!(auth.verify(&headers(&[("Authorization", "bearer s3cret")])).is_ok());
        assert!(auth.verify(&headers(&[("X-API-Key", "s3cret")])).is_ok());
    }

    #[test]
    fn bad_credentials_are_rejected() {
        let auth = ApiKeyAuth::new("s3cret").unwrap();
        for presented in [
            headers(&[]),
            headers(&[("Authorization", "Bearer wrong")]),
            headers(&[("Authorization", "Basic s3cret")]),
            headers(&[("Authorization", "Bearer ")]),
            headers(&[("X-API-Key", "s3cret-but-longer")]),
        ] {
            assert!(matches!(auth.verify(&presented), Err(Error::Unauthorized)));
        }
    }

    #[test]
    fn bearer_takes_precedence() {
        let h = headers(&[("Authorization", "Bearer a"), ("X-API-Key", "b")]);
        assert_eq!(extract_credential(&h), Some("a"));
        let h = headers(&[("Authorization", "Token a"), ("X-API-Key", "b")]);
        assert_eq!(extract_credential(&h), Some("b"));
    }

    #[test]
    fn empty_secret_is_a_config_error() {
        assert!(matches!(ApiKeyAuth::new(""), Err(Error::Config { .. })));
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn digests_are_fixed_width_for_any_input_length() {
        let short = digest(b"a");
        let long = digest("s3cret".repeat(100).as_bytes());
        assert_eq!(short.len(), long.len());
        assert_ne!(short, long);
        assert_eq!(digest(b"s3cret"), digest(b"s3cret"));
    }
}
