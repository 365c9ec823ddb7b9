//! The request gate: throttle, then authorize, then harden the response.
//!
//! [`RequestGate`] runs in front of route logic with a fixed ordering. A
//! throttled client gets `429 Too Many Requests` with `Retry-After` before its
//! credentials are even looked at; an admitted client without a valid key gets
//! `401 Unauthorized`. Every response leaving the gate, success or failure,
//! carries the [`SecureHeaders`] set.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use super::auth::ApiKeyAuth;
use super::rate_limit::{RateLimitConfig, RateLimitKey, RateLimitStatus, RateLimiter, client_id};
use crate::config::{env_flag, env_or};
use crate::error::{Error, Result};
use crate::http::Method;
use crate::middleware::{BoxResponse, Middleware, Next};
use crate::{Request, Response, StatusCode, context::Context};

/// Category used when no [`RouteRule`] matches.
pub const DEFAULT_CATEGORY: &str = "default";

/// Identity the gate resolved for the caller, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routes whose path starts with `prefix` are counted under `category` with
/// their own window.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub prefix: String,
    pub category: String,
    pub limit: RateLimitConfig,
}

/// Settings for a [`RequestGate`]. `Debug` never prints the secret.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upguard::security::{GateConfig, RateLimitConfig};
///
/// let config = GateConfig::new("s3cret")
///     .default_limit(RateLimitConfig::new(60, Duration::from_secs(60)))
///     .rule("/auth", "auth", RateLimitConfig::new(5, Duration::from_secs(300)))
///     .allow_anonymous_reads(true);
///
/// assert_eq!(config.rules.len(), 1);
/// assert!(!format!("{config:?}").contains("s3cret"));
/// ```
#[derive(Clone)]
pub struct GateConfig {
    /// The shared key clients present as a bearer token or `X-API-Key`.
    pub api_secret: String,
    /// Window for paths no [`RouteRule`] matches.
    pub default_limit: RateLimitConfig,
    pub rules: Vec<RouteRule>,
    /// Identify clients by the first `X-Forwarded-For` entry. Only enable this
    /// behind a proxy that sets the header.
    pub trust_forwarded_for: bool,
    /// Let `GET`, `HEAD` and `OPTIONS` through without credentials.
    pub allow_anonymous_reads: bool,
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field("api_secret", &"<redacted>")
            .field("default_limit", &self.default_limit)
            .field("rules", &self.rules)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("allow_anonymous_reads", &self.allow_anonymous_reads)
            .finish()
    }
}

impl GateConfig {
    /// Default limits, no route rules, credentials required on every method.
    pub fn new(api_secret: impl Into<String>) -> Self {
        Self {
            api_secret: api_secret.into(),
            default_limit: RateLimitConfig::default(),
            rules: Vec::new(),
            trust_forwarded_for: false,
            allow_anonymous_reads: false,
        }
    }

    /// Reads `UPGUARD_API_SECRET` (required) and the gate limits.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the secret is unset or blank.
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("UPGUARD_API_SECRET").unwrap_or_default();
        if secret.trim().is_empty() {
            return Err(Error::Config {
                field: "UPGUARD_API_SECRET",
                reason: "must be set to a non-empty value".into(),
            });
        }
        let defaults = RateLimitConfig::default();
        Ok(Self::new(secret.trim())
            .default_limit(RateLimitConfig::new(
                env_or("UPGUARD_GATE_MAX_REQUESTS", defaults.max_requests),
                Duration::from_secs(env_or(
                    "UPGUARD_GATE_WINDOW_SECS",
                    defaults.window.as_secs(),
                )),
            ))
            .trust_forwarded_for(env_flag("UPGUARD_TRUST_FORWARDED_FOR", false))
            .allow_anonymous_reads(env_flag("UPGUARD_GATE_ANONYMOUS_READS", false)))
    }

    /// Sets the window for unmatched paths.
    #[must_use]
    pub fn default_limit(mut self, limit: RateLimitConfig) -> Self {
        self.default_limit = limit;
        self
    }

    /// Counts paths starting with `prefix` under `category` with `limit`.
    #[must_use]
    pub fn rule(
        mut self,
        prefix: impl Into<String>,
        category: impl Into<String>,
        limit: RateLimitConfig,
    ) -> Self {
        self.rules.push(RouteRule {
            prefix: prefix.into(),
            category: category.into(),
            limit,
        });
        self
    }

    /// See [`GateConfig::trust_forwarded_for`](#structfield.trust_forwarded_for).
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// See [`GateConfig::allow_anonymous_reads`](#structfield.allow_anonymous_reads).
    #[must_use]
    pub fn allow_anonymous_reads(mut self, allow: bool) -> Self {
        self.allow_anonymous_reads = allow;
        self
    }

    /// The longest matching rule wins.
    fn category_for(&self, path: &str) -> (&str, &RateLimitConfig) {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| (rule.category.as_str(), &rule.limit))
            .unwrap_or((DEFAULT_CATEGORY, &self.default_limit))
    }
}

/// A request the gate let through.
#[derive(Debug, Clone)]
pub struct Admission {
    pub client: ClientId,
    pub category: String,
    /// The client's window after this request was counted.
    pub limit: RateLimitStatus,
}

struct GateInner {
    config: GateConfig,
    auth: ApiKeyAuth,
    limiter: Arc<RateLimiter>,
}

/// Throttling and authentication in front of route handlers.
///
/// Used as a [`Middleware`] layer it also stamps the [`ClientId`] into the
/// request extensions and adds `X-RateLimit-Limit` and `X-RateLimit-Remaining`
/// to admitted responses.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upguard::security::{GateConfig, RateLimitConfig, RequestGate};
/// use upguard::{Error, Request};
///
/// let gate = RequestGate::new(
///     GateConfig::new("s3cret").default_limit(RateLimitConfig::new(1, Duration::from_secs(60))),
/// )?;
/// let raw = b"POST /records/jobs HTTP/1.1\r\nAuthorization: Bearer s3cret\r\n\r\n";
/// let (request, _) = Request::parse(raw).unwrap();
///
/// let admitted = gate.check(&request)?;
/// assert_eq!(admitted.limit.remaining, 0);
/// assert!(matches!(gate.check(&request), Err(Error::RateLimited { .. })));
/// # Ok::<(), upguard::Error>(())
/// ```
#[derive(Clone)]
pub struct RequestGate {
    inner: Arc<GateInner>,
}

impl RequestGate {
    /// Builds a gate with its own limiter.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the secret is empty.
    pub fn new(config: GateConfig) -> Result<Self> {
        Self::with_limiter(config, Arc::new(RateLimiter::new()))
    }

    /// Shares an existing limiter, e.g. across several gates.
    pub fn with_limiter(config: GateConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let auth = ApiKeyAuth::new(config.api_secret.clone())?;
        Ok(Self {
            inner: Arc::new(GateInner {
                config,
                auth,
                limiter,
            }),
        })
    }

    /// The limiter, e.g. to [spawn its sweeper](RateLimiter::spawn_sweeper).
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// The configuration the gate was built with.
    pub fn config(&self) -> &GateConfig {
        &self.inner.config
    }

    /// Counts the request against its client's window.
    pub fn throttle(&self, request: &Request) -> (ClientId, String, RateLimitStatus) {
        let config = &self.inner.config;
        let client = ClientId(client_id(request, config.trust_forwarded_for));
        let (category, limit) = config.category_for(request.path());
        let status = self
            .inner
            .limiter
            .hit(&RateLimitKey::new(client.0.clone(), category), limit);
        (client, category.to_string(), status)
    }

    /// Verifies the request's credential. `GET`, `HEAD` and `OPTIONS` pass
    /// without one when anonymous reads are allowed.
    pub fn authorize(&self, request: &Request) -> Result<()> {
        let read = matches!(request.method(), Method::Get | Method::Head | Method::Options);
        if self.inner.config.allow_anonymous_reads && read {
            return Ok(());
        }
        self.inner.auth.verify(request.headers())
    }

    /// Throttles, then authorizes. Fails with [`Error::RateLimited`] or
    /// [`Error::Unauthorized`], in that order of precedence.
    pub fn check(&self, request: &Request) -> Result<Admission> {
        let (client, category, limit) = self.throttle(request);
        if !limit.allowed {
            warn!(
                client = %client,
                category = %category,
                retry_after_secs = limit.retry_after_secs,
                "rate limit exceeded"
            );
            return Err(Error::RateLimited {
                retry_after_secs: limit.retry_after_secs,
            });
        }
        if let Err(err) = self.authorize(request) {
            debug!(client = %client, path = %request.path(), "rejected unauthenticated request");
            return Err(err);
        }
        Ok(Admission {
            client,
            category,
            limit,
        })
    }
}

impl Middleware for RequestGate {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponse {
        let gate = self.clone();
        Box::pin(async move {
            let mut response = match gate.check(ctx.request()) {
                Ok(admission) => {
                    ctx.extensions_mut().insert(admission.client);
                    let mut response = next.run(ctx).await;
                    response.set_header("X-RateLimit-Limit", admission.limit.limit.to_string());
                    response.set_header(
                        "X-RateLimit-Remaining",
                        admission.limit.remaining.to_string(),
                    );
                    response
                }
                Err(err) => rejection(&err),
            };
            SecureHeaders::apply(&mut response);
            response
        })
    }
}

/// The JSON response for a gate rejection.
///
/// [`Error::RateLimited`] becomes `429` with `Retry-After`,
/// [`Error::Unauthorized`] becomes `401`. Anything else is a gate fault and
/// becomes a bare `500` that reveals nothing about the cause.
///
/// # Examples
///
/// ```
/// use upguard::security::rejection;
/// use upguard::{Error, StatusCode};
///
/// let response = rejection(&Error::RateLimited { retry_after_secs: 12 });
/// assert_eq!(response.status(), StatusCode::TooManyRequests);
/// assert_eq!(response.headers().get("Retry-After"), Some("12"));
/// ```
pub fn rejection(err: &Error) -> Response {
    match err {
        Error::RateLimited { retry_after_secs } => Response::json(
            StatusCode::TooManyRequests,
            &json!({ "error": "rate_limited", "retry_after": retry_after_secs }),
        )
        .header("Retry-After", retry_after_secs.to_string()),
        Error::Unauthorized => Response::json(
            StatusCode::Unauthorized,
            &json!({ "error": "unauthorized" }),
        ),
        other => {
            warn!(error = %other, "unexpected gate error");
            Response::json(
                StatusCode::InternalServerError,
                &json!({ "error": "internal" }),
            )
        }
    }
}

/// Response hardening headers. [`RequestGate`] applies them itself; use this
/// layer for routes that sit outside the gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureHeaders;

impl SecureHeaders {
    /// Names and values set on every response.
    pub const HEADERS: [(&'static str, &'static str); 3] = [
        ("X-Frame-Options", "DENY"),
        ("X-Content-Type-Options", "nosniff"),
        ("Referrer-Policy", "strict-origin-when-cross-origin"),
    ];

    /// Sets every header in [`SecureHeaders::HEADERS`], replacing existing values.
    pub fn apply(response: &mut Response) {
        for (name, value) in Self::HEADERS {
            response.set_header(name, value);
        }
    }
}

impl Middleware for SecureHeaders {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let mut response = next.run(ctx).await;
            Self::apply(&mut response);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Stack;

    const SECRET: &str = "gate-secret";

    fn request(method: &str, path: &str, extra: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: x\r\n{extra}\r\n");
        Request::parse(raw.as_bytes())
            .unwrap()
            .0
            .with_peer_addr("198.51.100.7:4000".parse().unwrap())
    }

    fn gate(max: u32) -> RequestGate {
        RequestGate::new(
            GateConfig::new(SECRET)
                .default_limit(RateLimitConfig::new(max, Duration::from_secs(60))),
        )
        .unwrap()
    }

    fn pipeline(gate: RequestGate) -> crate::middleware::Pipeline {
        Stack::new().layer(gate).endpoint(|ctx| async move {
            let client = ctx
                .extensions()
                .get::<ClientId>()
                .map(ToString::to_string)
                .unwrap_or_default();
            Response::new(StatusCode::Created).body(client)
        })
    }

    fn assert_hardened(response: &Response) {
        for (name, value) in SecureHeaders::HEADERS {
            assert_eq!(response.headers().get(name), Some(value), "{name}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_request_reaches_handler() {
        let pipeline = pipeline(gate(5));
        let response = pipeline
            .handle(request("POST", "/records/jobs", "Authorization: Bearer gate-secret\r\n"))
            .await;
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.body_ref(), b"198.51.100.7");
        assert_eq!(response.headers().get("x-ratelimit-limit"), Some("5"));
        assert_eq!(response.headers().get("x-ratelimit-remaining"), Some("4"));
        assert_hardened(&response);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_runs_before_auth() {
        let pipeline = pipeline(gate(1));
        let first = pipeline.handle(request("POST", "/records/jobs", "")).await;
        assert_eq!(first.status(), StatusCode::Unauthorized);

        // Unauthenticated and over the limit: the 429 wins.
        let second = pipeline.handle(request("POST", "/records/jobs", "")).await;
        assert_eq!(second.status(), StatusCode::TooManyRequests);
        assert_eq!(second.headers().get("retry-after"), Some("60"));
        assert_hardened(&second);
        let body: serde_json::Value = serde_json::from_slice(second.body_ref()).unwrap();
        assert_eq!(body["error"], "rate_limited");
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_responses_are_identical() {
        let pipeline = pipeline(gate(10));
        let missing = pipeline.handle(request("POST", "/records/jobs", "")).await;
        let wrong = pipeline
            .handle(request("POST", "/records/jobs", "X-API-Key: nope\r\n"))
            .await;
        assert_eq!(missing.status(), StatusCode::Unauthorized);
        assert_hardened(&missing);
        assert_eq!(missing.into_bytes(), wrong.into_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn limit_boundary_and_reset() {
        let gate = gate(2);
        let authed = || request("POST", "/records/jobs", "X-API-Key: gate-secret\r\n");
        assert!(gate.check(&authed()).is_ok());
        assert!(gate.check(&authed()).is_ok());
        assert!(matches!(
            gate.check(&authed()),
            Err(Error::RateLimited {
                retry_after_secs: 60
            })
        ));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(gate.check(&authed()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn route_rules_have_separate_windows() {
        let gate = RequestGate::new(
            GateConfig::new(SECRET)
                .default_limit(RateLimitConfig::new(1, Duration::from_secs(60)))
                .rule("/records", "writes", RateLimitConfig::new(2, Duration::from_secs(60)))
                .rule(
                    "/records/bulk",
                    "bulk",
                    RateLimitConfig::new(1, Duration::from_secs(60)),
                ),
        )
        .unwrap();
        let authed = |path: &str| request("POST", path, "X-API-Key: gate-secret\r\n");

        let admission = gate.check(&authed("/records/jobs")).unwrap();
        assert_eq!(admission.category, "writes");
        assert!(gate.check(&authed("/records/jobs")).is_ok());
        assert!(gate.check(&authed("/records/jobs")).is_err());

        assert_eq!(gate.check(&authed("/records/bulk")).unwrap().category, "bulk");
        assert_eq!(gate.check(&authed("/other")).unwrap().category, DEFAULT_CATEGORY);
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_reads_when_enabled() {
        let gate = RequestGate::new(GateConfig::new(SECRET).allow_anonymous_reads(true)).unwrap();
        assert!(gate.check(&request("GET", "/records/jobs", "")).is_ok());
        assert!(matches!(
            gate.check(&request("POST", "/records/jobs", "")),
            Err(Error::Unauthorized)
        ));
        assert!(gate.check(&request("HEAD", "/records/jobs", "")).is_ok());
    }

    #[tokio::test]
    async fn secure_headers_layer_alone() {
        let pipeline = Stack::new()
            .layer(SecureHeaders)
            .endpoint(|_ctx| async { Response::new(StatusCode::Ok) });
        let response = pipeline.handle(request("GET", "/health", "")).await;
        assert_hardened(&response);
    }

    #[test]
    fn rejection_maps_only_gate_outcomes_to_4xx() {
        let unauthorized = rejection(&Error::Unauthorized);
        assert_eq!(unauthorized.status(), StatusCode::Unauthorized);

        let fault = rejection(&Error::Config {
            field: "UPGUARD_API_SECRET",
            reason: "must not be empty".into(),
        });
        assert_eq!(fault.status(), StatusCode::InternalServerError);
        assert_eq!(fault.headers().get("Retry-After"), None);
        let body: serde_json::Value = serde_json::from_slice(fault.body_ref()).unwrap();
        assert_eq!(body, json!({ "error": "internal" }));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            RequestGate::new(GateConfig::new("")),
            Err(Error::Config { .. })
        ));
    }
}
