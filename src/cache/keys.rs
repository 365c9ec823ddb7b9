//! Cache key convention: `resource:qualifier:qualifier...`.
//!
//! Qualifiers are escaped so a `:` inside a value can never forge an extra
//! segment, and key-value parameters are sorted so the same logical query always
//! renders the same key.

use std::fmt;

/// Separator between key segments.
pub const SEPARATOR: char = ':';

/// Builder for a cache key under one resource namespace.
///
/// # Examples
///
/// ```
/// use upguard::CacheKey;
///
/// let key = CacheKey::new("invoices").filter("status", "open").page(1, 20);
/// assert_eq!(key.build(), "invoices:status=open:page=1:limit=20");
///
/// // A separator inside a value cannot add a segment.
/// assert_eq!(CacheKey::new("a").with("b:c").build(), "a:b%3Ac");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    resource: String,
    qualifiers: Vec<String>,
}

impl CacheKey {
    /// Starts a key in the `resource` namespace.
    pub fn new(resource: impl AsRef<str>) -> Self {
        Self {
            resource: escape(resource.as_ref()),
            qualifiers: Vec::new(),
        }
    }

    /// Appends a free-form qualifier.
    #[must_use]
    pub fn with(mut self, qualifier: impl AsRef<str>) -> Self {
        self.qualifiers.push(escape(qualifier.as_ref()));
        self
    }

    /// Appends `page=<page>` and `limit=<limit>`.
    #[must_use]
    pub fn page(self, page: u32, limit: u32) -> Self {
        self.with(format!("page={page}")).with(format!("limit={limit}"))
    }

    /// Appends `field=value`.
    #[must_use]
    pub fn filter(self, field: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.with(format!("{}={}", field.as_ref(), value.as_ref()))
    }

    /// Appends every parameter as `name=value`, sorted by name then value.
    #[must_use]
    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        pairs.sort();
        for (field, value) in pairs {
            self = self.filter(field, value);
        }
        self
    }

    /// The escaped resource segment.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Renders the key.
    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        for qualifier in &self.qualifiers {
            write!(f, "{SEPARATOR}{qualifier}")?;
        }
        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

/// Whether `key` lives under the `resource` namespace.
pub fn belongs_to(key: &str, resource: &str) -> bool {
    let resource = escape(resource);
    key == resource
        || key
            .strip_prefix(resource.as_str())
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// The resource segment of a rendered key.
pub fn resource_of(key: &str) -> &str {
    key.split(SEPARATOR).next().unwrap_or(key)
}

fn escape(raw: &str) -> String {
    raw.replace('%', "%25").replace(SEPARATOR, "%3A")
}
