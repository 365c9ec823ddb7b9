//! Client side of the upstream record API.
//!
//! [`Upstream`] is the contract a concrete HTTP client implements: fetch a named
//! resource, apply a mutation, get back an opaque JSON value. [`UpstreamClient`]
//! wraps any implementation with the protections every call needs:
//!
//! ```text
//! circuit breaker → outbound pacing (governor) → per-attempt timeout → Upstream
//! ```
//!
//! Retrying sits outside that stack, so every retry is paced and counted by the
//! breaker like any other call.

use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::CacheKey;
use crate::config::env_or;
use crate::error::{Error, Result, UpstreamError};
use crate::retry::{Idempotency, RetryPolicy, retry_default, run_with_retry, default_retry_predicate};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Filter and paging parameters for a fetch. Parameters are kept sorted so a
/// query renders a stable cache key.
///
/// # Examples
///
/// ```
/// use upguard::Query;
///
/// let query = Query::new().param("status", "open").page(2, 50);
/// assert_eq!(query.cache_key("jobs"), "jobs:limit=50:page=2:status=open");
/// assert_eq!(query.params()["status"], "open");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Query {
    params: BTreeMap<String, String>,
}

impl Query {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing any earlier value.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Sets the `page` and `limit` parameters.
    #[must_use]
    pub fn page(self, page: u32, limit: u32) -> Self {
        self.param("page", page).param("limit", limit)
    }

    /// Parameters sorted by name.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Returns `true` if no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Cache key for this query against `resource`.
    pub fn cache_key(&self, resource: &str) -> String {
        CacheKey::new(resource).params(&self.params).build()
    }
}

/// What a [`Mutation`] does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// The lowercase name, as recorded in the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A write against one upstream resource.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use upguard::upstream::{Mutation, MutationKind};
///
/// let close = Mutation::update("jobs", "job-7", json!({ "status": "closed" }));
/// assert_eq!(close.kind, MutationKind::Update);
/// assert_eq!(close.record_id.as_deref(), Some("job-7"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub resource: String,
    pub record_id: Option<String>,
    pub payload: Value,
}

impl Mutation {
    /// A new record with no id yet.
    pub fn create(resource: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Create,
            resource: resource.into(),
            record_id: None,
            payload,
        }
    }

    /// Replaces fields of the record `record_id`.
    pub fn update(resource: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Update,
            resource: resource.into(),
            record_id: Some(record_id.into()),
            payload,
        }
    }

    /// Removes the record `record_id`. The payload is `null`.
    pub fn delete(resource: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Delete,
            resource: resource.into(),
            record_id: Some(record_id.into()),
            payload: Value::Null,
        }
    }
}

/// The upstream record API.
///
/// Implementations report failures as [`UpstreamError`]; the client classifies
/// them as transient or permanent. Retrying, pacing and timeouts are applied
/// by [`UpstreamClient`], never by the implementation.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Reads the records of `resource` matching `query`.
    async fn fetch(&self, resource: &str, query: &Query) -> Result<Value, UpstreamError>;

    /// Applies `mutation` and returns the upstream's answer.
    async fn mutate(&self, mutation: &Mutation) -> Result<Value, UpstreamError>;
}

/// Outbound pacing and per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Outbound calls allowed per second. Zero is treated as one.
    pub requests_per_second: u32,
    /// Deadline for a single attempt.
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl UpstreamConfig {
    /// Reads `UPGUARD_UPSTREAM_RPS` and `UPGUARD_UPSTREAM_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests_per_second: env_or("UPGUARD_UPSTREAM_RPS", defaults.requests_per_second),
            request_timeout: Duration::from_secs(env_or(
                "UPGUARD_UPSTREAM_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
        }
    }
}

/// An [`Upstream`] behind a breaker, a pacer, a timeout and a retry policy.
pub struct UpstreamClient {
    upstream: Arc<dyn Upstream>,
    pacer: DirectRateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Wraps `upstream` with a breaker named `"upstream"`, a pacer and `retry`.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        config: &UpstreamConfig,
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            upstream,
            pacer: RateLimiter::direct(Quota::per_second(rate)),
            breaker: CircuitBreaker::new("upstream", breaker),
            retry,
            timeout: config.request_timeout,
        }
    }

    /// The breaker every attempt passes through.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The policy used by [`UpstreamClient::read`].
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// One protected fetch attempt, without retries.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when the breaker rejects the call, a timeout as
    /// [`Error::TransientUpstream`], otherwise the classified upstream error.
    pub async fn fetch_once(&self, resource: &str, query: &Query) -> Result<Value> {
        self.breaker
            .execute(|| self.attempt(self.upstream.fetch(resource, query)))
            .await
    }

    /// Fetches `resource`, retrying transient failures per policy.
    pub async fn read(&self, resource: &str, query: &Query) -> Result<Value> {
        retry_default(&self.retry, || self.fetch_once(resource, query)).await
    }

    /// One protected mutation attempt, without retries.
    pub async fn write_once(&self, mutation: &Mutation) -> Result<Value> {
        self.breaker
            .execute(|| self.attempt(self.upstream.mutate(mutation)))
            .await
    }

    /// Applies `mutation`. Only idempotent mutations are retried.
    pub async fn write(&self, mutation: &Mutation, idempotency: Idempotency) -> Result<Value> {
        let policy = self.retry.for_idempotency(idempotency);
        run_with_retry(&policy, || self.write_once(mutation), default_retry_predicate).await
    }

    async fn attempt<T>(&self, call: impl Future<Output = Result<T, UpstreamError>>) -> Result<T> {
        self.pacer.until_ready().await;
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "upstream attempt timed out");
                Err(UpstreamError::Timeout(self.timeout).into())
            }
        }
    }
}
