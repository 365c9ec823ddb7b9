//! The facade applications hold: cached reads, audited writes, health.
//!
//! A [`Shield`] is built once at startup and shared behind an `Arc`. Reads go
//! through the two-tier cache, which calls the upstream client on a miss or a
//! stale hit. Writes go straight to the upstream, then invalidate the cache keys
//! the caller names and append an audit entry.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{AuditEntry, AuditEvent, AuditLog};
use crate::breaker::CircuitSnapshot;
use crate::cache::{CacheHit, CacheStats, TwoTierCache};
use crate::clock::Clock;
use crate::config::Config;
use crate::degrade::{DegradationRegistry, DegradedFeature};
use crate::error::{Error, Result};
use crate::retry::Idempotency;
use crate::upstream::{Mutation, Query, Upstream, UpstreamClient};

/// Cache entries to drop after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// One exact key.
    Key(String),
    /// Every key under a resource namespace.
    Resource(String),
    /// The whole cache.
    All,
}

/// Outcome of [`Shield::write`].
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// The upstream's answer to the mutation.
    pub response: Value,
    /// The audit entry recorded for the write.
    pub audit: AuditEntry,
}

/// Point-in-time health of the layer.
///
/// `status` is `"ok"` while the circuit is closed and no feature is degraded,
/// `"degraded"` otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub circuit: CircuitSnapshot,
    pub degraded_features: Vec<DegradedFeature>,
    pub cache: CacheStats,
    pub audit_len: usize,
}

/// Cached reads, audited writes and health over one [`Upstream`].
///
/// See the [crate-level example](crate) for a complete setup.
#[derive(Debug)]
pub struct Shield {
    cache: Arc<TwoTierCache<Value>>,
    client: Arc<UpstreamClient>,
    degradation: Arc<DegradationRegistry>,
    audit: AuditLog,
    default_ttl: Duration,
}

impl Shield {
    /// Wires every component from `config`.
    ///
    /// # Errors
    ///
    /// Fails only if the durable cache directory cannot be created.
    pub fn from_config(
        config: &Config,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let degradation = Arc::new(DegradationRegistry::new());
        let cache = TwoTierCache::new(&config.cache, config.retry.clone(), clock)?
            .with_degradation(Arc::clone(&degradation));
        let client = UpstreamClient::new(
            upstream,
            &config.upstream,
            config.breaker.clone(),
            config.retry.clone(),
        );
        Ok(Self {
            cache: Arc::new(cache),
            client: Arc::new(client),
            degradation,
            audit: AuditLog::new(config.audit_capacity),
            default_ttl: config.cache.default_ttl,
        })
    }

    /// The two-tier cache backing [`Shield::read`].
    pub fn cache(&self) -> &Arc<TwoTierCache<Value>> {
        &self.cache
    }

    /// Per-resource degradation state and fallbacks.
    pub fn degradation(&self) -> &Arc<DegradationRegistry> {
        &self.degradation
    }

    /// The in-memory log of every write.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// The paced, retried and breaker-guarded upstream client.
    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    /// Registers the value served for `resource` when it is unavailable and
    /// nothing is cached.
    pub fn register_fallback(&self, resource: &str, value: Value) {
        self.degradation.register_fallback(resource, value);
    }

    /// Reads `resource` filtered by `query`, cached for `ttl` (or the default).
    ///
    /// # Errors
    ///
    /// Permanent upstream errors always propagate. Transient failures and an
    /// open circuit propagate only when nothing is cached and no fallback is
    /// registered for the resource.
    pub async fn read(
        &self,
        resource: &str,
        query: &Query,
        ttl: Option<Duration>,
    ) -> Result<CacheHit<Value>> {
        let key = query.cache_key(resource);
        let ttl = ttl.unwrap_or(self.default_ttl);
        let client = Arc::clone(&self.client);
        let owned_resource = resource.to_string();
        let owned_query = query.clone();
        let fetch = move || {
            let client = Arc::clone(&client);
            let resource = owned_resource.clone();
            let query = owned_query.clone();
            async move { client.fetch_once(&resource, &query).await }
        };

        match self.cache.get_or_fetch(&key, ttl, fetch).await {
            Ok(hit) => Ok(hit),
            Err(err) if err.is_retryable() || matches!(err, Error::CircuitOpen) => {
                match self.degradation.fallback_value::<Value>(resource) {
                    Some(data) => {
                        warn!(resource, key = %key, error = %err, "serving registered fallback");
                        Ok(CacheHit {
                            data,
                            is_stale: true,
                        })
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Applies `mutation` upstream, then drops the named cache entries and
    /// records an audit entry.
    ///
    /// # Errors
    ///
    /// Upstream failures are returned before anything is invalidated or audited.
    /// A failed invalidation is returned after the upstream write succeeded.
    pub async fn write(
        &self,
        actor: &str,
        mutation: &Mutation,
        idempotency: Idempotency,
        invalidations: &[Invalidation],
    ) -> Result<WriteOutcome> {
        let response = self.client.write(mutation, idempotency).await?;

        for invalidation in invalidations {
            match invalidation {
                Invalidation::Key(key) => self.cache.invalidate(key).await?,
                Invalidation::Resource(resource) => self.cache.invalidate_prefix(resource).await?,
                Invalidation::All => self.cache.invalidate_all().await?,
            }
        }
        debug!(
            resource = %mutation.resource,
            invalidations = invalidations.len(),
            "write applied"
        );

        let mut event = AuditEvent::new(actor, mutation.kind.as_str(), &mutation.resource);
        if let Some(id) = &mutation.record_id {
            event = event.resource_id(id);
        }
        let audit = self.audit.record(event);
        Ok(WriteOutcome { response, audit })
    }

    /// Snapshots the circuit, degraded features, cache counters and audit size.
    pub fn health(&self) -> HealthReport {
        let circuit = self.client.breaker().snapshot();
        let degraded_features = self.degradation.snapshot();
        let healthy = circuit.state == crate::breaker::CircuitState::Closed
            && degraded_features.iter().all(|feature| !feature.is_degraded);
        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            circuit,
            degraded_features,
            cache: self.cache.stats(),
            audit_len: self.audit.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::error::UpstreamError;
    use crate::retry::RetryPolicy;
    use crate::upstream::UpstreamConfig;
    use crate::upstream::fake::ScriptedUpstream;
    use serde_json::json;

    fn config() -> Config {
        Config {
            cache: CacheConfig::memory_only(),
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                recovery_timeout: Duration::from_secs(30),
            },
            upstream: UpstreamConfig {
                requests_per_second: 1_000,
                request_timeout: Duration::from_secs(5),
            },
            audit_capacity: 10,
        }
    }

    fn shield(upstream: &Arc<ScriptedUpstream>, clock: &Arc<ManualClock>) -> Shield {
        Shield::from_config(&config(), upstream.clone(), clock.clone()).unwrap()
    }

    fn down() -> Result<Value, UpstreamError> {
        Err(UpstreamError::Network("refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_cached() {
        let upstream = Arc::new(ScriptedUpstream::returning(json!([{"id": 1}])));
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        let query = Query::new().page(1, 20);

        let first = shield.read("jobs", &query, None).await.unwrap();
        let second = shield.read("jobs", &query, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(upstream.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_serves_registered_fallback() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        shield.register_fallback("jobs", json!([]));

        let hit = shield.read("jobs", &Query::new(), None).await.unwrap();
        assert_eq!(hit.data, json!([]));
        assert!(hit.is_stale);
        assert!(shield.degradation().is_degraded("jobs"));
        assert_eq!(shield.health().status, "degraded");
    }

    #[tokio::test(start_paused = true)]
    async fn outage_without_fallback_propagates() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        let err = shield.read("jobs", &Query::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::TransientUpstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_ignore_fallback() {
        let upstream = Arc::new(ScriptedUpstream::default().then(Err(UpstreamError::Http {
            status: 403,
            message: "forbidden".into(),
        })));
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        shield.register_fallback("jobs", json!([]));
        let err = shield.read("jobs", &Query::new(), None).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(403));
        assert!(!shield.degradation().is_degraded("jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_data_outlives_outage() {
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .then(Ok(json!("v1")))
                .then(down())
                .then(down()),
        );
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        let ttl = Some(Duration::from_secs(10));

        shield.read("jobs", &Query::new(), ttl).await.unwrap();
        clock.advance(Duration::from_secs(11));
        let hit = shield.read("jobs", &Query::new(), ttl).await.unwrap();
        assert_eq!(hit.data, json!("v1"));
        assert!(hit.is_stale);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let hit = shield.read("jobs", &Query::new(), ttl).await.unwrap();
        assert_eq!(hit.data, json!("v1"));
        assert!(shield.degradation().is_degraded("jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_invalidates_and_audits() {
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .then(Ok(json!(["old"])))
                .then(Ok(json!({"id": "j-9"})))
                .then(Ok(json!(["old", "new"]))),
        );
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);

        shield.read("jobs", &Query::new(), None).await.unwrap();
        let outcome = shield
            .write(
                "ana",
                &Mutation::update("jobs", "j-9", json!({"status": "closed"})),
                Idempotency::Idempotent,
                &[Invalidation::Resource("jobs".into())],
            )
            .await
            .unwrap();
        assert_eq!(outcome.response, json!({"id": "j-9"}));
        assert_eq!(outcome.audit.action, "update");
        assert_eq!(outcome.audit.resource_id.as_deref(), Some("j-9"));

        let hit = shield.read("jobs", &Query::new(), None).await.unwrap();
        assert_eq!(hit.data, json!(["old", "new"]));
        assert_eq!(shield.audit().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_touches_nothing() {
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .then(Ok(json!(["cached"])))
                .then(Err(UpstreamError::Validation("bad payload".into()))),
        );
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        shield.read("jobs", &Query::new(), None).await.unwrap();

        let result = shield
            .write(
                "ana",
                &Mutation::create("jobs", json!({})),
                Idempotency::NonIdempotent,
                &[Invalidation::All],
            )
            .await;
        assert!(matches!(result, Err(Error::PermanentUpstream(_))));
        assert!(shield.audit().is_empty());
        assert!(shield.cache().get("jobs").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn health_serializes() {
        let upstream = Arc::new(ScriptedUpstream::returning(json!(null)));
        let clock = Arc::new(ManualClock::new(0));
        let shield = shield(&upstream, &clock);
        let json = serde_json::to_value(shield.health()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["circuit"]["state"], "closed");
        assert_eq!(json["audit_len"], 0);
    }
}
