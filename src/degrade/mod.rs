//! Degradation registry: which features are currently running on fallbacks.
//!
//! Features are plain names (for cached reads, the resource namespace). A
//! feature can carry a registered static fallback value of any type. On failure
//! [`DegradationRegistry::with_fallback_or`] resolves in this order: mark the
//! feature degraded, run the fallback operation, use the registered value,
//! return the original error.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Default)]
struct FeatureState {
    degraded: bool,
    since: Option<DateTime<Utc>>,
    last_error: Option<String>,
    fallback: Option<Arc<dyn Any + Send + Sync>>,
}

/// A feature's state as reported by [`DegradationRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedFeature {
    pub name: String,
    pub is_degraded: bool,
    pub has_fallback: bool,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Process-wide record of degraded features and their fallbacks.
///
/// # Examples
///
/// ```
/// use upguard::DegradationRegistry;
///
/// let registry = DegradationRegistry::new();
/// registry.register_fallback("jobs", vec!["placeholder".to_string()]);
///
/// registry.mark_degraded("jobs", "upstream timed out");
/// assert!(registry.is_degraded("jobs"));
/// assert_eq!(
///     registry.fallback_value::<Vec<String>>("jobs"),
///     Some(vec!["placeholder".to_string()]),
/// );
///
/// registry.mark_recovered("jobs");
/// assert!(!registry.is_degraded("jobs"));
/// ```
#[derive(Default)]
pub struct DegradationRegistry {
    features: DashMap<String, FeatureState>,
}

impl fmt::Debug for DegradationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationRegistry")
            .field("features", &self.features.len())
            .finish()
    }
}

impl DegradationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `feature` visible in snapshots before it ever fails.
    pub fn register(&self, feature: &str) {
        self.features.entry(feature.to_string()).or_default();
    }

    /// Registers the value served for `feature` when its source is unavailable.
    pub fn register_fallback<T: Any + Send + Sync>(&self, feature: &str, value: T) {
        self.features
            .entry(feature.to_string())
            .or_default()
            .fallback = Some(Arc::new(value));
    }

    /// Flags `feature` as degraded. The first call records when; every call
    /// replaces the last error.
    pub fn mark_degraded(&self, feature: &str, reason: impl fmt::Display) {
        let reason = reason.to_string();
        let mut state = self.features.entry(feature.to_string()).or_default();
        if !state.degraded {
            warn!(feature, reason = %reason, "feature degraded");
            state.degraded = true;
            state.since = Some(Utc::now());
        }
        state.last_error = Some(reason);
    }

    /// Clears the degraded flag. Unknown features are ignored.
    pub fn mark_recovered(&self, feature: &str) {
        let Some(mut state) = self.features.get_mut(feature) else {
            return;
        };
        if state.degraded {
            state.degraded = false;
            state.since = None;
            info!(feature, "feature recovered");
        }
    }

    /// Returns `true` while `feature` is flagged degraded.
    pub fn is_degraded(&self, feature: &str) -> bool {
        self.features
            .get(feature)
            .is_some_and(|state| state.degraded)
    }

    /// The registered fallback for `feature`, if one of type `T` exists.
    pub fn fallback_value<T: Any + Clone>(&self, feature: &str) -> Option<T> {
        let fallback = self.features.get(feature)?.fallback.clone()?;
        fallback.downcast_ref::<T>().cloned()
    }

    /// Runs `op`; on failure marks `feature` degraded and serves the registered
    /// fallback value, or returns the error when there is none.
    pub async fn with_fallback<T, Fut>(&self, feature: &str, op: Fut) -> Result<T>
    where
        T: Any + Clone,
        Fut: Future<Output = Result<T>>,
    {
        match op.await {
            Ok(value) => {
                self.mark_recovered(feature);
                Ok(value)
            }
            Err(err) => {
                self.mark_degraded(feature, &err);
                self.fallback_value(feature).ok_or(err)
            }
        }
    }

    /// Like [`with_fallback`](Self::with_fallback) but tries `fallback_op`
    /// before the registered value.
    pub async fn with_fallback_or<T, Fut, G, GFut>(
        &self,
        feature: &str,
        op: Fut,
        fallback_op: G,
    ) -> Result<T>
    where
        T: Any + Clone,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        let err = match op.await {
            Ok(value) => {
                self.mark_recovered(feature);
                return Ok(value);
            }
            Err(err) => err,
        };
        self.mark_degraded(feature, &err);
        match fallback_op().await {
            Ok(value) => Ok(value),
            Err(fallback_err) => {
                warn!(feature, error = %fallback_err, "fallback operation failed");
                self.fallback_value(feature).ok_or(err)
            }
        }
    }

    /// Every known feature, sorted by name.
    pub fn snapshot(&self) -> Vec<DegradedFeature> {
        let mut features: Vec<DegradedFeature> = self
            .features
            .iter()
            .map(|item| DegradedFeature {
                name: item.key().clone(),
                is_degraded: item.degraded,
                has_fallback: item.fallback.is_some(),
                degraded_since: item.since,
                last_error: item.last_error.clone(),
            })
            .collect();
        features.sort_by(|a, b| a.name.cmp(&b.name));
        features
    }

    /// Names of features currently degraded.
    pub fn degraded(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|feature| feature.is_degraded)
            .map(|feature| feature.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, UpstreamError};

    fn outage() -> Error {
        UpstreamError::Network("connection refused".into()).into()
    }

    #[test]
    fn marks_and_recovers() {
        let registry = DegradationRegistry::new();
        assert!(!registry.is_degraded("jobs"));
        registry.mark_degraded("jobs", "timeout");
        assert!(registry.is_degraded("jobs"));
        let since = registry.snapshot()[0].degraded_since;

        registry.mark_degraded("jobs", "timeout again");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].degraded_since, since);
        assert_eq!(snapshot[0].last_error.as_deref(), Some("timeout again"));

        registry.mark_recovered("jobs");
        assert!(!registry.is_degraded("jobs"));
        assert!(registry.degraded().is_empty());
    }

    #[test]
    fn fallback_values_are_typed() {
        let registry = DegradationRegistry::new();
        registry.register_fallback("jobs", vec![1u32, 2]);
        assert_eq!(registry.fallback_value::<Vec<u32>>("jobs"), Some(vec![1, 2]));
        assert_eq!(registry.fallback_value::<String>("jobs"), None);
        assert_eq!(registry.fallback_value::<Vec<u32>>("unknown"), None);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let registry = DegradationRegistry::new();
        registry.mark_degraded("jobs", "old outage");
        let value = registry.with_fallback("jobs", async { Ok(5u32) }).await.unwrap();
        assert_eq!(value, 5);
        assert!(!registry.is_degraded("jobs"));
    }

    #[tokio::test]
    async fn failure_uses_registered_value() {
        let registry = DegradationRegistry::new();
        registry.register_fallback("jobs", 0u32);
        let value = registry
            .with_fallback("jobs", async { Err::<u32, _>(outage()) })
            .await
            .unwrap();
        assert_eq!(value, 0);
        assert!(registry.is_degraded("jobs"));
    }

    #[tokio::test]
    async fn failure_without_fallback_returns_original_error() {
        let registry = DegradationRegistry::new();
        let result = registry
            .with_fallback("jobs", async { Err::<u32, _>(outage()) })
            .await;
        assert!(matches!(result, Err(Error::TransientUpstream(_))));
        assert!(registry.is_degraded("jobs"));
    }

    #[tokio::test]
    async fn fallback_op_runs_before_registered_value() {
        let registry = DegradationRegistry::new();
        registry.register_fallback("jobs", 0u32);
        let value = registry
            .with_fallback_or("jobs", async { Err(outage()) }, || async { Ok(9u32) })
            .await
            .unwrap();
        assert_eq!(value, 9);

        let value = registry
            .with_fallback_or("jobs", async { Err(outage()) }, || async {
                Err::<u32, _>(Error::CircuitOpen)
            })
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn exhausted_fallbacks_return_original_error() {
        let registry = DegradationRegistry::new();
        let result = registry
            .with_fallback_or("jobs", async { Err::<u32, _>(outage()) }, || async {
                Err(Error::CircuitOpen)
            })
            .await;
        assert!(matches!(result, Err(Error::TransientUpstream(_))));
    }

    #[test]
    fn snapshot_is_sorted_and_serializable() {
        let registry = DegradationRegistry::new();
        registry.register("zeta");
        registry.register_fallback("alpha", "cached");
        registry.mark_degraded("mid", "boom");
        let names: Vec<_> = registry.snapshot().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json[0]["has_fallback"], true);
        assert_eq!(json[1]["is_degraded"], true);
    }
}
