//! Process configuration.
//!
//! Every component owns a small config struct with sensible defaults and a
//! `from_env()` constructor. [`Config`] gathers them for the [`Shield`](crate::shield::Shield).
//!
//! Environment variables (all optional unless noted):
//!
//! | Variable                            | Default          |
//! |-------------------------------------|------------------|
//! | `UPGUARD_CACHE_DIR`                 | `.cache/upguard` |
//! | `UPGUARD_CACHE_MEMORY_ONLY`         | `false`          |
//! | `UPGUARD_CACHE_TTL_SECS`            | `300`            |
//! | `UPGUARD_CACHE_BACKGROUND_TASKS`    | `8`              |
//! | `UPGUARD_RETRY_MAX`                 | `3`              |
//! | `UPGUARD_RETRY_BASE_MS`             | `1000`           |
//! | `UPGUARD_RETRY_MAX_DELAY_MS`        | `30000`          |
//! | `UPGUARD_RETRY_FACTOR`              | `2.0`            |
//! | `UPGUARD_CIRCUIT_FAILURE_THRESHOLD` | `5`              |
//! | `UPGUARD_CIRCUIT_RECOVERY_SECS`     | `30`             |
//! | `UPGUARD_UPSTREAM_RPS`              | `10`             |
//! | `UPGUARD_UPSTREAM_TIMEOUT_SECS`     | `15`             |
//! | `UPGUARD_API_SECRET`                | required by gate |
//! | `UPGUARD_GATE_MAX_REQUESTS`         | `30`             |
//! | `UPGUARD_GATE_WINDOW_SECS`          | `60`             |
//! | `UPGUARD_TRUST_FORWARDED_FOR`       | `false`          |
//! | `UPGUARD_GATE_ANONYMOUS_READS`      | `false`          |
//! | `UPGUARD_AUDIT_CAPACITY`            | `1000`           |

use std::str::FromStr;

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::breaker::CircuitBreakerConfig;
use crate::cache::CacheConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::security::GateConfig;
use crate::upstream::UpstreamConfig;

/// Top-level configuration for a [`Shield`](crate::shield::Shield) and its gate.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub upstream: UpstreamConfig,
    pub audit_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            upstream: UpstreamConfig::default(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl Config {
    /// Loads every section from `UPGUARD_*` variables.
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            retry: RetryPolicy::from_env(),
            breaker: CircuitBreakerConfig::from_env(),
            upstream: UpstreamConfig::from_env(),
            audit_capacity: env_or("UPGUARD_AUDIT_CAPACITY", DEFAULT_AUDIT_CAPACITY),
        }
    }

    /// Loads the gate section. Fails when no API secret is configured.
    pub fn gate_from_env() -> Result<GateConfig> {
        GateConfig::from_env()
    }
}

/// Reads and parses an environment variable, falling back to `default` when the
/// variable is unset or unparsable.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        Err(_) => default,
    }
}

/// Reads a boolean flag; only `true`/`1`/`yes` (any case) enable it.
pub(crate) fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
