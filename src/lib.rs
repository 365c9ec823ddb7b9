//! # upguard
//!
//! A caching and resilience layer in front of a slow, rate-limited upstream
//! record API.
//!
//! Reads are served from a two-tier cache (memory plus one JSON file per key)
//! with stale-while-revalidate refreshes and single-flight misses. Upstream
//! calls are paced, retried with exponential backoff and guarded by a circuit
//! breaker. Failing features degrade to registered fallbacks. The layer's own
//! write endpoints sit behind a request gate that throttles, authenticates and
//! hardens responses, and every write lands in an in-memory audit log.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use upguard::{
//!     Config, Query, Shield, SystemClock, Upstream, UpstreamError,
//!     upstream::Mutation,
//! };
//!
//! struct RecordApi;
//!
//! #[async_trait]
//! impl Upstream for RecordApi {
//!     async fn fetch(&self, _resource: &str, _query: &Query) -> Result<Value, UpstreamError> {
//!         Ok(json!([{ "id": "job-1", "status": "open" }]))
//!     }
//!
//!     async fn mutate(&self, mutation: &Mutation) -> Result<Value, UpstreamError> {
//!         Ok(mutation.payload.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shield = Shield::from_config(
//!         &Config::from_env(),
//!         Arc::new(RecordApi),
//!         Arc::new(SystemClock),
//!     )?;
//!     let jobs = shield.read("jobs", &Query::new().param("status", "open"), None).await?;
//!     println!("stale={} data={}", jobs.is_stale, jobs.data);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod background;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod degrade;
pub mod error;
pub mod http;
pub mod middleware;
pub mod retry;
pub mod security;
pub mod server;
pub mod shield;
pub mod upstream;

pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{CacheHit, CacheKey, TwoTierCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use degrade::DegradationRegistry;
pub use error::{Error, Result, UpstreamError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use retry::{Idempotency, RetryPolicy, run_with_retry};
pub use security::{GateConfig, RequestGate};
pub use server::{Server, ServerError};
pub use shield::{Invalidation, Shield};
pub use upstream::{Query, Upstream, UpstreamClient};
