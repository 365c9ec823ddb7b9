//! Inbound protection for the layer's own endpoints: fixed-window rate
//! limiting, API key authentication and response hardening.

pub mod auth;
pub mod middleware;
pub mod rate_limit;

pub use auth::{ApiKeyAuth, constant_time_eq, extract_credential};
pub use middleware::{
    Admission, ClientId, DEFAULT_CATEGORY, GateConfig, RequestGate, RouteRule, SecureHeaders,
    rejection,
};
pub use rate_limit::{
    RateLimitConfig, RateLimitKey, RateLimitStatus, RateLimiter, UNKNOWN_CLIENT, client_id,
};
