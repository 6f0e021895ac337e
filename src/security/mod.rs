//! Origin checking and rate limiting for the HTTP transport.

pub mod origin;
pub mod rate_limiter;

pub use origin::{OriginCheck, OriginPolicy};
pub use rate_limiter::RateLimiter;
