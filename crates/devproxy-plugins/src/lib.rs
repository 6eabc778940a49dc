//! The behavior plugins: mock responses, random errors, latency injection,
//! rate limiting (request-count and LM-token), retry-after enforcement, and
//! recording. Each is a `devproxy_core::Plugin` implementation; none of them
//! know anything about CONNECT tunnels or TLS — they only see the
//! transport-agnostic request/response model.

pub mod latency;
pub mod mock;
pub mod random_error;
pub mod rate_limit_count;
pub mod rate_limit_tokens;
pub mod recording;
pub mod retry_after;
mod window;

pub use latency::LatencyInjector;
pub use mock::MockEngine;
pub use random_error::RandomErrorEngine;
pub use rate_limit_count::RateLimitCount;
pub use rate_limit_tokens::RateLimitTokens;
pub use recording::{RecordingController, RequestLog};
pub use retry_after::RetryAfterEnforcer;
