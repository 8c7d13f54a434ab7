pub mod api_key;
pub mod rate_limit;
pub mod request_log;

pub use api_key::{api_key_middleware, ApiKeyGuard};
pub use rate_limit::{rate_limit_middleware, RateLimiter};
pub use request_log::request_log_middleware;
