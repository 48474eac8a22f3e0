//! Rate limiting logic.

mod backend;
mod classes;
mod decision;
mod key;
mod limiter;
mod window;

pub use backend::RateLimiterBackend;
pub use classes::{
    LimitClass, LimitClassConfig, LimitRegistry, RegistryConfig, Resolution, DEFAULT_CLASS,
};
pub use decision::{Decision, FailurePolicy};
pub use key::{CounterKey, DEFAULT_KEY_PREFIX};
pub use limiter::{LimiterOptions, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use window::{TimeUnit, WindowMode, WindowSpec};
