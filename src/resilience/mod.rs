pub mod circuit_breaker;
pub mod guard;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerConfig, BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use guard::{GuardError, GuardedOp, GuardedStore, OperationPolicy, PolicyTable, guard};
pub use rate_limiter::{
    Decision, LocalWindows, RateLimitBackend, RateLimitBackendError, RateLimitConfig, RateLimiter,
    Usage,
};
