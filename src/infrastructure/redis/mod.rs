//! Redis connectivity for the queue broker
//!
//! - `CircuitBreaker`: stops hammering Redis while it is unavailable
//! - `pool`: shared multiplexed connection used by `RedisBroker`

mod circuit_breaker;
pub mod pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use pool::{PoolError, RedisPool};
