//! Queue broker factory

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::redis::RedisPool;

use super::memory_backend::MemoryBroker;
use super::redis_backend::RedisBroker;
use super::QueueBroker;

/// Create a queue broker based on configuration.
///
/// - `"redis"`: `RedisBroker` if a Redis pool is provided
/// - `"memory"` (default): `MemoryBroker`
///
/// A memory broker cannot be shared with worker processes, so it only makes
/// sense when the API and workers run in the same binary.
pub fn create_broker(
    settings: &BrokerConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn QueueBroker> {
    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.prefix,
                    "Creating Redis queue broker"
                );
                Arc::new(
                    RedisBroker::new(pool, settings.prefix.clone())
                        .with_dead_letter_limit(settings.dead_letter_limit),
                )
            } else {
                tracing::warn!("Redis broker requested but no pool provided, falling back to memory");
                Arc::new(MemoryBroker::with_dead_letter_limit(settings.dead_letter_limit))
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory queue broker");
            Arc::new(MemoryBroker::with_dead_letter_limit(settings.dead_letter_limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_default() {
        let broker = create_broker(&BrokerConfig::default(), None);
        assert_eq!(broker.backend_name(), "memory");
    }

    #[test]
    fn test_redis_without_pool_falls_back() {
        let settings = BrokerConfig {
            backend: "redis".to_string(),
            ..Default::default()
        };
        assert_eq!(create_broker(&settings, None).backend_name(), "memory");
    }
}
