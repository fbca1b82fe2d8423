//! Redis connection pool for the queue broker.
//!
//! Holds one lazily-established multiplexed connection shared by every
//! consumer loop in the process, guarded by a circuit breaker.

use std::future::Future;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitBreakerStats, CircuitState};

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl RedisPool {
    /// Create a new Redis pool. No connection is opened until first use.
    pub fn new(config: RedisConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
        })
    }

    /// Get the shared connection, establishing it if needed.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Execute a Redis command with circuit breaker protection.
    ///
    /// Connection-level failures drop the cached connection so the next call
    /// reconnects; this is what lets workers ride out a broker restart.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    tracing::warn!(error = %e, "Redis connection lost, will reconnect");
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation_is_lazy() {
        let config = RedisConfig::default();
        let pool = RedisPool::new(config, Arc::new(CircuitBreaker::new()));
        assert!(pool.is_ok());
        assert_eq!(pool.unwrap().circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisConfig {
            url: "not-a-url".to_string(),
            ..RedisConfig::default()
        };
        assert!(RedisPool::new(config, Arc::new(CircuitBreaker::new())).is_err());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let cb = Arc::new(CircuitBreaker::new());
        for _ in 0..5 {
            cb.record_failure();
        }
        let pool = RedisPool::new(RedisConfig::default(), cb).unwrap();
        assert!(matches!(pool.ping().await, Err(PoolError::CircuitOpen)));
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::CircuitOpen.to_string().contains("Circuit breaker"));
    }
}
