//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::broker::QueueCounts;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: ComponentHealth,
    pub broker: BrokerHealth,
    pub provider: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub backend: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealth {
    pub backend: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub circuit_breaker_state: String,
    pub circuit_breaker_failures: u32,
}

/// Overall status: the store is required, broker and provider degrade.
fn overall_status(store_ok: bool, broker_ok: bool, provider_ok: bool) -> (StatusCode, &'static str) {
    match (store_ok, broker_ok && provider_ok) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        (true, false) => (StatusCode::OK, "degraded"),
        (true, true) => (StatusCode::OK, "healthy"),
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (store_ping, counts, check) = tokio::join!(
        state.store.ping(),
        state.broker.counts(),
        state.provider.test_connection(),
    );

    let store = ComponentHealth {
        backend: state.store.backend_name().to_string(),
        connected: store_ping.is_ok(),
        error: store_ping.err().map(|e| e.to_string()),
    };

    let broker = match counts {
        Ok(queue) => BrokerHealth {
            backend: state.broker.backend_name().to_string(),
            connected: true,
            queue: Some(queue),
            error: None,
        },
        Err(e) => BrokerHealth {
            backend: state.broker.backend_name().to_string(),
            connected: false,
            queue: None,
            error: Some(e.to_string()),
        },
    };

    let provider = ComponentHealth {
        backend: state.provider.name().to_string(),
        connected: check.ok,
        error: check.error,
    };

    let redis = state.redis_pool.as_ref().map(|pool| {
        let stats = pool.circuit_breaker_stats();
        RedisHealthResponse {
            circuit_breaker_state: stats.state.as_str().to_string(),
            circuit_breaker_failures: stats.failure_count,
        }
    });

    let (code, status) = overall_status(store.connected, broker.connected, provider.connected);
    if code != StatusCode::OK {
        tracing::warn!(error = ?store.error, "Health check failed: job store unreachable");
    }

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            store,
            broker,
            provider,
            redis,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        assert_eq!(overall_status(true, true, true), (StatusCode::OK, "healthy"));
        assert_eq!(overall_status(true, false, true), (StatusCode::OK, "degraded"));
        assert_eq!(overall_status(true, true, false), (StatusCode::OK, "degraded"));
        assert_eq!(
            overall_status(false, true, true),
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        );
    }
}
