//! Job store factory

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::postgres::PostgresPool;

use super::memory_backend::MemoryJobStore;
use super::postgres_backend::PostgresJobStore;
use super::JobStore;

/// Create a job store based on configuration.
///
/// - `"postgres"`: `PostgresJobStore` when a pool is provided
/// - `"memory"` (default): `MemoryJobStore`
///
/// A Postgres backend requested without a pool falls back to memory with a
/// warning; that store is not shared between worker processes.
pub fn create_job_store(
    settings: &StoreConfig,
    postgres_pool: Option<PostgresPool>,
) -> Arc<dyn JobStore> {
    match settings.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(
                    backend = "postgres",
                    url = %pool.database_url_masked(),
                    "Creating PostgreSQL job store"
                );
                Arc::new(PostgresJobStore::new(pool))
            } else {
                tracing::warn!(
                    "PostgreSQL job store requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryJobStore::new())
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory job store");
            Arc::new(MemoryJobStore::new())
        }
    }
}
