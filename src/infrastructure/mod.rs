//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Application configuration and settings
//! - `error`: Unified error types
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool and migrations
//! - `redis`: Redis connection pool and circuit breaker

pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
