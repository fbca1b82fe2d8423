//! Prometheus metrics for the delivery service.
//!
//! - Job metrics (submitted, terminal outcome by status)
//! - Delivery metrics (per-recipient outcome, provider latency)
//! - Broker metrics (retries, dead letters, queue depth)
//! - Reconciliation metrics

mod helpers;

pub use helpers::{encode_metrics, BrokerMetrics, DeliveryMetrics, JobMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_delivery";

lazy_static! {
    // ============================================================================
    // Job Metrics
    // ============================================================================

    /// Jobs accepted by the dispatcher
    pub static ref JOBS_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_submitted_total", METRIC_PREFIX),
        "Total jobs accepted for delivery"
    ).unwrap();

    /// Jobs rejected at submission
    pub static ref JOBS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_rejected_total", METRIC_PREFIX),
        "Total submissions rejected by validation"
    ).unwrap();

    /// Jobs reaching a terminal status
    pub static ref JOBS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_finished_total", METRIC_PREFIX),
        "Total jobs reaching a terminal status",
        &["status"]
    ).unwrap();

    /// Jobs re-enqueued by the reconciliation sweep
    pub static ref JOBS_RECONCILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_jobs_reconciled_total", METRIC_PREFIX),
        "Total jobs re-enqueued by reconciliation"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Per-recipient delivery outcomes
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Per-recipient delivery outcomes",
        &["outcome"]
    ).unwrap();

    /// Provider send latency
    pub static ref PROVIDER_SEND_LATENCY: Histogram = register_histogram!(
        format!("{}_provider_send_latency_seconds", METRIC_PREFIX),
        "Provider send latency in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Pointers scheduled for another attempt
    pub static ref BROKER_RETRIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_retries_total", METRIC_PREFIX),
        "Total pointer retries scheduled"
    ).unwrap();

    /// Pointers moved to the dead-letter set
    pub static ref BROKER_DEAD_LETTERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_dead_lettered_total", METRIC_PREFIX),
        "Total pointers moved to the dead-letter set"
    ).unwrap();

    /// Stalled deliveries returned to the queue after the visibility timeout
    pub static ref BROKER_REDELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_redelivered_total", METRIC_PREFIX),
        "Total stalled deliveries returned to the queue"
    ).unwrap();

    /// Queue depth by state
    pub static ref BROKER_QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_broker_queue_depth", METRIC_PREFIX),
        "Pointers per broker state",
        &["state"]
    ).unwrap();
}
