//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::broker::QueueCounts;
use crate::store::JobStatus;

use super::{
    BROKER_DEAD_LETTERED_TOTAL, BROKER_QUEUE_DEPTH, BROKER_REDELIVERED_TOTAL,
    BROKER_RETRIES_TOTAL, DELIVERIES_TOTAL, JOBS_FINISHED_TOTAL, JOBS_RECONCILED_TOTAL,
    JOBS_REJECTED_TOTAL, JOBS_SUBMITTED_TOTAL, PROVIDER_SEND_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording job lifecycle metrics
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_submitted() {
        JOBS_SUBMITTED_TOTAL.inc();
    }

    pub fn record_rejected() {
        JOBS_REJECTED_TOTAL.inc();
    }

    /// Record a terminal transition
    pub fn record_finished(status: JobStatus) {
        JOBS_FINISHED_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_reconciled(count: u64) {
        JOBS_RECONCILED_TOTAL.inc_by(count);
    }
}

/// Helper struct for recording per-recipient delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_sent(latency: Duration) {
        DELIVERIES_TOTAL.with_label_values(&["sent"]).inc();
        PROVIDER_SEND_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_permanent_failure() {
        DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();
    }

    pub fn record_transient_failure() {
        DELIVERIES_TOTAL.with_label_values(&["deferred"]).inc();
    }

    pub fn record_skipped() {
        DELIVERIES_TOTAL.with_label_values(&["skipped"]).inc();
    }
}

/// Helper struct for recording broker metrics
pub struct BrokerMetrics;

impl BrokerMetrics {
    pub fn record_retry() {
        BROKER_RETRIES_TOTAL.inc();
    }

    pub fn record_dead_lettered() {
        BROKER_DEAD_LETTERED_TOTAL.inc();
    }

    pub fn record_redelivered(count: u64) {
        BROKER_REDELIVERED_TOTAL.inc_by(count);
    }

    /// Publish the latest queue counts as gauges
    pub fn record_counts(counts: &QueueCounts) {
        BROKER_QUEUE_DEPTH
            .with_label_values(&["waiting"])
            .set(counts.waiting as i64);
        BROKER_QUEUE_DEPTH
            .with_label_values(&["delayed"])
            .set(counts.delayed as i64);
        BROKER_QUEUE_DEPTH
            .with_label_values(&["active"])
            .set(counts.active as i64);
        BROKER_QUEUE_DEPTH
            .with_label_values(&["failed"])
            .set(counts.failed as i64);
    }
}
