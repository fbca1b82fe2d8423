//! Per-job fan-out: render, send and record one outcome per recipient.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryHandler, HandlerError};
use crate::config::WorkerConfig;
use crate::error::AppError;
use crate::metrics::{DeliveryMetrics, JobMetrics};
use crate::provider::{Envelope, Provider, ProviderError};
use crate::store::{
    AuditAction, AuditEntry, DeliveryClaim, DeliveryLog, DeliveryUpdate, FinalizeMode, Job, JobStore,
    ProcessingStart, Recipient,
};
use crate::telemetry::attributes;
use crate::template::{CompiledTemplate, RenderedMessage, TemplateEngine, RECIPIENT_SCOPE};

/// Actor recorded on audit entries written by workers
pub const WORKER_ACTOR: &str = "worker";

/// Row lease held past the send timeout while the outcome is written
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// What happened to one recipient during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    /// Transient failure; the row stays pending
    Deferred(String),
    /// Cancel flag was raised before the send
    Skipped,
    /// Another worker finished the row first
    Settled,
    /// Another worker holds the row lease
    InFlight,
}

/// Compiled message for one job, rendered once when no placeholder depends
/// on the recipient.
struct MessagePlan {
    compiled: Arc<CompiledTemplate>,
    variables: Map<String, Value>,
    validate: bool,
    shared: Option<Result<RenderedMessage, String>>,
}

impl MessagePlan {
    fn new(compiled: Arc<CompiledTemplate>, variables: Map<String, Value>, validate: bool) -> Self {
        let shared = if compiled.is_per_recipient() {
            None
        } else if validate {
            Some(
                compiled
                    .validate_job_data(&variables)
                    .map(|_| compiled.render_unchecked(&variables))
                    .map_err(|e| e.to_string()),
            )
        } else {
            Some(Ok(compiled.render_unchecked(&variables)))
        };

        Self {
            compiled,
            variables,
            validate,
            shared,
        }
    }

    fn render_for(&self, recipient: &Recipient) -> Result<RenderedMessage, String> {
        if let Some(shared) = &self.shared {
            return shared.clone();
        }

        let mut data = self.variables.clone();
        data.insert(RECIPIENT_SCOPE.to_string(), recipient.template_scope());
        if self.validate {
            self.compiled.render(&data).map_err(|e| e.to_string())
        } else {
            Ok(self.compiled.render_unchecked(&data))
        }
    }
}

/// Delivery handler driving one job per reserved pointer.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    templates: Arc<TemplateEngine>,
    provider: Arc<dyn Provider>,
    fanout_width: usize,
    send_timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        templates: Arc<TemplateEngine>,
        provider: Arc<dyn Provider>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            templates,
            provider,
            fanout_width: config.fanout_width.max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms.max(1)),
        }
    }

    #[tracing::instrument(
        skip(self, delivery),
        fields(job_id = %delivery.pointer.job_id, attempt = delivery.attempt)
    )]
    async fn process(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let job_id = delivery.pointer.job_id;
        let span = tracing::Span::current();
        for kv in [
            attributes::job_id(job_id),
            attributes::broker_id(&delivery.broker_id),
            attributes::attempt(delivery.attempt),
            attributes::provider(self.provider.name()),
        ] {
            span.set_attribute(kv.key, kv.value);
        }

        let job = match self
            .store
            .begin_processing(job_id, &delivery.external_id())
            .await
            .map_err(retryable)?
        {
            ProcessingStart::Started(job) => job,
            ProcessingStart::Finished(job) => {
                tracing::debug!(status = %job.status, "Job already finished, acknowledging");
                return Ok(());
            }
            ProcessingStart::Missing => {
                return Err(HandlerError::Fatal(format!("job {} not found", job_id)));
            }
        };

        if job.cancel_requested {
            return self.finish(job_id, FinalizeMode::Cancelled).await;
        }

        let plan = match self.plan(&job).await {
            Ok(plan) => plan,
            Err(e @ (AppError::Validation(_) | AppError::NotFound(_))) => {
                // The template vanished or was deactivated after submission
                tracing::warn!(error = %e, "Template unusable, failing job");
                return self.finish(job_id, FinalizeMode::Exhausted(e.to_string())).await;
            }
            Err(e) => return Err(retryable(e)),
        };

        let pending = self
            .store
            .pending_deliveries(job_id)
            .await
            .map_err(retryable)?;
        tracing::debug!(pending = pending.len(), total = job.total_count, "Fanning out");

        let owner = delivery.external_id();
        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|row| self.deliver(&job, &plan, &owner, row))
            .buffer_unordered(self.fanout_width)
            .collect()
            .await;

        let mut cancelled = false;
        let mut in_flight = 0;
        let mut last_transient = None;
        for outcome in outcomes {
            match outcome {
                Outcome::Skipped => cancelled = true,
                Outcome::InFlight => in_flight += 1,
                Outcome::Deferred(error) => last_transient = Some(error),
                Outcome::Sent | Outcome::Failed | Outcome::Settled => {}
            }
        }

        // Leave the job to the worker still sending
        if in_flight > 0 {
            tracing::info!(in_flight, "Recipients leased by another worker, retrying later");
            return Err(HandlerError::Retryable(format!(
                "{} recipient(s) in flight elsewhere",
                in_flight
            )));
        }

        if cancelled || self.is_cancel_requested(job_id).await {
            return self.finish(job_id, FinalizeMode::Cancelled).await;
        }
        if let Some(error) = last_transient {
            return Err(HandlerError::Retryable(error));
        }
        self.finish(job_id, FinalizeMode::Delivered).await
    }

    async fn plan(&self, job: &Job) -> Result<MessagePlan, AppError> {
        match &job.template_ref {
            Some(template_ref) => {
                let compiled = self.templates.prepare(template_ref).await?;
                Ok(MessagePlan::new(compiled, job.variables.clone(), true))
            }
            None => {
                let compiled = CompiledTemplate::inline(
                    job.subject.as_deref().unwrap_or_default(),
                    job.body.as_deref().unwrap_or_default(),
                );
                Ok(MessagePlan::new(
                    Arc::new(compiled),
                    job.variables.clone(),
                    false,
                ))
            }
        }
    }

    async fn deliver(
        &self,
        job: &Job,
        plan: &MessagePlan,
        owner: &str,
        row: DeliveryLog,
    ) -> Outcome {
        if self.is_cancel_requested(job.id).await {
            DeliveryMetrics::record_skipped();
            return Outcome::Skipped;
        }

        let lease = self.send_timeout + LEASE_MARGIN;
        match self
            .store
            .claim_delivery(job.id, &row.recipient_id, owner, lease)
            .await
        {
            Ok(DeliveryClaim::Acquired) => {}
            Ok(DeliveryClaim::Settled) => return Outcome::Settled,
            Ok(DeliveryClaim::Held) => {
                tracing::debug!(recipient_id = %row.recipient_id, "Recipient leased elsewhere");
                return Outcome::InFlight;
            }
            Err(e) => {
                tracing::warn!(
                    recipient_id = %row.recipient_id,
                    error = %e,
                    "Failed to lease recipient"
                );
                return Outcome::Deferred(format!("store error: {}", e));
            }
        }

        let recipient = row.recipient();
        let rendered = match plan.render_for(&recipient) {
            Ok(rendered) => rendered,
            Err(error) => {
                DeliveryMetrics::record_permanent_failure();
                tracing::warn!(recipient_id = %recipient.id, error = %error, "Render failed");
                return self
                    .record(job.id, &recipient.id, DeliveryUpdate::Failed { error })
                    .await;
            }
        };

        let envelope = Envelope {
            job_id: job.id,
            recipient_id: recipient.id.clone(),
            to_address: recipient.address,
            to_name: recipient.name,
            subject: rendered.subject,
            body: rendered.body,
        };

        let start = Instant::now();
        let send = self.provider.send(&envelope);
        let result = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            ))),
        };

        match result {
            Ok(receipt) => {
                DeliveryMetrics::record_sent(start.elapsed());
                tracing::debug!(
                    recipient_id = %envelope.recipient_id,
                    provider = self.provider.name(),
                    message_id = ?receipt.provider_message_id,
                    "Delivered"
                );
                self.record(
                    job.id,
                    &envelope.recipient_id,
                    DeliveryUpdate::Sent {
                        provider_message_id: receipt.provider_message_id,
                    },
                )
                .await
            }
            Err(ProviderError::Permanent(error)) => {
                DeliveryMetrics::record_permanent_failure();
                tracing::info!(
                    recipient_id = %envelope.recipient_id,
                    error = %error,
                    "Permanent delivery failure"
                );
                self.record(job.id, &envelope.recipient_id, DeliveryUpdate::Failed { error })
                    .await
            }
            Err(ProviderError::Transient(error)) => {
                DeliveryMetrics::record_transient_failure();
                tracing::info!(
                    recipient_id = %envelope.recipient_id,
                    error = %error,
                    "Transient delivery failure, recipient stays pending"
                );
                if let Err(e) = self
                    .store
                    .record_transient(job.id, &envelope.recipient_id, &error)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to record transient error");
                }
                Outcome::Deferred(error)
            }
        }
    }

    /// Persist a final outcome. A failed write leaves the row pending so the
    /// pointer is retried.
    async fn record(&self, job_id: Uuid, recipient_id: &str, update: DeliveryUpdate) -> Outcome {
        let sent = matches!(update, DeliveryUpdate::Sent { .. });
        match self.store.record_delivery(job_id, recipient_id, update).await {
            Ok(_) if sent => Outcome::Sent,
            Ok(_) => Outcome::Failed,
            Err(e) => {
                tracing::error!(recipient_id, error = %e, "Failed to record delivery outcome");
                Outcome::Deferred(format!("store error: {}", e))
            }
        }
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> bool {
        match self.store.is_cancel_requested(job_id).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cancel flag");
                false
            }
        }
    }

    async fn finish(&self, job_id: Uuid, mode: FinalizeMode) -> Result<(), HandlerError> {
        match self.store.finalize_job(job_id, mode).await.map_err(retryable)? {
            Some(job) => {
                JobMetrics::record_finished(job.status);
                self.audit(AuditEntry::for_terminal(&job, WORKER_ACTOR)).await;
                tracing::info!(
                    job_id = %job.id,
                    status = %job.status,
                    sent = job.sent_count,
                    failed = job.failed_count,
                    total = job.total_count,
                    "Job finished"
                );
            }
            None => tracing::debug!(job_id = %job_id, "Job was already terminal"),
        }
        Ok(())
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::warn!(error = %e, "Failed to append audit entry");
        }
    }
}

fn retryable(error: impl std::fmt::Display) -> HandlerError {
    HandlerError::Retryable(error.to_string())
}

#[async_trait]
impl DeliveryHandler for JobProcessor {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.process(delivery).await
    }

    /// Fail every still-pending recipient with the last error.
    async fn on_exhausted(&self, delivery: &Delivery, reason: &str) {
        let job_id = delivery.pointer.job_id;
        match self
            .store
            .finalize_job(job_id, FinalizeMode::Exhausted(reason.to_string()))
            .await
        {
            Ok(Some(job)) => {
                JobMetrics::record_finished(job.status);
                self.audit(
                    AuditEntry::new(WORKER_ACTOR, AuditAction::JobDeadLettered)
                        .job(job_id)
                        .detail(json!({
                            "broker_id": delivery.broker_id,
                            "attempts": delivery.attempt,
                            "reason": reason,
                            "sent": job.sent_count,
                            "failed": job.failed_count,
                        })),
                )
                .await;
                tracing::warn!(
                    job_id = %job_id,
                    attempts = delivery.attempt,
                    reason = %reason,
                    "Job failed after exhausting retries"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to finalize exhausted job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Pointer;
    use crate::provider::{ConnectionCheck, SendReceipt};
    use crate::store::{DeliveryStatus, JobStatus, MemoryJobStore, NewJob};
    use chrono::Utc;
    use std::sync::Mutex;

    /// Permanently rejects addresses starting with "bad", records the rest.
    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
            if envelope.to_address.starts_with("bad") {
                return Err(ProviderError::Permanent("mailbox unavailable".into()));
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(SendReceipt {
                provider_message_id: Some(format!("m-{}", envelope.recipient_id)),
            })
        }

        async fn test_connection(&self) -> ConnectionCheck {
            ConnectionCheck::healthy()
        }
    }

    fn recipient(id: &str, address: &str) -> Recipient {
        Recipient {
            id: id.into(),
            address: address.into(),
            name: Some(id.to_uppercase()),
        }
    }

    /// Holds every send for `delay` before accepting it.
    struct SlowProvider {
        delay: Duration,
        sent: Mutex<Vec<String>>,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(envelope.recipient_id.clone());
            Ok(SendReceipt {
                provider_message_id: None,
            })
        }

        async fn test_connection(&self) -> ConnectionCheck {
            ConnectionCheck::healthy()
        }
    }

    /// Raises the job's cancel flag right after accepting the first send.
    struct CancellingProvider {
        store: Arc<dyn JobStore>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for CancellingProvider {
        fn name(&self) -> &'static str {
            "cancelling"
        }

        async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, ProviderError> {
            self.sent.lock().unwrap().push(envelope.recipient_id.clone());
            self.store.request_cancel(envelope.job_id).await.unwrap();
            Ok(SendReceipt {
                provider_message_id: None,
            })
        }

        async fn test_connection(&self) -> ConnectionCheck {
            ConnectionCheck::healthy()
        }
    }

    type Setup = (Arc<dyn JobStore>, Arc<RecordingProvider>, JobProcessor, Uuid);

    async fn setup(recipients: Vec<Recipient>) -> Setup {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(RecordingProvider::default());
        let (processor, id) =
            setup_with(store.clone(), provider.clone(), WorkerConfig::default(), recipients).await;
        (store, provider, processor, id)
    }

    async fn setup_with(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn Provider>,
        config: WorkerConfig,
        recipients: Vec<Recipient>,
    ) -> (JobProcessor, Uuid) {
        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(TemplateEngine::new(store.clone())),
            provider,
            &config,
        );

        let job = store
            .create_job(
                NewJob {
                    id: Uuid::new_v4(),
                    template_ref: None,
                    subject: Some("Hello {{ recipient.name }}".into()),
                    body: Some("Body".into()),
                    variables: Map::new(),
                    recipients,
                    priority: 1,
                    scheduled_for: None,
                    created_by: "tester".into(),
                },
                AuditEntry::new("tester", AuditAction::JobSubmitted),
            )
            .await
            .unwrap();
        (processor, job.id)
    }

    fn delivery(job_id: Uuid) -> Delivery {
        redelivery(job_id, 1)
    }

    fn redelivery(job_id: Uuid, attempt: u32) -> Delivery {
        Delivery {
            broker_id: "b1".into(),
            pointer: Pointer { job_id },
            attempt,
            priority: 1,
        }
    }

    #[tokio::test]
    async fn test_renders_per_recipient() {
        let (store, provider, processor, id) =
            setup(vec![recipient("u1", "one@example.com")]).await;

        processor.handle(&delivery(id)).await.unwrap();

        let sent = provider.sent.lock().unwrap().clone();
        assert_eq!(sent[0].subject, "Hello U1");
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.external_id.as_deref(), Some("b1#1"));
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_block_others() {
        let (store, _provider, processor, id) = setup(vec![
            recipient("u1", "one@example.com"),
            recipient("u2", "bad@example.com"),
            recipient("u3", "three@example.com"),
        ])
        .await;

        processor.handle(&delivery(id)).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.sent_count, job.failed_count), (2, 1));

        let rows = store.list_deliveries(id).await.unwrap();
        let failed = rows.iter().find(|r| r.recipient_id == "u2").unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("mailbox unavailable"));
    }

    #[tokio::test]
    async fn test_all_permanent_failures_fail_job() {
        let (store, _provider, processor, id) =
            setup(vec![recipient("u1", "bad@example.com")]).await;

        processor.handle(&delivery(id)).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_flag_skips_sends() {
        let (store, provider, processor, id) =
            setup(vec![recipient("u1", "one@example.com")]).await;
        store.request_cancel(id).await.unwrap();

        processor.handle(&delivery(id)).await.unwrap();

        assert!(provider.sent.lock().unwrap().is_empty());
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.sent_count + job.failed_count, job.total_count);
    }

    #[tokio::test]
    async fn test_missing_job_is_fatal() {
        let (_store, _provider, processor, _id) =
            setup(vec![recipient("u1", "one@example.com")]).await;
        let result = processor.handle(&delivery(Uuid::new_v4())).await;
        assert!(matches!(result, Err(HandlerError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_on_exhausted_fails_job() {
        let (store, _provider, processor, id) =
            setup(vec![recipient("u1", "one@example.com")]).await;

        processor.on_exhausted(&delivery(id), "smtp unreachable").await;

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("smtp unreachable"));
        let audit = store.list_audit(Some(id), 10).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::JobDeadLettered);
        assert!(Utc::now() >= job.updated_at);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_sent_rows() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(CancellingProvider {
            store: store.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let config = WorkerConfig {
            fanout_width: 1,
            ..WorkerConfig::default()
        };
        let (processor, id) = setup_with(
            store.clone(),
            provider.clone(),
            config,
            vec![
                recipient("u1", "one@example.com"),
                recipient("u2", "two@example.com"),
                recipient("u3", "three@example.com"),
            ],
        )
        .await;

        processor.handle(&delivery(id)).await.unwrap();

        let sent = provider.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!((job.sent_count, job.failed_count), (1, 2));

        let rows = store.list_deliveries(id).await.unwrap();
        for row in rows {
            if row.recipient_id == sent[0] {
                assert_eq!(row.status, DeliveryStatus::Sent);
            } else {
                assert_eq!(row.status, DeliveryStatus::Failed);
                assert_eq!(row.error.as_deref(), Some("cancelled"));
            }
        }
    }

    #[tokio::test]
    async fn test_send_timeout_is_transient() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(500)));
        let config = WorkerConfig {
            send_timeout_ms: 20,
            ..WorkerConfig::default()
        };
        let (processor, id) = setup_with(
            store.clone(),
            provider.clone(),
            config,
            vec![recipient("u1", "one@example.com")],
        )
        .await;

        let result = processor.handle(&delivery(id)).await;
        match result {
            Err(HandlerError::Retryable(error)) => assert!(error.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(provider.sent.lock().unwrap().is_empty());
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));

        let pending = store.pending_deliveries(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_redelivered_pointer_does_not_resend_leased_rows() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(300)));
        let (processor, id) = setup_with(
            store.clone(),
            provider.clone(),
            WorkerConfig::default(),
            vec![recipient("u1", "one@example.com")],
        )
        .await;
        let processor = Arc::new(processor);

        let first = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.handle(&redelivery(id, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = processor.handle(&redelivery(id, 2)).await;
        assert!(matches!(second, Err(HandlerError::Retryable(_))));

        first.await.unwrap().unwrap();
        assert_eq!(provider.sent.lock().unwrap().clone(), vec!["u1".to_string()]);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.sent_count, 1);
    }
}
