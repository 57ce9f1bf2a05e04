//! Worker pool
//!
//! Every worker task runs the same loop over one queue: lease a message,
//! hand it to a stage handler, settle it. Prefetch is one, so a task never
//! holds more than one delivery.
//!
//! **Settlement**
//! - handler done (released, buffered, duplicate, failed session, malformed
//!   message): `ack`
//! - handler failed retriably: `nack` with a redelivery delay that doubles per
//!   delivery, capped
//! - delivered more than `max_deliveries` times: the handler is told it was
//!   exhausted, then the message is dead-lettered as poison
//!
//! Receive errors (database unavailable) back off exponentially in the loop.
//! Shutdown is cooperative: a task finishes its current delivery, then stops.

use async_trait::async_trait;
use clipq_common::config::QueueConfig;
use clipq_common::wire::{parse_wire_job, render_wire_job};
use clipq_common::SequenceNumber;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest::{IntakeError, IntakeStage};
use crate::resequencer::{AdmitOutcome, OrderedConsumer, Resequencer};
use crate::transport::{Delivery, MessageTransport, TransportError, TransportResult};
use crate::utils::exponential_backoff;

/// Most recent operational error, surfaced by `/health`
pub type LastError = Arc<RwLock<Option<String>>>;

async fn record_error(last_error: &LastError, message: String) {
    *last_error.write().await = Some(message);
}

/// Redelivery and polling policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_deliveries: u32,
    pub poll_interval: Duration,
    pub redelivery_backoff: Duration,
    pub redelivery_backoff_max: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for DeliveryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_deliveries: config.max_deliveries.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            redelivery_backoff: Duration::from_millis(config.redelivery_backoff_ms),
            redelivery_backoff_max: Duration::from_millis(config.redelivery_backoff_max_ms),
        }
    }
}

impl DeliveryPolicy {
    /// Delay before the next delivery of a message delivered `delivery_count` times
    pub fn redelivery_delay(&self, delivery_count: u32) -> Duration {
        exponential_backoff(
            self.redelivery_backoff,
            self.redelivery_backoff_max,
            delivery_count.saturating_sub(1),
        )
    }

    /// Idle wait after `failures` consecutive receive errors
    pub fn receive_backoff(&self, failures: u32) -> Duration {
        exponential_backoff(
            self.poll_interval.max(Duration::from_millis(10)),
            self.redelivery_backoff_max,
            failures.saturating_sub(1),
        )
    }
}

/// What to do with a handled delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Finished with, including messages that can never succeed
    Ack,
    /// Failed retriably; redeliver later
    Retry(String),
}

/// One pipeline stage's message handling
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    fn stage(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Disposition;

    /// Called before a delivery that ran out of attempts is dead-lettered
    async fn exhausted(&self, _delivery: &Delivery, _reason: &str) {}
}

/// Sequencer stage: wire job → resequencer
pub struct SequencerHandler {
    resequencer: Resequencer,
    consumer: Arc<dyn OrderedConsumer>,
    last_error: LastError,
}

impl SequencerHandler {
    pub fn new(
        resequencer: Resequencer,
        consumer: Arc<dyn OrderedConsumer>,
        last_error: LastError,
    ) -> Self {
        Self {
            resequencer,
            consumer,
            last_error,
        }
    }

    /// Fail the job's session, since the job will never be released
    async fn abandon(&self, session_id: &str, sequence_number: SequenceNumber, reason: &str) {
        match self.resequencer.abandon_job(session_id, sequence_number, reason).await {
            Ok(Some(AdmitOutcome::SessionFailed { reason })) => {
                record_error(
                    &self.last_error,
                    format!("session {} failed: {}", session_id, reason),
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    session_id = %session_id,
                    sequence_number,
                    error = %e,
                    "Could not fail session for abandoned job"
                );
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for SequencerHandler {
    fn stage(&self) -> &'static str {
        "sequencer"
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let job = match parse_wire_job(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(delivery_id = delivery.id, error = %e, "Discarding malformed job");
                return Disposition::Ack;
            }
        };
        let session_id = job.session_id.clone();
        let sequence_number = job.sequence_number;

        match self.resequencer.admit(job, self.consumer.as_ref()).await {
            Ok(outcome) => {
                match &outcome {
                    AdmitOutcome::SessionFailed { reason } => {
                        record_error(
                            &self.last_error,
                            format!("session {} failed: {}", session_id, reason),
                        )
                        .await;
                    }
                    AdmitOutcome::Conflict => {
                        record_error(
                            &self.last_error,
                            format!(
                                "session {}: cursor conflict at sequence {}",
                                session_id, sequence_number
                            ),
                        )
                        .await;
                    }
                    _ => {}
                }
                debug!(
                    delivery_id = delivery.id,
                    session_id = %session_id,
                    sequence_number,
                    outcome = ?outcome,
                    "Job admitted"
                );
                Disposition::Ack
            }
            Err(e) if e.is_retriable() => {
                warn!(
                    delivery_id = delivery.id,
                    session_id = %session_id,
                    sequence_number,
                    error = %e,
                    "Admission failed, leaving for redelivery"
                );
                Disposition::Retry(e.to_string())
            }
            Err(e) => {
                error!(
                    delivery_id = delivery.id,
                    session_id = %session_id,
                    sequence_number,
                    error = %e,
                    "Admission can never succeed, discarding job"
                );
                self.abandon(&session_id, sequence_number, &e.to_string()).await;
                Disposition::Ack
            }
        }
    }

    async fn exhausted(&self, delivery: &Delivery, reason: &str) {
        if let Ok(job) = parse_wire_job(&delivery.body) {
            self.abandon(&job.session_id, job.sequence_number, reason).await;
        }
    }
}

/// Intake stage: upload message → wire job on the segments queue
pub struct IntakeHandler {
    stage: IntakeStage,
    transport: Arc<dyn MessageTransport>,
    segments_queue: String,
}

impl IntakeHandler {
    pub fn new(
        stage: IntakeStage,
        transport: Arc<dyn MessageTransport>,
        segments_queue: String,
    ) -> Self {
        Self {
            stage,
            transport,
            segments_queue,
        }
    }
}

#[async_trait]
impl DeliveryHandler for IntakeHandler {
    fn stage(&self) -> &'static str {
        "intake"
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let job = match self.stage.prepare(&delivery.body).await {
            Ok(job) => job,
            Err(IntakeError::Malformed(e)) => {
                warn!(delivery_id = delivery.id, error = %e, "Discarding malformed upload");
                return Disposition::Ack;
            }
            Err(e) => {
                warn!(
                    delivery_id = delivery.id,
                    error = %e,
                    "Intake failed, leaving for redelivery"
                );
                return Disposition::Retry(e.to_string());
            }
        };

        match self
            .transport
            .publish(&self.segments_queue, &render_wire_job(&job))
            .await
        {
            Ok(message_id) => {
                info!(
                    session_id = %job.session_id,
                    sequence_number = job.sequence_number,
                    message_id,
                    "Segment queued for sequencing"
                );
                Disposition::Ack
            }
            Err(e) => Disposition::Retry(e.to_string()),
        }
    }
}

/// One worker task bound to a queue and a stage
pub struct QueueWorker {
    pub id: usize,
    queue: String,
    transport: Arc<dyn MessageTransport>,
    handler: Arc<dyn DeliveryHandler>,
    policy: DeliveryPolicy,
    last_error: LastError,
}

impl QueueWorker {
    pub fn new(
        id: usize,
        queue: impl Into<String>,
        transport: Arc<dyn MessageTransport>,
        handler: Arc<dyn DeliveryHandler>,
        policy: DeliveryPolicy,
        last_error: LastError,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            transport,
            handler,
            policy,
            last_error,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            worker = self.id,
            stage = self.handler.stage(),
            queue = %self.queue,
            "Worker started"
        );
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(true) => {
                    failures = 0;
                    continue;
                }
                Ok(false) => {
                    failures = 0;
                    self.policy.poll_interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let backoff = self.policy.receive_backoff(failures);
                    warn!(
                        worker = self.id,
                        queue = %self.queue,
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Queue unavailable, backing off"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!(worker = self.id, stage = self.handler.stage(), "Worker stopped");
    }

    /// Receive and settle at most one message; `false` when the queue was empty
    pub async fn poll_once(&self) -> TransportResult<bool> {
        let Some(delivery) = self.transport.receive(&self.queue).await? else {
            return Ok(false);
        };

        match self.settle(&delivery).await {
            Ok(()) => Ok(true),
            Err(TransportError::LeaseLost(id)) => {
                warn!(worker = self.id, delivery_id = id, "Lease expired before settlement");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn settle(&self, delivery: &Delivery) -> TransportResult<()> {
        if delivery.delivery_count > self.policy.max_deliveries {
            let reason = format!(
                "delivered {} times (max {})",
                delivery.delivery_count, self.policy.max_deliveries
            );
            error!(
                worker = self.id,
                queue = %self.queue,
                delivery_id = delivery.id,
                reason = %reason,
                "Dead-lettering poison message"
            );
            record_error(
                &self.last_error,
                format!("message {} on {} dead-lettered: {}", delivery.id, self.queue, reason),
            )
            .await;
            self.handler.exhausted(delivery, &reason).await;
            return self.transport.dead_letter(delivery, &reason).await;
        }

        match self.handler.handle(delivery).await {
            Disposition::Ack => self.transport.ack(delivery).await,
            Disposition::Retry(reason) => {
                let delay = self.policy.redelivery_delay(delivery.delivery_count);
                debug!(
                    worker = self.id,
                    delivery_id = delivery.id,
                    delay_ms = delay.as_millis() as u64,
                    "Message returned for redelivery"
                );
                self.transport.nack(delivery, delay, &reason).await
            }
        }
    }
}

/// Periodically resumes sessions nobody is working on
pub struct StallSweeper {
    resequencer: Resequencer,
    consumer: Arc<dyn OrderedConsumer>,
    interval: Duration,
    batch: usize,
}

impl StallSweeper {
    pub fn new(
        resequencer: Resequencer,
        consumer: Arc<dyn OrderedConsumer>,
        interval: Duration,
    ) -> Self {
        Self {
            resequencer,
            consumer,
            interval,
            batch: 100,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Stall sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.sweep_once().await;
        }
        info!("Stall sweeper stopped");
    }

    /// Resume every stalled session once; returns how many made progress
    pub async fn sweep_once(&self) -> usize {
        let stalled = match self.resequencer.store().stalled_sessions(self.batch).await {
            Ok(stalled) => stalled,
            Err(e) => {
                warn!(error = %e, "Stall sweep skipped");
                return 0;
            }
        };

        let mut resumed = 0;
        for session_id in stalled {
            match self.resequencer.resume(&session_id, self.consumer.as_ref()).await {
                Ok(Some(outcome)) => {
                    info!(session_id = %session_id, outcome = ?outcome, "Resumed stalled session");
                    resumed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "Resume failed"),
            }
        }
        resumed
    }
}

/// Task counts and queue names for a pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub intake_workers: usize,
    pub segments_queue: String,
    pub uploads_queue: String,
    /// `None` disables the sweeper
    pub sweep_interval: Option<Duration>,
    pub delivery: DeliveryPolicy,
}

/// Running worker tasks sharing one cancellation token
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        settings: &PoolSettings,
        transport: Arc<dyn MessageTransport>,
        resequencer: Resequencer,
        consumer: Arc<dyn OrderedConsumer>,
        intake: Option<IntakeStage>,
        last_error: LastError,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let sequencer: Arc<dyn DeliveryHandler> = Arc::new(SequencerHandler::new(
            resequencer.clone(),
            consumer.clone(),
            last_error.clone(),
        ));
        for id in 0..settings.workers {
            let worker = QueueWorker::new(
                id,
                settings.segments_queue.clone(),
                transport.clone(),
                sequencer.clone(),
                settings.delivery.clone(),
                last_error.clone(),
            );
            handles.push(tokio::spawn(worker.run(cancel.child_token())));
        }

        if let Some(stage) = intake.filter(|_| settings.intake_workers > 0) {
            let handler: Arc<dyn DeliveryHandler> = Arc::new(IntakeHandler::new(
                stage,
                transport.clone(),
                settings.segments_queue.clone(),
            ));
            for id in 0..settings.intake_workers {
                let worker = QueueWorker::new(
                    settings.workers + id,
                    settings.uploads_queue.clone(),
                    transport.clone(),
                    handler.clone(),
                    settings.delivery.clone(),
                    last_error.clone(),
                );
                handles.push(tokio::spawn(worker.run(cancel.child_token())));
            }
        }

        if let Some(interval) = settings.sweep_interval {
            let sweeper = StallSweeper::new(resequencer, consumer, interval);
            handles.push(tokio::spawn(sweeper.run(cancel.child_token())));
        }

        info!(tasks = handles.len(), "Worker pool started");
        Self { cancel, handles }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for in-flight deliveries to settle
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_delay_doubles_and_caps() {
        let policy = DeliveryPolicy {
            max_deliveries: 8,
            poll_interval: Duration::from_millis(100),
            redelivery_backoff: Duration::from_millis(1_000),
            redelivery_backoff_max: Duration::from_millis(5_000),
        };
        assert_eq!(policy.redelivery_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.redelivery_delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.redelivery_delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.redelivery_delay(4), Duration::from_millis(5_000));
    }

    #[test]
    fn test_receive_backoff_starts_at_poll_interval() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.receive_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.receive_backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.receive_backoff(30), Duration::from_millis(60_000));
    }
}
