//! Session resequencer
//!
//! Accepts jobs in any order and releases them to an [`OrderedConsumer`]
//! strictly by sequence number, once each, across any number of workers and
//! processes. All coordination goes through the [`SessionStore`] primitives;
//! nothing here is cached between calls.
//!
//! **Release protocol**
//! 1. The worker whose job is at the head takes the session's release claim
//!    (compare-and-set on the cursor).
//! 2. It calls `process`, then advances the cursor under the claim. The
//!    advance is the linearization point: a failed advance means the claim was
//!    lost and the side effect may have been applied twice, which is logged as
//!    a consistency violation.
//! 3. While holding the claim it drains buffered successors, reading each with
//!    `peek_pending` and removing it only in the advance.
//! 4. It releases the claim, then re-checks the head. A worker that buffered a
//!    job re-checks too, after its own write, so no successor is stranded.
//!
//! **Lifecycle**: `Uninitialized → Active` when the conversation is opened by
//! the session's creator; `Active → Finalizing` in the same step that releases
//! the terminal job; `Finalizing → Complete` after the consumer's finalize
//! action. A consumer failure, or a job the transport gave up on, moves the
//! session to `Failed`.

use async_trait::async_trait;
use clipq_common::time::now_ms;
use clipq_common::{Job, SequenceNumber, Session, SessionStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{Claim, SessionStore, StoreError};

/// Consumer failure after the consumer's own retries were exhausted
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("external call failed: {0}")]
    External(String),

    #[error("result could not be recorded: {0}")]
    Record(String),
}

/// The stateful downstream receiving jobs in order
#[async_trait]
pub trait OrderedConsumer: Send + Sync {
    /// Open the external conversation for a new session and return its handle
    async fn open_conversation(&self, session_id: &str) -> Result<String, ConsumerError>;

    /// Apply one job; called once per sequence number, in order
    async fn process(&self, handle: &str, job: &Job) -> Result<(), ConsumerError>;

    /// Close the conversation after the terminal job was processed
    async fn finalize(&self, handle: &str, session_id: &str) -> Result<(), ConsumerError>;
}

/// Errors that leave the job unacknowledged for redelivery
#[derive(Debug, Error)]
pub enum ResequencerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session {session_id}: conversation initialization failed: {reason}")]
    Initialization { session_id: String, reason: String },
}

impl ResequencerError {
    /// Whether a redelivery of the same job can succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            ResequencerError::Store(e) => e.is_retriable(),
            ResequencerError::Initialization { .. } => true,
        }
    }
}

/// Result of one admission; every variant acknowledges the message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// Jobs released to the consumer by this call, in order
    Released {
        sequence_numbers: Vec<SequenceNumber>,
        /// The terminal job was released and the session is now `Complete`
        completed: bool,
    },
    /// Stored until its predecessors are released
    Buffered,
    /// Already released, already buffered, or the session is finished
    Duplicate,
    /// The cursor moved under a held claim (logged as a consistency violation)
    Conflict,
    /// The session is `Failed`
    SessionFailed { reason: String },
}

/// Resequencer timing
#[derive(Debug, Clone)]
pub struct ResequencerSettings {
    /// Release claim lifetime; must exceed the slowest `process` call
    pub claim_ttl: Duration,
    /// How long a non-creator waits for the creator's conversation handle
    pub init_wait: Duration,
}

impl Default for ResequencerSettings {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(900),
            init_wait: Duration::from_secs(10),
        }
    }
}

const INIT_POLL_INITIAL: Duration = Duration::from_millis(10);
const INIT_POLL_MAX: Duration = Duration::from_millis(500);

/// Ordering engine over a shared [`SessionStore`]
#[derive(Clone)]
pub struct Resequencer {
    store: Arc<dyn SessionStore>,
    settings: ResequencerSettings,
}

impl Resequencer {
    pub fn new(store: Arc<dyn SessionStore>, settings: ResequencerSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &ResequencerSettings {
        &self.settings
    }

    /// Admit one job, releasing it (and any buffered successors) if it is
    /// the session head
    pub async fn admit(
        &self,
        job: Job,
        consumer: &dyn OrderedConsumer,
    ) -> Result<AdmitOutcome, ResequencerError> {
        let (session, created) = self.store.get_or_create(&job.session_id).await?;
        let session = self.ensure_initialized(session, created, consumer).await?;

        match session.status {
            SessionStatus::Complete => return Ok(AdmitOutcome::Duplicate),
            SessionStatus::Failed => return Ok(failed_outcome(&session)),
            SessionStatus::Finalizing => {
                // Nothing is released after the terminal job; only nudge a
                // stalled finalizer
                return match self.resume(&session.id, consumer).await? {
                    Some(outcome @ AdmitOutcome::SessionFailed { .. }) => Ok(outcome),
                    _ => Ok(AdmitOutcome::Duplicate),
                };
            }
            SessionStatus::Uninitialized | SessionStatus::Active => {}
        }

        if job.sequence_number < session.cursor {
            debug!(
                session_id = %job.session_id,
                sequence_number = job.sequence_number,
                cursor = session.cursor,
                "Discarding already released job"
            );
            return Ok(AdmitOutcome::Duplicate);
        }

        if job.sequence_number > session.cursor {
            return self.buffer_and_recheck(job, consumer).await;
        }

        let handle = conversation_handle(&session)?;
        match self
            .store
            .try_claim(&session.id, session.cursor, self.settings.claim_ttl)
            .await?
        {
            Some(claim) => {
                self.release_run(&session.id, &handle, session.cursor, Some(job), claim, consumer)
                    .await
            }
            // Another worker holds the head; leave the job for it
            None => self.buffer_and_recheck(job, consumer).await,
        }
    }

    /// Make progress on a session without a new job
    ///
    /// Drains a buffered head or finishes an interrupted finalization when no
    /// live claim exists. Returns `None` when there was nothing to do or
    /// another worker is already on it.
    pub async fn resume(
        &self,
        session_id: &str,
        consumer: &dyn OrderedConsumer,
    ) -> Result<Option<AdmitOutcome>, ResequencerError> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        match session.status {
            SessionStatus::Active => {
                if self
                    .store
                    .peek_pending(session_id, session.cursor)
                    .await?
                    .is_none()
                {
                    return Ok(None);
                }
                let Some(claim) = self
                    .store
                    .try_claim(session_id, session.cursor, self.settings.claim_ttl)
                    .await?
                else {
                    return Ok(None);
                };
                let handle = conversation_handle(&session)?;
                self.release_run(session_id, &handle, session.cursor, None, claim, consumer)
                    .await
                    .map(Some)
            }
            SessionStatus::Finalizing => {
                let Some(claim) = self
                    .store
                    .try_claim(session_id, session.cursor, self.settings.claim_ttl)
                    .await?
                else {
                    return Ok(None);
                };
                info!(session_id, "Resuming interrupted finalization");
                let handle = conversation_handle(&session)?;
                match self.finish(session_id, &handle, &claim, consumer).await? {
                    Some(failed) => Ok(Some(failed)),
                    None => Ok(Some(AdmitOutcome::Released {
                        sequence_numbers: Vec::new(),
                        completed: true,
                    })),
                }
            }
            SessionStatus::Uninitialized | SessionStatus::Complete | SessionStatus::Failed => {
                Ok(None)
            }
        }
    }

    /// Give up on a job that will never be admitted
    ///
    /// The session is failed unless the job was already released or is held
    /// in the buffer, because none of its successors could be released
    /// otherwise. Sessions past their terminal release are left to the
    /// sweeper. Returns the failure outcome when the session was failed.
    pub async fn abandon_job(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
        reason: &str,
    ) -> Result<Option<AdmitOutcome>, ResequencerError> {
        let Some(session) = self.store.get(session_id).await? else {
            return Ok(None);
        };

        match session.status {
            SessionStatus::Uninitialized | SessionStatus::Active => {}
            SessionStatus::Finalizing | SessionStatus::Complete | SessionStatus::Failed => {
                return Ok(None);
            }
        }
        if sequence_number < session.cursor
            || self
                .store
                .peek_pending(session_id, sequence_number)
                .await?
                .is_some()
        {
            return Ok(None);
        }

        self.fail_session(
            session_id,
            format!("sequence {} abandoned: {}", sequence_number, reason),
        )
        .await
        .map(Some)
    }

    /// Commit a conversation handle for an `Uninitialized` session
    ///
    /// The creator opens the conversation right away. Other callers wait for
    /// the creator's commit, and only open one themselves if the session is
    /// still uninitialized once `init_wait` has passed since its creation.
    async fn ensure_initialized(
        &self,
        session: Session,
        created: bool,
        consumer: &dyn OrderedConsumer,
    ) -> Result<Session, ResequencerError> {
        if session.status != SessionStatus::Uninitialized {
            return Ok(session);
        }

        let session_id = session.id.clone();
        if !created {
            if let Some(ready) = self.await_initialization(&session).await? {
                return Ok(ready);
            }
            warn!(
                session_id = %session_id,
                "Session still uninitialized after waiting for its creator, initializing"
            );
        }

        let handle = consumer
            .open_conversation(&session_id)
            .await
            .map_err(|e| ResequencerError::Initialization {
                session_id: session_id.clone(),
                reason: e.to_string(),
            })?;

        match self.store.activate(&session_id, &handle).await {
            Ok(active) => {
                info!(session_id = %session_id, "Conversation opened");
                Ok(active)
            }
            Err(StoreError::Conflict(_)) => {
                // A racing initializer committed first; its handle stands
                debug!(session_id = %session_id, "Lost initialization race, discarding handle");
                self.store
                    .get(&session_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(session_id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the creator commits, bounded by `init_wait` from creation
    async fn await_initialization(
        &self,
        session: &Session,
    ) -> Result<Option<Session>, ResequencerError> {
        let wait_ms = i64::try_from(self.settings.init_wait.as_millis()).unwrap_or(i64::MAX);
        let deadline = session.created_at.saturating_add(wait_ms);
        let mut delay = INIT_POLL_INITIAL;

        loop {
            let remaining = deadline.saturating_sub(now_ms());
            if remaining <= 0 {
                return Ok(None);
            }
            tokio::time::sleep(delay.min(Duration::from_millis(remaining as u64))).await;

            let current = self
                .store
                .get(&session.id)
                .await?
                .ok_or_else(|| StoreError::NotFound(session.id.clone()))?;
            if current.status != SessionStatus::Uninitialized {
                return Ok(Some(current));
            }
            delay = (delay * 2).min(INIT_POLL_MAX);
        }
    }

    async fn buffer_and_recheck(
        &self,
        job: Job,
        consumer: &dyn OrderedConsumer,
    ) -> Result<AdmitOutcome, ResequencerError> {
        match self.store.buffer(&job).await {
            Ok(()) => {
                debug!(
                    session_id = %job.session_id,
                    sequence_number = job.sequence_number,
                    "Buffered early arrival"
                );
            }
            Err(StoreError::Duplicate { .. }) => {
                debug!(
                    session_id = %job.session_id,
                    sequence_number = job.sequence_number,
                    "Discarding duplicate delivery"
                );
                return Ok(AdmitOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        // The head may have been buffered by someone whose drain just ended
        match self.resume(&job.session_id, consumer).await? {
            Some(failed @ AdmitOutcome::SessionFailed { .. }) => Ok(failed),
            _ => Ok(AdmitOutcome::Buffered),
        }
    }

    /// Release the head and every contiguous buffered successor
    ///
    /// Entered holding `claim` at `cursor`. `first` is the head job if the
    /// caller already has it in hand, otherwise the head is read from the
    /// buffer.
    async fn release_run(
        &self,
        session_id: &str,
        handle: &str,
        mut cursor: SequenceNumber,
        mut first: Option<Job>,
        mut claim: Claim,
        consumer: &dyn OrderedConsumer,
    ) -> Result<AdmitOutcome, ResequencerError> {
        let mut released = Vec::new();

        loop {
            let job = match first.take() {
                Some(job) => Some(job),
                None => match self.store.peek_pending(session_id, cursor).await {
                    Ok(job) => job,
                    Err(e) => return Err(self.abandon(session_id, &claim, e).await),
                },
            };

            let Some(job) = job else {
                self.store.release_claim(session_id, &claim).await?;

                // Re-check after releasing: a successor buffered while we held
                // the claim would otherwise wait for the sweeper
                if self.store.peek_pending(session_id, cursor).await?.is_none() {
                    break;
                }
                let next = self
                    .store
                    .try_claim(session_id, cursor, self.settings.claim_ttl)
                    .await?;
                match next {
                    Some(next) => claim = next,
                    None => break,
                }
                continue;
            };

            if let Err(e) = consumer.process(handle, &job).await {
                return self
                    .fail_session(
                        session_id,
                        format!("processing sequence {} failed: {}", job.sequence_number, e),
                    )
                    .await;
            }

            let advanced = if job.terminal {
                self.store
                    .try_advance_and_finalize(session_id, cursor, &claim)
                    .await
            } else {
                self.store
                    .try_advance_and_release(session_id, cursor, &claim)
                    .await
            };

            match advanced {
                Ok(()) => {}
                Err(StoreError::Conflict(detail)) => {
                    error!(
                        session_id,
                        sequence_number = cursor,
                        detail = %detail,
                        "Consistency violation: cursor advance failed under a held claim"
                    );
                    return Ok(AdmitOutcome::Conflict);
                }
                Err(e) => return Err(self.abandon(session_id, &claim, e).await),
            }

            debug!(session_id, sequence_number = cursor, "Released job");
            released.push(cursor);
            cursor += 1;

            if job.terminal {
                if let Some(failed) = self.finish(session_id, handle, &claim, consumer).await? {
                    return Ok(failed);
                }
                return Ok(AdmitOutcome::Released {
                    sequence_numbers: released,
                    completed: true,
                });
            }
        }

        Ok(AdmitOutcome::Released {
            sequence_numbers: released,
            completed: false,
        })
    }

    /// Run the finalize action on a `Finalizing` session held under `claim`
    ///
    /// Returns the failure outcome if the session had to be failed.
    async fn finish(
        &self,
        session_id: &str,
        handle: &str,
        claim: &Claim,
        consumer: &dyn OrderedConsumer,
    ) -> Result<Option<AdmitOutcome>, ResequencerError> {
        if let Err(e) = consumer.finalize(handle, session_id).await {
            return self
                .fail_session(session_id, format!("finalize failed: {}", e))
                .await
                .map(Some);
        }

        match self
            .store
            .set_status(session_id, SessionStatus::Complete)
            .await
        {
            Ok(()) => info!(session_id, "Session complete"),
            Err(StoreError::Conflict(detail)) => {
                warn!(session_id, detail = %detail, "Session already left Finalizing");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.release_claim(session_id, claim).await?;
        Ok(None)
    }

    async fn fail_session(
        &self,
        session_id: &str,
        reason: String,
    ) -> Result<AdmitOutcome, ResequencerError> {
        error!(session_id, reason = %reason, "Session failed");
        match self.store.fail(session_id, &reason).await {
            Ok(()) => {}
            Err(StoreError::Conflict(detail)) => {
                warn!(
                    session_id,
                    detail = %detail,
                    "Session already finished, failure not recorded"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(AdmitOutcome::SessionFailed { reason })
    }

    /// Give the claim back after a store error so the redelivery can proceed
    async fn abandon(&self, session_id: &str, claim: &Claim, err: StoreError) -> ResequencerError {
        if let Err(release_err) = self.store.release_claim(session_id, claim).await {
            warn!(
                session_id,
                error = %release_err,
                "Could not release claim, it will expire"
            );
        }
        err.into()
    }
}

fn conversation_handle(session: &Session) -> Result<String, ResequencerError> {
    session.conversation_handle.clone().ok_or_else(|| {
        StoreError::Invalid(format!(
            "session {} is {} without a conversation handle",
            session.id, session.status
        ))
        .into()
    })
}

fn failed_outcome(session: &Session) -> AdmitOutcome {
    AdmitOutcome::SessionFailed {
        reason: session
            .failure_reason
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        processed: Mutex<Vec<SequenceNumber>>,
        finalized: Mutex<u32>,
    }

    #[async_trait]
    impl OrderedConsumer for Recorder {
        async fn open_conversation(&self, session_id: &str) -> Result<String, ConsumerError> {
            Ok(format!("conv-{}", session_id))
        }

        async fn process(&self, _handle: &str, job: &Job) -> Result<(), ConsumerError> {
            self.processed.lock().unwrap().push(job.sequence_number);
            Ok(())
        }

        async fn finalize(&self, _handle: &str, _session_id: &str) -> Result<(), ConsumerError> {
            *self.finalized.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn resequencer() -> Resequencer {
        Resequencer::new(Arc::new(MemorySessionStore::new()), ResequencerSettings::default())
    }

    fn job(seq: SequenceNumber, terminal: bool) -> Job {
        Job::new("s", seq, terminal, json!({}))
    }

    #[tokio::test]
    async fn test_head_job_released_inline() {
        let reseq = resequencer();
        let consumer = Recorder::default();

        let outcome = reseq.admit(job(0, false), &consumer).await.unwrap();
        assert_eq!(
            outcome,
            AdmitOutcome::Released {
                sequence_numbers: vec![0],
                completed: false
            }
        );
        assert_eq!(*consumer.processed.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_terminal_head_completes_session() {
        let reseq = resequencer();
        let consumer = Recorder::default();

        let outcome = reseq.admit(job(0, true), &consumer).await.unwrap();
        assert_eq!(
            outcome,
            AdmitOutcome::Released {
                sequence_numbers: vec![0],
                completed: true
            }
        );
        let session = reseq.store().get("s").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(session.cursor, 1);
        assert_eq!(*consumer.finalized.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resume_without_buffered_head_is_noop() {
        let reseq = resequencer();
        let consumer = Recorder::default();
        reseq.admit(job(2, false), &consumer).await.unwrap();

        assert_eq!(reseq.resume("s", &consumer).await.unwrap(), None);
        assert!(consumer.processed.lock().unwrap().is_empty());
    }
}
