//! Session State Store
//!
//! Durable, shared per-session state: the cursor (next expected sequence
//! number), the buffer of early arrivals, the conversation handle, the
//! lifecycle status and the release claim.
//!
//! Every operation is atomic with respect to concurrent callers, including
//! callers in other processes. Conditional operations never hold anything
//! across an external call: each one is a single compare-and-set, so a slow
//! `process` call in one session never blocks another session, nor buffering
//! within the same session.
//!
//! **Error contract**
//! - `NotFound`: unknown session (every operation except `get_or_create`)
//! - `Conflict`: a conditional precondition failed; re-read and decide, never fatal
//! - `Duplicate`: a buffered entry already exists, or the cursor already passed it
//! - `Unavailable`: the backing store failed; retriable through redelivery

pub mod memory;
pub mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;
use clipq_common::{Job, SequenceNumber, Session, SessionStatus};
use std::time::Duration;
use thiserror::Error;

/// Session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Duplicate job {session_id}#{sequence_number}")]
    Duplicate {
        session_id: String,
        sequence_number: SequenceNumber,
    },

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl StoreError {
    /// Only backend failures are worth retrying; everything else is a decision
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<clipq_common::Error> for StoreError {
    fn from(err: clipq_common::Error) -> Self {
        match err {
            clipq_common::Error::Database(e) => StoreError::Unavailable(e),
            clipq_common::Error::NotFound(msg) => StoreError::NotFound(msg),
            clipq_common::Error::InvalidInput(msg) => StoreError::Invalid(msg),
            other => StoreError::Codec(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Proof of holding a session's release claim
///
/// A claim is a time-limited lease recorded by compare-and-set. Only the
/// holder may advance the cursor; an expired claim may be taken over, which is
/// how a crashed holder's session is recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub token: String,
    pub ttl: Duration,
}

impl Claim {
    pub fn new(ttl: Duration) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

/// Atomic primitives the resequencer is built on
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;

    /// Return the session, creating it (`cursor = 0`, `Uninitialized`) if unseen
    ///
    /// `created` is true for exactly one caller per session: the one whose
    /// insert won.
    async fn get_or_create(&self, session_id: &str) -> StoreResult<(Session, bool)>;

    /// Read a session snapshot
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Commit the conversation handle and move `Uninitialized → Active`
    ///
    /// `Conflict` if the session is no longer `Uninitialized`: another creator
    /// already committed its handle and the caller's handle must be discarded.
    async fn activate(&self, session_id: &str, handle: &str) -> StoreResult<Session>;

    /// Forward-only status transition; `Conflict` otherwise
    async fn set_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()>;

    /// Move to `Failed` with a reason; `Conflict` if already `Complete`/`Failed`
    async fn fail(&self, session_id: &str, reason: &str) -> StoreResult<()>;

    /// Take the release claim if the cursor still equals `expected_cursor`,
    /// the session is `Active` or `Finalizing`, and no live claim exists
    async fn try_claim(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        ttl: Duration,
    ) -> StoreResult<Option<Claim>>;

    /// Drop the claim if still held by `claim`
    async fn release_claim(&self, session_id: &str, claim: &Claim) -> StoreResult<()>;

    /// Advance the cursor to `expected_cursor + 1`
    ///
    /// Succeeds only if the cursor equals `expected_cursor` and `claim` is
    /// still held; this is the linearization point that makes each sequence
    /// number's release happen once. In the same atomic step the released
    /// entry (and anything stale at or below it) is popped from the buffer
    /// and the claim expiry is refreshed. `Conflict` otherwise.
    async fn try_advance_and_release(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()>;

    /// [`try_advance_and_release`](Self::try_advance_and_release) for the
    /// terminal job: the same step also moves `Active → Finalizing`
    ///
    /// `Conflict` if the session is no longer `Active`.
    async fn try_advance_and_finalize(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()>;

    /// Insert an early arrival into the buffer
    ///
    /// `Duplicate` if an entry for that sequence number exists or the cursor
    /// has already passed it.
    async fn buffer(&self, job: &Job) -> StoreResult<()>;

    /// Read a buffered entry without removing it
    async fn peek_pending(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>>;

    /// Remove and return a buffered entry
    async fn pop_if_present(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>>;

    /// Sessions that can make progress but nobody is working on: the head is
    /// buffered (or the session is `Finalizing`) and no live claim exists
    async fn stalled_sessions(&self, limit: usize) -> StoreResult<Vec<String>>;
}
