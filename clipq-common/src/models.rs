//! Session and job data model
//!
//! A **session** is one long-running activity (a recorded presentation) split
//! into successive **jobs** (clips). Jobs are produced concurrently and finish
//! enrichment in arbitrary order; the sequencer releases them to the ordered
//! consumer strictly by `sequence_number`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Caller-assigned position of a job within its session
pub type SequenceNumber = u64;

/// Largest sequence number a store can hold (SQLite integers are signed)
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = i64::MAX as SequenceNumber;

/// One unit of ordered work
///
/// Immutable once created. The payload is opaque to the sequencer; only the
/// ordered consumer interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub session_id: String,
    pub sequence_number: SequenceNumber,
    /// Marks the last job of the session
    pub terminal: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new(
        session_id: impl Into<String>,
        sequence_number: SequenceNumber,
        terminal: bool,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sequence_number,
            terminal,
            payload,
        }
    }
}

/// Session lifecycle
///
/// Transitions only move forward:
/// `Uninitialized → Active → Finalizing → Complete`, plus
/// `{Uninitialized, Active, Finalizing} → Failed` once external retries are
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record exists, conversation handle not yet committed
    Uninitialized,
    /// Conversation handle committed, jobs being released
    Active,
    /// Terminal job released, finalize action in progress
    Finalizing,
    /// Finalize action completed
    Complete,
    /// External call retries exhausted; no further processing
    Failed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Uninitialized,
        SessionStatus::Active,
        SessionStatus::Finalizing,
        SessionStatus::Complete,
        SessionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::Active => "active",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
        }
    }

    /// Statuses from which `self` may be entered
    pub fn predecessors(&self) -> &'static [SessionStatus] {
        match self {
            SessionStatus::Uninitialized => &[],
            SessionStatus::Active => &[SessionStatus::Uninitialized],
            SessionStatus::Finalizing => &[SessionStatus::Active],
            SessionStatus::Complete => &[SessionStatus::Finalizing],
            SessionStatus::Failed => &[
                SessionStatus::Uninitialized,
                SessionStatus::Active,
                SessionStatus::Finalizing,
            ],
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// No further jobs will ever be processed
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Codec(format!("unknown session status '{}'", s)))
    }
}

/// Point-in-time snapshot of a session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Next expected sequence number
    pub cursor: SequenceNumber,
    /// Sequence numbers currently buffered, ascending
    pub pending: Vec<SequenceNumber>,
    pub conversation_handle: Option<String>,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    /// Expiry (ms since epoch) of the current release claim, if any
    pub claim_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    /// Fresh record as created on first admission
    pub fn new(id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            cursor: 0,
            pending: Vec::new(),
            conversation_handle: None,
            status: SessionStatus::Uninitialized,
            failure_reason: None,
            claim_expires_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_claimed(&self, now_ms: i64) -> bool {
        self.claim_expires_at.map_or(false, |expires| expires >= now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use SessionStatus::*;
        assert!(Uninitialized.can_transition_to(Active));
        assert!(Active.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Complete));
        assert!(Active.can_transition_to(Failed));
    }

    #[test]
    fn test_backward_and_skipping_transitions_rejected() {
        use SessionStatus::*;
        assert!(!Active.can_transition_to(Uninitialized));
        assert!(!Complete.can_transition_to(Active));
        assert!(!Uninitialized.can_transition_to(Complete));
        assert!(!Active.can_transition_to(Active));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in SessionStatus::ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_claim_expiry() {
        let mut session = Session::new("s", 1_000);
        assert!(!session.is_claimed(1_000));
        session.claim_expires_at = Some(2_000);
        assert!(session.is_claimed(1_500));
        assert!(!session.is_claimed(2_001));
    }
}
