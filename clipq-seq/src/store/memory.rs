//! In-process session store
//!
//! Same contract as the SQLite store, with a single mutex standing in for the
//! database write lock. Only valid when one process hosts every worker.

use async_trait::async_trait;
use clipq_common::time::{deadline_ms, now_ms};
use clipq_common::{Job, SequenceNumber, Session, SessionStatus};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Claim, SessionStore, StoreError, StoreResult};

#[derive(Debug)]
struct Record {
    session: Session,
    pending: BTreeMap<SequenceNumber, Job>,
    claim_token: Option<String>,
}

impl Record {
    fn snapshot(&self) -> Session {
        let mut session = self.session.clone();
        session.pending = self.pending.keys().copied().collect();
        session
    }

    fn claim_live(&self, now: i64) -> bool {
        self.claim_token.is_some() && self.session.is_claimed(now)
    }

    fn holds(&self, claim: &Claim) -> bool {
        self.claim_token.as_deref() == Some(claim.token.as_str())
    }

    fn pop(&mut self, sequence_number: SequenceNumber) -> Option<Job> {
        self.pending.remove(&sequence_number)
    }

    fn touch(&mut self) {
        self.session.updated_at = now_ms();
    }
}

/// Session store held in process memory
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Record>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn advance(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
        finalize: bool,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if record.session.cursor != expected_cursor || !record.holds(claim) {
            return Err(StoreError::Conflict(format!(
                "session {}: cursor {} (expected {}), claim held: {}",
                session_id,
                record.session.cursor,
                expected_cursor,
                record.holds(claim)
            )));
        }
        if finalize && record.session.status != SessionStatus::Active {
            return Err(StoreError::Conflict(format!(
                "session {} is {}, cannot finalize",
                session_id, record.session.status
            )));
        }

        record.session.cursor = expected_cursor + 1;
        if finalize {
            record.session.status = SessionStatus::Finalizing;
        }
        // Released entry plus any stale copies below it
        let stale: Vec<SequenceNumber> = record
            .pending
            .range(..=expected_cursor)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            record.pop(seq);
        }
        record.session.claim_expires_at = Some(deadline_ms(claim.ttl));
        record.touch();
        Ok(())
    }
}

fn not_found(session_id: &str) -> StoreError {
    StoreError::NotFound(session_id.to_string())
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_or_create(&self, session_id: &str) -> StoreResult<(Session, bool)> {
        let mut sessions = self.sessions.lock().await;
        if let Some(record) = sessions.get(session_id) {
            return Ok((record.snapshot(), false));
        }

        let record = Record {
            session: Session::new(session_id, now_ms()),
            pending: BTreeMap::new(),
            claim_token: None,
        };
        let snapshot = record.snapshot();
        sessions.insert(session_id.to_string(), record);
        Ok((snapshot, true))
    }

    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).map(Record::snapshot))
    }

    async fn activate(&self, session_id: &str, handle: &str) -> StoreResult<Session> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if record.session.status != SessionStatus::Uninitialized {
            return Err(StoreError::Conflict(format!(
                "session {} already {}",
                session_id, record.session.status
            )));
        }

        record.session.conversation_handle = Some(handle.to_string());
        record.session.status = SessionStatus::Active;
        record.touch();
        Ok(record.snapshot())
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if !record.session.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "session {}: {} -> {} not allowed",
                session_id, record.session.status, status
            )));
        }

        record.session.status = status;
        record.touch();
        Ok(())
    }

    async fn fail(&self, session_id: &str, reason: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if !record.session.status.can_transition_to(SessionStatus::Failed) {
            return Err(StoreError::Conflict(format!(
                "session {} already {}",
                session_id, record.session.status
            )));
        }

        record.session.status = SessionStatus::Failed;
        record.session.failure_reason = Some(reason.to_string());
        record.claim_token = None;
        record.session.claim_expires_at = None;
        record.touch();
        Ok(())
    }

    async fn try_claim(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        ttl: Duration,
    ) -> StoreResult<Option<Claim>> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        let claimable = record.session.cursor == expected_cursor
            && matches!(
                record.session.status,
                SessionStatus::Active | SessionStatus::Finalizing
            )
            && !record.claim_live(now_ms());
        if !claimable {
            return Ok(None);
        }

        let claim = Claim::new(ttl);
        record.claim_token = Some(claim.token.clone());
        record.session.claim_expires_at = Some(deadline_ms(ttl));
        record.touch();
        Ok(Some(claim))
    }

    async fn release_claim(&self, session_id: &str, claim: &Claim) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if record.holds(claim) {
            record.claim_token = None;
            record.session.claim_expires_at = None;
            record.touch();
        }
        Ok(())
    }

    async fn try_advance_and_release(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()> {
        self.advance(session_id, expected_cursor, claim, false).await
    }

    async fn try_advance_and_finalize(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()> {
        self.advance(session_id, expected_cursor, claim, true).await
    }

    async fn buffer(&self, job: &Job) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(&job.session_id)
            .ok_or_else(|| not_found(&job.session_id))?;

        if job.sequence_number < record.session.cursor
            || record.pending.contains_key(&job.sequence_number)
        {
            return Err(StoreError::Duplicate {
                session_id: job.session_id.clone(),
                sequence_number: job.sequence_number,
            });
        }

        record.pending.insert(job.sequence_number, job.clone());
        record.touch();
        Ok(())
    }

    async fn peek_pending(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>> {
        let sessions = self.sessions.lock().await;
        let record = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(record.pending.get(&sequence_number).cloned())
    }

    async fn pop_if_present(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(record.pop(sequence_number))
    }

    async fn stalled_sessions(&self, limit: usize) -> StoreResult<Vec<String>> {
        let sessions = self.sessions.lock().await;
        let now = now_ms();

        let mut stalled: Vec<String> = sessions
            .values()
            .filter(|record| !record.claim_live(now))
            .filter(|record| match record.session.status {
                SessionStatus::Active => record.pending.contains_key(&record.session.cursor),
                SessionStatus::Finalizing => true,
                _ => false,
            })
            .map(|record| record.session.id.clone())
            .collect();
        stalled.sort();
        stalled.truncate(limit);
        Ok(stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(seq: SequenceNumber) -> Job {
        Job::new("s1", seq, false, json!({}))
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let store = MemorySessionStore::new();
        store.get_or_create("s1").await.unwrap();
        store.activate("s1", "h").await.unwrap();

        let first = store
            .try_claim("s1", 0, Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = store
            .try_claim("s1", 0, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired claim should be claimable");
        assert_ne!(first.token, second.token);

        // The previous holder can no longer advance
        assert!(matches!(
            store.try_advance_and_release("s1", 0, &first).await,
            Err(StoreError::Conflict(_))
        ));
        store.try_advance_and_release("s1", 0, &second).await.unwrap();
    }

    #[tokio::test]
    async fn test_advance_drops_stale_buffer_entries() {
        let store = MemorySessionStore::new();
        store.get_or_create("s1").await.unwrap();
        store.activate("s1", "h").await.unwrap();
        store.buffer(&job(0)).await.unwrap();
        store.buffer(&job(2)).await.unwrap();

        let claim = store
            .try_claim("s1", 0, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.try_advance_and_release("s1", 0, &claim).await.unwrap();

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.cursor, 1);
        assert_eq!(session.pending, vec![2]);
    }
}
