//! Test Helper Utilities
//!
//! Shared consumers and store backends for the clipq-seq integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use clipq_common::db::init_database;
use clipq_common::{Job, SequenceNumber};
use clipq_seq::resequencer::ConsumerError;
use clipq_seq::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use clipq_seq::OrderedConsumer;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Consumer recording every call, with optional injected failures
#[derive(Default)]
pub struct RecordingConsumer {
    processed: Mutex<HashMap<String, Vec<SequenceNumber>>>,
    finalized: Mutex<HashMap<String, u32>>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicU32,
    opened: AtomicU32,
    fail_at: Option<SequenceNumber>,
    fail_open: bool,
    fail_finalize: bool,
    delay: Duration,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(sequence_number: SequenceNumber) -> Self {
        Self {
            fail_at: Some(sequence_number),
            ..Self::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn failing_finalize() -> Self {
        Self {
            fail_finalize: true,
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn processed(&self, session_id: &str) -> Vec<SequenceNumber> {
        self.processed
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn finalized(&self, session_id: &str) -> u32 {
        self.finalized
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Times `process` ran while another `process` of the same session was running
    pub fn overlaps(&self) -> u32 {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderedConsumer for RecordingConsumer {
    async fn open_conversation(&self, session_id: &str) -> Result<String, ConsumerError> {
        if self.fail_open {
            return Err(ConsumerError::External("provider down".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("conv-{}-{}", session_id, n))
    }

    async fn process(&self, _handle: &str, job: &Job) -> Result<(), ConsumerError> {
        if self.fail_at == Some(job.sequence_number) {
            return Err(ConsumerError::External(format!(
                "rejected segment {}",
                job.sequence_number
            )));
        }

        if !self.in_flight.lock().unwrap().insert(job.session_id.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.processed
            .lock()
            .unwrap()
            .entry(job.session_id.clone())
            .or_default()
            .push(job.sequence_number);
        self.in_flight.lock().unwrap().remove(&job.session_id);
        Ok(())
    }

    async fn finalize(&self, _handle: &str, session_id: &str) -> Result<(), ConsumerError> {
        if self.fail_finalize {
            return Err(ConsumerError::External("summary unavailable".into()));
        }
        *self
            .finalized
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default() += 1;
        Ok(())
    }
}

/// A session store plus whatever keeps it alive
pub struct Backend {
    pub name: &'static str,
    pub store: Arc<dyn SessionStore>,
    _dir: Option<TempDir>,
}

pub fn memory_backend() -> Backend {
    Backend {
        name: "memory",
        store: Arc::new(MemorySessionStore::new()),
        _dir: None,
    }
}

pub async fn sqlite_backend() -> Backend {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("clipq.db")).await.unwrap();
    Backend {
        name: "sqlite",
        store: Arc::new(SqliteSessionStore::new(pool)),
        _dir: Some(dir),
    }
}

/// Every session store backend
pub async fn backends() -> Vec<Backend> {
    vec![memory_backend(), sqlite_backend().await]
}

pub fn job(session_id: &str, sequence_number: SequenceNumber, terminal: bool) -> Job {
    Job::new(
        session_id,
        sequence_number,
        terminal,
        serde_json::json!({ "transcript": format!("clip {}", sequence_number) }),
    )
}
