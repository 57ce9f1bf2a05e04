//! Feedback consumer
//!
//! The production [`OrderedConsumer`]: each released segment is sent to the
//! feedback provider on the session's conversation and the result is recorded
//! through the [`FeedbackSink`]. Provider calls go through the bounded retry
//! policy; only transient provider errors are retried.

use async_trait::async_trait;
use clipq_common::time::now_ms;
use clipq_common::Job;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::feedback::{sequence_column, FeedbackSink, SegmentFeedback};
use crate::provider::{FeedbackProvider, ProviderError, SegmentInput, SessionContext};
use crate::resequencer::{ConsumerError, OrderedConsumer};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Job payload as produced by the intake stage
///
/// Every field is optional; a segment without a transcript is still reviewed
/// (the slide alone carries information).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentPayload {
    pub user_id: Option<String>,
    pub transcript: Option<String>,
    pub slide_url: Option<String>,
    pub video_url: Option<String>,
    pub emotions: Option<serde_json::Value>,
    pub score: Option<f64>,
}

impl SegmentPayload {
    /// Interpret a job payload; a non-object payload yields an empty one
    pub fn from_job(job: &Job) -> Result<Self, ConsumerError> {
        match &job.payload {
            serde_json::Value::Null => Ok(Self::default()),
            value => serde_json::from_value(value.clone()).map_err(|e| {
                ConsumerError::Record(format!(
                    "payload of {}#{} is not a segment: {}",
                    job.session_id, job.sequence_number, e
                ))
            }),
        }
    }
}

pub struct FeedbackConsumer {
    provider: Arc<dyn FeedbackProvider>,
    sink: FeedbackSink,
    retry: RetryPolicy,
}

impl FeedbackConsumer {
    pub fn new(
        provider: Arc<dyn FeedbackProvider>,
        sink: FeedbackSink,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            sink,
            retry,
        }
    }

    pub fn sink(&self) -> &FeedbackSink {
        &self.sink
    }
}

fn external(err: ProviderError) -> ConsumerError {
    ConsumerError::External(err.to_string())
}

fn record(err: clipq_common::Error) -> ConsumerError {
    ConsumerError::Record(err.to_string())
}

#[async_trait]
impl OrderedConsumer for FeedbackConsumer {
    async fn open_conversation(&self, session_id: &str) -> Result<String, ConsumerError> {
        let context = SessionContext {
            session_id: session_id.to_string(),
        };
        retry_with_backoff(
            "initialize_session",
            &self.retry,
            ProviderError::is_transient,
            || self.provider.initialize_session(&context),
        )
        .await
        .map_err(external)
    }

    async fn process(&self, handle: &str, job: &Job) -> Result<(), ConsumerError> {
        let payload = SegmentPayload::from_job(job)?;

        if job.sequence_number == 0 {
            self.sink
                .mark_processing(&job.session_id, payload.user_id.as_deref())
                .await
                .map_err(record)?;
        }

        let input = SegmentInput {
            index: job.sequence_number,
            transcript: payload.transcript.clone().unwrap_or_default(),
            slide_url: payload.slide_url.clone(),
        };
        let feedback = retry_with_backoff(
            "submit_segment",
            &self.retry,
            ProviderError::is_transient,
            || self.provider.submit_segment(handle, &input),
        )
        .await
        .map_err(external)?;

        tracing::info!(
            session_id = %job.session_id,
            sequence_number = job.sequence_number,
            provider = self.provider.name(),
            "Segment feedback received"
        );

        let row = SegmentFeedback {
            session_id: job.session_id.clone(),
            sequence_number: sequence_column(job.sequence_number).map_err(record)?,
            user_id: payload.user_id,
            feedback,
            emotions: payload.emotions.map(|value| value.to_string()),
            score: payload.score,
            slide_url: payload.slide_url,
            video_url: payload.video_url,
            recorded_at: now_ms(),
        };
        self.sink.record_segment(&row).await.map_err(record)
    }

    async fn finalize(&self, handle: &str, session_id: &str) -> Result<(), ConsumerError> {
        let summary = retry_with_backoff(
            "finalize",
            &self.retry,
            ProviderError::is_transient,
            || self.provider.finalize(handle),
        )
        .await
        .map_err(external)?;

        self.sink
            .record_summary(session_id, &summary)
            .await
            .map_err(record)?;
        tracing::info!(session_id, "Session summary recorded");
        Ok(())
    }
}
