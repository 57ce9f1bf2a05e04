//! Ingestion adapter
//!
//! Two normalization points sit in front of the resequencer:
//! - the **intake stage** turns a raw upload message into a job, filling the
//!   transcript through a [`Transcriber`], and republishes it in the wire
//!   schema on the segments queue;
//! - the sequencer worker parses that wire schema back with
//!   [`clipq_common::wire::parse_wire_job`].
//!
//! Upload messages look like:
//!
//! ```json
//! {"presentationID": "p-42", "userID": "u-7", "clipIndex": 3,
//!  "videoURL": "https://…/3.webm", "slideURL": "https://…/3.png",
//!  "isEnd": "false"}
//! ```
//!
//! `audioURL` may stand in for `videoURL`; a `transcript` field skips
//! transcription.

use async_trait::async_trait;
use clipq_common::wire::{
    parse_wire_job, MalformedJob, FIELD_SEQUENCE_NUMBER, FIELD_SESSION_ID, FIELD_TERMINAL,
};
use clipq_common::Job;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Raw upload message
#[derive(Debug, Clone, Deserialize)]
pub struct UploadMessage {
    #[serde(rename = "presentationID")]
    pub presentation_id: String,
    #[serde(rename = "userID", default)]
    pub user_id: Option<String>,
    /// Integer or decimal text
    #[serde(rename = "clipIndex")]
    pub clip_index: Value,
    #[serde(rename = "videoURL", default)]
    pub video_url: Option<String>,
    #[serde(rename = "audioURL", default)]
    pub audio_url: Option<String>,
    #[serde(rename = "slideURL", default)]
    pub slide_url: Option<String>,
    /// Boolean or `"true"`/`"false"` text; missing means not the end
    #[serde(rename = "isEnd", default)]
    pub is_end: Value,
    #[serde(default)]
    pub transcript: Option<String>,
}

impl UploadMessage {
    /// Media to transcribe: the video, else the audio track
    pub fn media_url(&self) -> Option<&str> {
        self.video_url
            .as_deref()
            .or(self.audio_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

/// Upload message that can never be processed
#[derive(Debug, Error)]
pub enum MalformedUpload {
    #[error("invalid upload message: {0}")]
    Invalid(String),

    #[error("upload has neither a transcript nor a media URL")]
    MissingMedia,

    #[error(transparent)]
    Job(#[from] MalformedJob),
}

#[derive(Debug, Error)]
pub enum IntakeError {
    /// Acknowledge and log
    #[error(transparent)]
    Malformed(#[from] MalformedUpload),

    /// Retries exhausted; leave for redelivery
    #[error("transcription failed: {0}")]
    Transcription(#[from] ProviderError),
}

/// Speech and expression analysis of one clip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcription {
    pub transcript: String,
    pub emotions: Option<Value>,
    pub score: Option<f64>,
}

/// Transcription capability used by the intake stage
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe(&self, media_url: &str) -> Result<Transcription, ProviderError>;
}

/// Transcriber for deployments where uploads already carry their transcript
///
/// Clips without one get an empty transcript.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTranscriber;

#[async_trait]
impl Transcriber for PassthroughTranscriber {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn transcribe(&self, _media_url: &str) -> Result<Transcription, ProviderError> {
        Ok(Transcription::default())
    }
}

/// Parse an upload message body
pub fn parse_upload(body: &str) -> Result<UploadMessage, MalformedUpload> {
    let upload: UploadMessage =
        serde_json::from_str(body).map_err(|e| MalformedUpload::Invalid(e.to_string()))?;
    if upload.transcript.is_none() && upload.media_url().is_none() {
        return Err(MalformedUpload::MissingMedia);
    }
    Ok(upload)
}

/// First pipeline stage: upload message → wire job
pub struct IntakeStage {
    transcriber: Arc<dyn Transcriber>,
    retry: RetryPolicy,
}

impl IntakeStage {
    pub fn new(transcriber: Arc<dyn Transcriber>, retry: RetryPolicy) -> Self {
        Self { transcriber, retry }
    }

    /// Normalize and enrich one upload message into a job
    pub async fn prepare(&self, body: &str) -> Result<Job, IntakeError> {
        let upload = parse_upload(body)?;

        let transcription = match (&upload.transcript, upload.media_url()) {
            (Some(transcript), _) => Transcription {
                transcript: transcript.clone(),
                ..Transcription::default()
            },
            (None, Some(media_url)) => {
                retry_with_backoff(
                    "transcribe",
                    &self.retry,
                    ProviderError::is_transient,
                    || self.transcriber.transcribe(media_url),
                )
                .await?
            }
            (None, None) => return Err(MalformedUpload::MissingMedia.into()),
        };

        let job = build_job(upload, transcription)?;
        tracing::debug!(
            session_id = %job.session_id,
            sequence_number = job.sequence_number,
            transcriber = self.transcriber.name(),
            "Upload normalized"
        );
        Ok(job)
    }
}

/// Assemble the job through the wire parser so both stages agree on what a
/// valid sequence number and terminal flag are
fn build_job(upload: UploadMessage, transcription: Transcription) -> Result<Job, MalformedUpload> {
    let mut fields = Map::new();
    fields.insert(FIELD_SESSION_ID.into(), Value::String(upload.presentation_id));
    fields.insert(FIELD_SEQUENCE_NUMBER.into(), upload.clip_index);
    fields.insert(FIELD_TERMINAL.into(), upload.is_end);

    let mut optional = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            fields.insert(key.to_string(), value);
        }
    };
    optional("user_id", upload.user_id.map(Value::String));
    optional("transcript", Some(Value::String(transcription.transcript)));
    optional("slide_url", upload.slide_url.map(Value::String));
    optional("video_url", upload.video_url.or(upload.audio_url).map(Value::String));
    optional("emotions", transcription.emotions);
    optional(
        "score",
        transcription
            .score
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
    );

    Ok(parse_wire_job(&Value::Object(fields).to_string())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTranscriber {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transcriber for CountingTranscriber {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn transcribe(&self, media_url: &str) -> Result<Transcription, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Transcription {
                transcript: format!("spoken words from {}", media_url),
                emotions: Some(json!({"joy": 0.5})),
                score: Some(0.25),
            })
        }
    }

    fn stage() -> (Arc<CountingTranscriber>, IntakeStage) {
        let transcriber = Arc::new(CountingTranscriber {
            calls: AtomicU32::new(0),
        });
        let stage = IntakeStage::new(transcriber.clone(), RetryPolicy::none());
        (transcriber, stage)
    }

    #[tokio::test]
    async fn test_upload_becomes_job() {
        let (transcriber, stage) = stage();
        let job = stage
            .prepare(
                r#"{"presentationID":"p1","userID":"u1","clipIndex":2,
                    "videoURL":"v.webm","slideURL":"s.png","isEnd":"true"}"#,
            )
            .await
            .unwrap();

        assert_eq!(job.session_id, "p1");
        assert_eq!(job.sequence_number, 2);
        assert!(job.terminal);
        assert_eq!(job.payload["transcript"], "spoken words from v.webm");
        assert_eq!(job.payload["user_id"], "u1");
        assert_eq!(job.payload["emotions"], json!({"joy": 0.5}));
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inline_transcript_skips_transcriber() {
        let (transcriber, stage) = stage();
        let job = stage
            .prepare(r#"{"presentationID":"p1","clipIndex":"0","transcript":"hello"}"#)
            .await
            .unwrap();
        assert_eq!(job.payload["transcript"], "hello");
        assert!(!job.terminal);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_uploads() {
        let (_, stage) = stage();
        for body in [
            r#"{"clipIndex":0,"videoURL":"v"}"#,
            r#"{"presentationID":"p1","clipIndex":0}"#,
            r#"{"presentationID":"p1","clipIndex":"x","videoURL":"v"}"#,
            r#"{"presentationID":"p1","clipIndex":0,"videoURL":"v","isEnd":"maybe"}"#,
        ] {
            assert!(
                matches!(stage.prepare(body).await, Err(IntakeError::Malformed(_))),
                "accepted {}",
                body
            );
        }
    }

    #[test]
    fn test_audio_url_stands_in_for_video() {
        let upload =
            parse_upload(r#"{"presentationID":"p","clipIndex":0,"audioURL":"a.mp3"}"#).unwrap();
        assert_eq!(upload.media_url(), Some("a.mp3"));
    }
}
