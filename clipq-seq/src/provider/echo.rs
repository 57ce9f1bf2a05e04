//! Deterministic local provider
//!
//! No network. Handy for development runs and for exercising the pipeline end
//! to end in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{FeedbackProvider, ProviderError, SegmentInput, SessionContext};

#[derive(Debug, Default)]
pub struct EchoProvider {
    next_conversation: AtomicU64,
    /// Segments seen per conversation handle
    segments: Mutex<HashMap<String, u64>>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversations opened so far
    pub fn conversations_opened(&self) -> u64 {
        self.next_conversation.load(Ordering::SeqCst)
    }

    fn bump(&self, handle: &str) -> u64 {
        let mut segments = self.segments.lock().unwrap_or_else(|e| e.into_inner());
        let count = segments.entry(handle.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn count(&self, handle: &str) -> u64 {
        let segments = self.segments.lock().unwrap_or_else(|e| e.into_inner());
        segments.get(handle).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedbackProvider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn initialize_session(&self, context: &SessionContext) -> Result<String, ProviderError> {
        let n = self.next_conversation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("echo-{}-{}", context.session_id, n))
    }

    async fn submit_segment(
        &self,
        handle: &str,
        input: &SegmentInput,
    ) -> Result<String, ProviderError> {
        let seen = self.bump(handle);
        let words = input.transcript.split_whitespace().count();
        Ok(format!(
            "- Segment {} ({} of conversation): {} words{}",
            input.index,
            seen,
            words,
            if input.slide_url.is_some() { ", slide attached" } else { "" }
        ))
    }

    async fn finalize(&self, handle: &str) -> Result<String, ProviderError> {
        Ok(format!("Summary: {} segments reviewed", self.count(handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_counts_segments_per_conversation() {
        let provider = EchoProvider::new();
        let handle = provider
            .initialize_session(&SessionContext { session_id: "p1".into() })
            .await
            .unwrap();
        assert_eq!(handle, "echo-p1-1");

        let feedback = provider
            .submit_segment(
                &handle,
                &SegmentInput {
                    index: 0,
                    transcript: "hello there everyone".into(),
                    slide_url: Some("https://slides/0.png".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(feedback, "- Segment 0 (1 of conversation): 3 words, slide attached");

        assert_eq!(provider.finalize(&handle).await.unwrap(), "Summary: 1 segments reviewed");
        assert_eq!(provider.conversations_opened(), 1);
    }
}
