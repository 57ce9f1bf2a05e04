//! Feedback provider capability
//!
//! The conversational service that turns ordered segments into feedback. One
//! client handle is built at startup from `[provider]` and passed explicitly to
//! the feedback consumer.
//!
//! Every call may fail transiently; retrying is the caller's decision
//! (see [`ProviderError::is_transient`]).

pub mod echo;
pub mod openai;

pub use echo::EchoProvider;
pub use openai::{OpenAiAssistantProvider, OpenAiSettings};

use async_trait::async_trait;
use clipq_common::config::{resolve_provider_api_key, ProviderKind, TomlConfig};
use clipq_common::SequenceNumber;
use std::sync::Arc;
use thiserror::Error;

/// Provider call errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Run {run_id} ended as {status}: {detail}")]
    Run {
        run_id: String,
        status: String,
        detail: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Worth retrying: connectivity, timeouts, rate limiting and server errors
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            // Server-side run failures are usually load related
            ProviderError::Run { status, .. } => status == "failed" || status == "expired",
            ProviderError::Parse(_) | ProviderError::Config(_) => false,
        }
    }
}

/// What the provider is told when a session's conversation is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
}

/// One segment submitted to an open conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInput {
    pub index: SequenceNumber,
    pub transcript: String,
    pub slide_url: Option<String>,
}

/// Conversational feedback service
#[async_trait]
pub trait FeedbackProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Open a conversation and return its opaque handle
    async fn initialize_session(&self, context: &SessionContext) -> Result<String, ProviderError>;

    /// Append a segment and return the feedback text for it
    async fn submit_segment(
        &self,
        handle: &str,
        input: &SegmentInput,
    ) -> Result<String, ProviderError>;

    /// Ask for the closing summary of the conversation
    async fn finalize(&self, handle: &str) -> Result<String, ProviderError>;
}

/// Build the configured provider
///
/// The `openai` provider requires an API key (environment or TOML) and an
/// assistant id.
pub fn build_provider(config: &TomlConfig) -> Result<Arc<dyn FeedbackProvider>, ProviderError> {
    match config.provider.kind {
        ProviderKind::Echo => Ok(Arc::new(EchoProvider::new())),
        ProviderKind::Openai => {
            let api_key = resolve_provider_api_key(config).ok_or_else(|| {
                ProviderError::Config(format!(
                    "openai provider requires an API key ({} or [provider] api_key)",
                    clipq_common::config::ENV_PROVIDER_API_KEY
                ))
            })?;
            let settings = OpenAiSettings::from_config(&config.provider, api_key)?;
            Ok(Arc::new(OpenAiAssistantProvider::new(settings)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Timeout("run".into()).is_transient());
        assert!(ProviderError::Api { status: 429, message: String::new() }.is_transient());
        assert!(ProviderError::Api { status: 503, message: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 401, message: String::new() }.is_transient());
        assert!(!ProviderError::Parse("bad".into()).is_transient());
        assert!(!ProviderError::Run {
            run_id: "r".into(),
            status: "requires_action".into(),
            detail: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_build_echo_provider_by_default() {
        let provider = build_provider(&TomlConfig::default()).unwrap();
        assert_eq!(provider.name(), "echo");
    }

    #[test]
    fn test_openai_without_assistant_is_config_error() {
        let mut config = TomlConfig::default();
        config.provider.kind = ProviderKind::Openai;
        config.provider.api_key = Some("sk-test".into());
        assert!(matches!(build_provider(&config), Err(ProviderError::Config(_))));
    }
}
