//! OpenAI Assistants provider
//!
//! One conversation per session, held as an assistant thread:
//! - `initialize_session`: `POST /threads`
//! - `submit_segment`: add the transcript and slide image, run the assistant,
//!   read the newest message
//! - `finalize`: ask for the closing summary the same way
//!
//! [`OpenAiAssistantProvider::await_run`] is the only place that waits on the
//! remote side. It polls with bounded exponential backoff and gives up after
//! the completion timeout.

use async_trait::async_trait;
use clipq_common::config::ProviderConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{FeedbackProvider, ProviderError, SegmentInput, SessionContext};
use crate::utils::exponential_backoff;

const USER_AGENT: &str = concat!("clipq/", env!("CARGO_PKG_VERSION"));

const SEGMENT_INSTRUCTIONS: &str = "Now evaluate this segment according the criteria, using the \
presentation description, audience description, and tone description given earlier. Format your \
response as bullet points under the relevant headers. Afterwards, list suggestions for improvements \
if there are any (be as specific as possible). Finally, give an overall score out of 10. Give your \
entire response in markdown format (but keep as bullet points under each main criteria, not \
subheaders).";

const SUMMARY_PROMPT: &str = "The presentation is over. Give a score out of 10 for the entire \
presentation. Keeping in mind the presentation description, audience description, and tone \
description, summarize all your feedback, emphasizing the most important suggestions for \
improvement and if the presentation was effective in achieving its goal. Keep in mind the visuals \
of slides, accuracy of content, if it concluded in a satisfying manner, the overall narrative flow \
and how all the segments fit together. Give your entire response in markdown format";

/// Connection and polling settings
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub assistant_id: String,
    pub request_timeout: Duration,
    pub completion_timeout: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl OpenAiSettings {
    pub fn from_config(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let assistant_id = config
            .assistant_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("[provider] assistant_id is required".into()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            organization: config.organization.clone(),
            project: config.project.clone(),
            assistant_id,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            completion_timeout: Duration::from_secs(config.completion_timeout_secs),
            poll_initial: Duration::from_millis(config.poll_initial_ms),
            poll_max: Duration::from_millis(config.poll_max_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
    #[serde(default)]
    incomplete_details: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<Value>,
}

/// Where a run stands after one poll
#[derive(Debug, PartialEq, Eq)]
enum RunState {
    Pending,
    Completed,
    Ended,
}

fn run_state(status: &str) -> RunState {
    match status {
        "queued" | "in_progress" | "cancelling" => RunState::Pending,
        "completed" => RunState::Completed,
        // failed, cancelled, expired, incomplete, requires_action
        _ => RunState::Ended,
    }
}

/// Prompt text for one segment
pub fn segment_prompt(index: u64, transcript: &str) -> String {
    format!("Transcript {}: {}\n{}", index, transcript, SEGMENT_INSTRUCTIONS)
}

/// Thread-based assistant client
pub struct OpenAiAssistantProvider {
    http_client: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiAssistantProvider {
    pub fn new(settings: OpenAiSettings) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout)
            .default_headers(default_headers(&settings)?)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    async fn add_message(&self, thread_id: &str, content: Value) -> Result<(), ProviderError> {
        let _: Created = self
            .send(
                self.http_client
                    .post(self.url(&format!("/threads/{}/messages", thread_id)))
                    .json(&json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str) -> Result<Run, ProviderError> {
        self.send(
            self.http_client
                .post(self.url(&format!("/threads/{}/runs", thread_id)))
                .json(&json!({ "assistant_id": self.settings.assistant_id })),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ProviderError> {
        self.send(
            self.http_client
                .get(self.url(&format!("/threads/{}/runs/{}", thread_id, run_id))),
        )
        .await
    }

    /// Wait for a run to finish
    ///
    /// Polls with exponential backoff between `poll_initial` and `poll_max`.
    /// A run still pending after `completion_timeout` is a timeout error; any
    /// terminal status other than `completed` is a run error.
    pub async fn await_run(&self, thread_id: &str, run_id: &str) -> Result<(), ProviderError> {
        let start_time = Instant::now();
        let mut polls = 0u32;

        loop {
            let run = self.get_run(thread_id, run_id).await?;
            match run_state(&run.status) {
                RunState::Completed => {
                    tracing::debug!(
                        thread_id,
                        run_id,
                        polls,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Assistant run completed"
                    );
                    return Ok(());
                }
                RunState::Ended => {
                    let detail = match (&run.last_error, &run.incomplete_details) {
                        (Some(err), _) => format!("{}: {}", err.code, err.message),
                        (None, Some(details)) => details.to_string(),
                        (None, None) => String::new(),
                    };
                    return Err(ProviderError::Run {
                        run_id: run.id,
                        status: run.status,
                        detail,
                    });
                }
                RunState::Pending => {}
            }

            let elapsed = start_time.elapsed();
            if elapsed >= self.settings.completion_timeout {
                return Err(ProviderError::Timeout(format!(
                    "run {} still {} after {} ms",
                    run_id,
                    run.status,
                    elapsed.as_millis()
                )));
            }

            let delay =
                exponential_backoff(self.settings.poll_initial, self.settings.poll_max, polls)
                    .min(self.settings.completion_timeout - elapsed);
            polls += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Text of the newest message in the thread
    async fn latest_reply(&self, thread_id: &str) -> Result<String, ProviderError> {
        let messages: MessageList = self
            .send(
                self.http_client
                    .get(self.url(&format!("/threads/{}/messages", thread_id)))
                    .query(&[("order", "desc"), ("limit", "1")]),
            )
            .await?;

        messages
            .data
            .first()
            .and_then(|message| {
                message.content.iter().find_map(|part| {
                    part.get("text")
                        .and_then(|text| text.get("value"))
                        .and_then(Value::as_str)
                })
            })
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse(format!("thread {} has no text reply", thread_id)))
    }

    /// Post a user message, run the assistant and return its reply
    async fn exchange(&self, thread_id: &str, content: Value) -> Result<String, ProviderError> {
        self.add_message(thread_id, content).await?;
        let run = self.start_run(thread_id).await?;
        self.await_run(thread_id, &run.id).await?;
        self.latest_reply(thread_id).await
    }
}

fn default_headers(settings: &OpenAiSettings) -> Result<HeaderMap, ProviderError> {
    fn value(raw: &str) -> Result<HeaderValue, ProviderError> {
        HeaderValue::from_str(raw)
            .map_err(|e| ProviderError::Config(format!("invalid header value: {}", e)))
    }

    let mut headers = HeaderMap::new();
    let mut auth = value(&format!("Bearer {}", settings.api_key))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(HeaderName::from_static("openai-beta"), value("assistants=v2")?);
    if let Some(organization) = &settings.organization {
        headers.insert(HeaderName::from_static("openai-organization"), value(organization)?);
    }
    if let Some(project) = &settings.project {
        headers.insert(HeaderName::from_static("openai-project"), value(project)?);
    }
    Ok(headers)
}

#[async_trait]
impl FeedbackProvider for OpenAiAssistantProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn initialize_session(&self, context: &SessionContext) -> Result<String, ProviderError> {
        let thread: Created = self
            .send(self.http_client.post(self.url("/threads")).json(&json!({})))
            .await?;
        tracing::info!(
            session_id = %context.session_id,
            thread_id = %thread.id,
            "Assistant thread created"
        );
        Ok(thread.id)
    }

    async fn submit_segment(
        &self,
        handle: &str,
        input: &SegmentInput,
    ) -> Result<String, ProviderError> {
        let mut content = vec![json!({
            "type": "text",
            "text": segment_prompt(input.index, &input.transcript),
        })];
        if let Some(slide_url) = &input.slide_url {
            content.push(json!({ "type": "image_url", "image_url": { "url": slide_url } }));
        }
        self.exchange(handle, Value::Array(content)).await
    }

    async fn finalize(&self, handle: &str) -> Result<String, ProviderError> {
        self.exchange(handle, json!([{ "type": "text", "text": SUMMARY_PROMPT }]))
            .await
    }
}
