//! Inference collaborator contract and the Gemini `generateContent` client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use oprad_core::Source;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "oprad-inference";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Response schema in the OpenAPI subset the collaborator accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor(JsonValue);

impl SchemaDescriptor {
    pub fn new(schema: JsonValue) -> Self {
        Self(schema)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub grounding: bool,
    pub output_schema: Option<SchemaDescriptor>,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system_instruction: None,
            grounding: false,
            output_schema: None,
        }
    }

    /// Free-text call backed by web search.
    pub fn grounded(mut self) -> Self {
        self.grounding = true;
        self
    }

    pub fn with_schema(mut self, schema: SchemaDescriptor) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferenceResponse {
    pub text: String,
    pub citations: Vec<Source>,
}

impl InferenceResponse {
    /// First citation carrying a usable uri.
    pub fn first_citation(&self) -> Option<&Source> {
        self.citations
            .iter()
            .find(|citation| !citation.uri.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed response envelope: {0}")]
    MalformedEnvelope(String),
    #[error("empty response (block reason: {0:?})")]
    EmptyResponse(Option<String>),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, request: &InferenceRequest)
        -> Result<InferenceResponse, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() || err.is_timeout() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Short transport-level retries for rate limiting and flaky connections.
/// Longer recovery belongs to the callers.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    /// No per-call timeout unless set.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: None,
            user_agent: Some(format!("oprad/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.api_key.trim().is_empty(), "gemini api key is empty");

        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    async fn send_with_retries(
        &self,
        url: &str,
        body: &JsonValue,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await;

            let outcome = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    let text = resp.text().await.unwrap_or_default();
                    let err = CollaboratorError::HttpStatus {
                        status: status.as_u16(),
                        body: excerpt(&text, 300),
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), CollaboratorError::Transport(err)),
            };

            match outcome {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying gemini call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn generate(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, CollaboratorError> {
        let body = build_request_body(request)?;
        let url = self.endpoint(&request.model);
        let span = info_span!(
            "gemini_generate",
            model = %request.model,
            grounding = request.grounding,
            structured = request.output_schema.is_some()
        );

        async move {
            let bytes = self.send_with_retries(&url, &body).await?;
            let response = parse_generate_content(&bytes)?;
            debug!(
                chars = response.text.len(),
                citations = response.citations.len(),
                "gemini call complete"
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

/// JSON body for `models/{model}:generateContent`.
pub fn build_request_body(request: &InferenceRequest) -> Result<JsonValue, CollaboratorError> {
    if request.grounding && request.output_schema.is_some() {
        return Err(CollaboratorError::InvalidRequest(
            "search grounding cannot be combined with a response schema".to_string(),
        ));
    }

    let mut body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
    });
    if let Some(instruction) = &request.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if request.grounding {
        body["tools"] = json!([{ "google_search": {} }]);
    }
    if let Some(schema) = &request.output_schema {
        body["generationConfig"] = json!({
            "responseMimeType": "application/json",
            "responseSchema": schema.as_json(),
        });
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebChunk>,
}

#[derive(Debug, Deserialize)]
struct WebChunk {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Decode a `generateContent` envelope into text plus web citations taken
/// from the first candidate.
pub fn parse_generate_content(bytes: &[u8]) -> Result<InferenceResponse, CollaboratorError> {
    let envelope: GenerateContentResponse = serde_json::from_slice(bytes)
        .map_err(|err| CollaboratorError::MalformedEnvelope(err.to_string()))?;

    let Some(candidate) = envelope.candidates.into_iter().next() else {
        let reason = envelope.prompt_feedback.and_then(|f| f.block_reason);
        return Err(CollaboratorError::EmptyResponse(reason));
    };

    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(CollaboratorError::EmptyResponse(None));
    }

    let citations = candidate
        .grounding_metadata
        .map(|metadata| {
            metadata
                .grounding_chunks
                .into_iter()
                .filter_map(|chunk| chunk.web)
                .filter_map(|web| {
                    let uri = web.uri?;
                    let title = web.title.unwrap_or_else(|| uri.clone());
                    Some(Source { title, uri })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(InferenceResponse { text, citations })
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
