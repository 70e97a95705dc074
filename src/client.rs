//! Language-model clients
//!
//! Every backend speaks the OpenAI-compatible chat-completions protocol and
//! exposes the same [`ModelClient`] contract, so explainers and scorers do
//! not care whether they talk to a hosted provider or a local server.
//!
//! Failures are classified at this boundary: timeouts, connection errors,
//! 408, 429 and 5xx are transient; any other non-success status is
//! permanent, as is a success body that does not decode.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{ClientError, Result};

pub const DEFAULT_REMOTE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_LOCAL_URL: &str = "http://localhost:8000/v1";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling options shared by every request a component sends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, options: GenerationOptions) -> Self {
        Self { messages, options }
    }

    /// The last user message, handy for logging and test doubles
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub model: String,
}

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// Send a chat prompt, get text back.
///
/// Implementations must be safe to share across concurrently running units.
pub trait ModelClient: Send + Sync {
    /// Model identifier recorded in score metadata
    fn model_id(&self) -> &str;

    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<Completion>> + Send;
}

impl<C: ModelClient> ModelClient for Arc<C> {
    fn model_id(&self) -> &str {
        self.as_ref().model_id()
    }

    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<Completion>> + Send {
        self.as_ref().complete(request)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted provider; needs an API key
    Remote,
    /// Self-hosted server; no key
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendKind,
    pub model: String,
    /// Defaults per backend when unset
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Remote,
            model: "meta-llama/llama-3.1-70b-instruct".to_string(),
            base_url: None,
            api_key: None,
            timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Chat-completions transport
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
struct ChatTransport {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatTransport {
    fn new(base_url: String, model: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            model,
            api_key,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post_chat(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequestBody {
            model: &self.model,
            messages: &request.messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
        };

        let mut builder = self.http.post(self.url()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail).into());
        }

        let body = response.text().await.map_err(classify_reqwest_error)?;
        let completion = parse_chat_response(&body, &self.model)?;
        debug!(model = %completion.model, chars = completion.text.len(), "completion received");
        Ok(completion)
    }
}

/// Decode a chat-completions success body.
///
/// A body that is not the expected JSON is permanent; a well-formed reply
/// without a message is malformed and may be retried.
pub fn parse_chat_response(body: &str, fallback_model: &str) -> Result<Completion> {
    let parsed: ChatResponseBody = serde_json::from_str(body).map_err(|e| {
        ClientError::Permanent(format!("undecodable body: {e}: {}", truncate(body, 200)))
    })?;
    let model = parsed.model.unwrap_or_else(|| fallback_model.to_string());
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ClientError::MalformedResponse("response has no choices".into()))?;
    Ok(Completion { text, model })
}

/// Map an HTTP status to a transient or permanent failure
pub fn classify_status(status: StatusCode, detail: &str) -> ClientError {
    let message = format!("HTTP {status}: {}", truncate(detail, 200));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ClientError::Transient(message)
    } else {
        ClientError::Permanent(message)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ClientError::Transient(err.to_string())
    } else {
        ClientError::Permanent(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Hosted provider client (API key required)
#[derive(Debug, Clone)]
pub struct RemoteClient {
    transport: ChatTransport,
}

impl RemoteClient {
    pub fn new(model: &str, api_key: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(ClientError::Permanent("remote backend requires an API key".into()).into());
        }
        let transport = ChatTransport::new(
            base_url.unwrap_or(DEFAULT_REMOTE_URL).to_string(),
            model.to_string(),
            Some(api_key.to_string()),
            timeout,
        )?;
        Ok(Self { transport })
    }
}

impl ModelClient for RemoteClient {
    fn model_id(&self) -> &str {
        &self.transport.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.transport.post_chat(request).await
    }
}

/// Self-hosted model server client (no key)
#[derive(Debug, Clone)]
pub struct LocalClient {
    transport: ChatTransport,
}

impl LocalClient {
    pub fn new(model: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let transport = ChatTransport::new(
            base_url.unwrap_or(DEFAULT_LOCAL_URL).to_string(),
            model.to_string(),
            None,
            timeout,
        )?;
        Ok(Self { transport })
    }
}

impl ModelClient for LocalClient {
    fn model_id(&self) -> &str {
        &self.transport.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.transport.post_chat(request).await
    }
}

/// The configured backend
#[derive(Debug, Clone)]
pub enum ModelBackend {
    Remote(RemoteClient),
    Local(LocalClient),
}

impl ModelBackend {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let base_url = config.base_url.as_deref();
        match config.backend {
            BackendKind::Remote => {
                let key = config.api_key.as_deref().unwrap_or_default();
                Ok(ModelBackend::Remote(RemoteClient::new(
                    &config.model,
                    key,
                    base_url,
                    timeout,
                )?))
            }
            BackendKind::Local => Ok(ModelBackend::Local(LocalClient::new(
                &config.model,
                base_url,
                timeout,
            )?)),
        }
    }
}

impl ModelClient for ModelBackend {
    fn model_id(&self) -> &str {
        match self {
            ModelBackend::Remote(c) => c.model_id(),
            ModelBackend::Local(c) => c.model_id(),
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        match self {
            ModelBackend::Remote(c) => c.complete(request).await,
            ModelBackend::Local(c) => c.complete(request).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Concurrency limit
// ---------------------------------------------------------------------------

/// Caps in-flight calls across every clone sharing the same semaphore.
pub struct LimitedClient<C> {
    inner: Arc<C>,
    permits: Arc<Semaphore>,
}

impl<C> Clone for LimitedClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<C: ModelClient> LimitedClient<C> {
    pub fn new(inner: Arc<C>, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Free permits right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<C: ModelClient> ModelClient for LimitedClient<C> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::Permanent("client pool closed".into()))?;
        self.inner.complete(request).await
    }
}
