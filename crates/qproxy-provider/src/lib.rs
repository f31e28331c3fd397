pub mod gemini;
mod http;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use qproxy_protocol::{
    CanonicalResponse, ChatMessage, EmbeddingResponse, FileAttachment, ToolDefinition,
};

pub use gemini::{GeminiConfig, GeminiProvider, SAFETY_PLACEHOLDER};
pub use openai::{OpenAiConfig, OpenAiProvider};

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),
    #[error("upstream request failed: {0}")]
    Network(String),
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("malformed upstream body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

/// Requested reply framing. `Json` is used by the ticket classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Canonical invocation every adapter accepts.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub files: Vec<FileAttachment>,
    pub temperature: f64,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<JsonValue>,
    pub output_format: OutputFormat,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            files: Vec::new(),
            temperature: 0.7,
            tools: None,
            tool_choice: None,
            output_format: OutputFormat::Text,
        }
    }
}

/// Per-provider translator plus HTTP invocation. Adapters never retry;
/// retries belong to the router.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_credentials(&self) -> bool;

    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<CanonicalResponse>;

    async fn embed(&self, inputs: &[String]) -> ProviderResult<EmbeddingResponse>;
}
