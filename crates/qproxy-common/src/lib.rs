use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Lock TTL must stay above the longest permitted single job (180 s) with margin.
pub const LOCK_TTL_SECS: u64 = 300;
pub const RESULT_TTL_SECS: u64 = 300;
/// Blocking-pop timeout; bounds idle wake-up latency for queue cleanup.
pub const BLPOP_TIMEOUT_SECS: u64 = 1;
pub const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(180);
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_TENANT: &str = "default_org";

/// Upstream provider family. Unknown names are coerced to the configured
/// default at admission, never surfaced as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }
}

/// Final, merged runtime configuration consumed by the rest of the workspace.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Service-to-service key; auth is enforced only when this is set.
    pub service_api_key: Option<String>,
    pub primary_provider: ProviderKind,
    pub embedding_provider: ProviderKind,
    pub allow_provider_override: bool,
    pub webhook_base_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub openai_base_url: String,
    pub openai_chat_model: String,
    pub openai_vision_model: String,
    pub openai_embedding_model: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub gemini_embedding_model: String,
}

impl Settings {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            openai_api_key: None,
            gemini_api_key: None,
            service_api_key: None,
            primary_provider: ProviderKind::OpenAi,
            embedding_provider: ProviderKind::OpenAi,
            allow_provider_override: false,
            webhook_base_url: None,
            webhook_secret: None,
            openai_base_url: "https://api.openai.com".to_string(),
            openai_chat_model: "gpt-4o-mini".to_string(),
            openai_vision_model: "gpt-4o".to_string(),
            openai_embedding_model: "text-embedding-3-small".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_embedding_model: "text-embedding-004".to_string(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// ISO-8601 timestamp for response metadata.
pub fn iso_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
