use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use qproxy_common::now_epoch_ms;
use qproxy_protocol::{ChatMessage, FileAttachment, ToolDefinition};

const JOB_SUFFIX_LEN: usize = 9;
const JOB_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub fn queue_key(tenant: &str) -> String {
    format!("queue:{tenant}")
}

pub fn lock_key(tenant: &str) -> String {
    format!("lock:{tenant}")
}

pub fn result_key(job_id: &str) -> String {
    format!("result:{job_id}")
}

/// One queued unit of work, serialized as JSON on the tenant's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub request_id: String,
    pub tenant: String,
    /// Primary provider for this job; fallback may serve it.
    pub provider: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_categories: Option<Vec<String>>,
    /// Priority tag; `"low"` arms the ticket classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_user: Option<String>,
    /// Admission time, ms since epoch.
    pub started_at: i64,
}

impl Job {
    /// `{tenant}-{ms-epoch}-{9-char random}`.
    pub fn new_id(tenant: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..JOB_SUFFIX_LEN)
            .map(|_| JOB_SUFFIX_CHARSET[rng.gen_range(0..JOB_SUFFIX_CHARSET.len())] as char)
            .collect();
        format!("{tenant}-{}-{suffix}", now_epoch_ms())
    }
}

/// Terminal outcome published into the result slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn ok(data: JsonValue) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qproxy_protocol::Role;

    #[test]
    fn job_id_is_tenant_prefixed_with_nine_char_suffix() {
        let id = Job::new_id("acme");
        let mut pieces = id.splitn(3, '-');
        assert_eq!(pieces.next(), Some("acme"));
        let stamp = pieces.next().unwrap();
        assert!(stamp.parse::<i64>().is_ok());
        let suffix = pieces.next().unwrap();
        assert_eq!(suffix.len(), 9);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn key_layout() {
        assert_eq!(queue_key("acme"), "queue:acme");
        assert_eq!(lock_key("acme"), "lock:acme");
        assert_eq!(result_key("acme-1-abc"), "result:acme-1-abc");
    }

    #[test]
    fn job_round_trips_through_queue_payload() {
        let job = Job {
            id: Job::new_id("acme"),
            request_id: "req-1".to_string(),
            tenant: "acme".to_string(),
            provider: "openai".to_string(),
            messages: vec![ChatMessage::text(Role::User, "hi")],
            files: Vec::new(),
            temperature: 0.7,
            tools: None,
            tool_choice: None,
            ticket_id: Some("T-1".to_string()),
            ticket_categories: None,
            category: Some("low".to_string()),
            name_user: None,
            started_at: 1,
        };
        let payload = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&payload).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.ticket_id.as_deref(), Some("T-1"));
        assert_eq!(back.messages.len(), 1);
    }
}
