use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use qproxy_common::WEBHOOK_TIMEOUT;
use qproxy_protocol::{ChatMessage, Role};
use qproxy_provider::{ChatRequest, OutputFormat};

use crate::job::Job;
use crate::state::AppState;

const DEFAULT_CATEGORIES: &[&str] = &["technical", "billing", "account", "general"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClassification {
    pub title: String,
    pub category: String,
    pub priority: String,
    pub reason: String,
}

/// The classifier arms only for completed low-priority ticket jobs.
pub fn should_classify(job: &Job) -> bool {
    job.ticket_id.is_some()
        && job
            .category
            .as_deref()
            .is_some_and(|category| category.to_lowercase() == "low")
}

pub fn build_prompts(categories: &[String], reply: &str) -> (String, String) {
    let system = format!(
        "You classify resolved support tickets. Allowed categories: {}. \
         Reply with a single JSON object with the keys \"title\", \"category\", \
         \"priority\" and \"reason\", and nothing else.",
        categories.join(", ")
    );
    let user = format!("Classify the ticket whose final assistant reply was:\n\n{reply}");
    (system, user)
}

/// A category outside the allowed list becomes `general`, with the reason
/// annotated.
pub fn normalize(mut parsed: TicketClassification, allowed: &[String]) -> TicketClassification {
    if !allowed.iter().any(|category| category == &parsed.category) {
        parsed.reason = format!(
            "category '{}' is not in the allowed list, defaulted to general. {}",
            parsed.category, parsed.reason
        );
        parsed.category = "general".to_string();
    }
    parsed
}

/// Fire-and-forget: every failure here is logged and swallowed; the HTTP
/// reply has already been sent.
pub async fn classify_and_push(state: Arc<AppState>, job: Job, reply: String) {
    let Some(ticket_id) = job.ticket_id.clone() else {
        return;
    };
    let (Some(base_url), Some(secret)) = (
        state.settings.webhook_base_url.clone(),
        state.settings.webhook_secret.clone(),
    ) else {
        debug!(event = "webhook_not_configured", ticket_id = %ticket_id);
        return;
    };

    let categories: Vec<String> = job
        .ticket_categories
        .clone()
        .filter(|categories| !categories.is_empty())
        .unwrap_or_else(|| DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect());

    let (system, user) = build_prompts(&categories, &reply);
    let request = ChatRequest {
        messages: vec![
            ChatMessage::text(Role::System, system),
            ChatMessage::text(Role::User, user),
        ],
        files: Vec::new(),
        temperature: 0.0,
        tools: None,
        tool_choice: None,
        output_format: OutputFormat::Json,
    };

    let response = match state.router.dispatch(&job.provider, &request).await {
        Ok((_, response)) => response,
        Err(err) => {
            warn!(event = "classification_failed", ticket_id = %ticket_id, error = %err);
            return;
        }
    };
    let text = response.first_text().unwrap_or_default();
    let parsed: TicketClassification = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(event = "classification_parse_failed", ticket_id = %ticket_id, error = %err);
            return;
        }
    };
    let classification = normalize(parsed, &categories);
    push_webhook(&base_url, &secret, &ticket_id, &classification).await;
}

async fn push_webhook(
    base_url: &str,
    secret: &str,
    ticket_id: &str,
    classification: &TicketClassification,
) {
    let client = match reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(event = "webhook_client_failed", error = %err);
            return;
        }
    };
    let url = format!("{}/tickets/{}", base_url.trim_end_matches('/'), ticket_id);
    let body = json!({
        "ticket_id": ticket_id,
        "title": classification.title,
        "category": classification.category,
        "priority": classification.priority,
        "reason": classification.reason,
    });

    match client
        .put(&url)
        .header("x-api-key", secret)
        .json(&body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!(event = "webhook_delivered", ticket_id = %ticket_id, status = response.status().as_u16());
        }
        Ok(response) => {
            warn!(event = "webhook_rejected", ticket_id = %ticket_id, status = response.status().as_u16());
        }
        Err(err) => {
            warn!(event = "webhook_failed", ticket_id = %ticket_id, error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(category: Option<&str>, ticket: Option<&str>) -> Job {
        Job {
            id: "t-1-abc".to_string(),
            request_id: "req".to_string(),
            tenant: "t".to_string(),
            provider: "openai".to_string(),
            messages: Vec::new(),
            files: Vec::new(),
            temperature: 0.7,
            tools: None,
            tool_choice: None,
            ticket_id: ticket.map(str::to_string),
            ticket_categories: None,
            category: category.map(str::to_string),
            name_user: None,
            started_at: 0,
        }
    }

    #[test]
    fn gate_requires_ticket_and_low_priority() {
        assert!(should_classify(&job_with(Some("low"), Some("T-1"))));
        assert!(should_classify(&job_with(Some("LOW"), Some("T-1"))));
        assert!(!should_classify(&job_with(Some("high"), Some("T-1"))));
        assert!(!should_classify(&job_with(Some("low"), None)));
        assert!(!should_classify(&job_with(None, Some("T-1"))));
    }

    #[test]
    fn unknown_category_defaults_to_general() {
        let allowed = vec!["billing".to_string(), "general".to_string()];
        let parsed = TicketClassification {
            title: "refund".to_string(),
            category: "finance".to_string(),
            priority: "low".to_string(),
            reason: "asks about money".to_string(),
        };
        let normalized = normalize(parsed, &allowed);
        assert_eq!(normalized.category, "general");
        assert!(normalized.reason.contains("finance"));
        assert!(normalized.reason.contains("asks about money"));
    }

    #[test]
    fn known_category_is_untouched() {
        let allowed = vec!["billing".to_string()];
        let parsed = TicketClassification {
            title: "refund".to_string(),
            category: "billing".to_string(),
            priority: "low".to_string(),
            reason: "money".to_string(),
        };
        let normalized = normalize(parsed, &allowed);
        assert_eq!(normalized.category, "billing");
        assert_eq!(normalized.reason, "money");
    }

    #[test]
    fn prompts_enumerate_categories_and_carry_reply() {
        let categories = vec!["billing".to_string(), "technical".to_string()];
        let (system, user) = build_prompts(&categories, "it was the cache");
        assert!(system.contains("billing, technical"));
        assert!(user.contains("it was the cache"));
    }
}
