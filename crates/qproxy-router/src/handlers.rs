use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, warn};
use uuid::Uuid;

use qproxy_common::{iso_timestamp, now_epoch_ms, ProviderKind, DEFAULT_TENANT, JOB_WAIT_TIMEOUT};
use qproxy_core::credits::{embedding_cost_usd, QueryType};
use qproxy_core::job::{queue_key, Job};
use qproxy_core::{ensure_worker, wait_for_result, AppState, WaitOutcome};
use qproxy_kv::KvStore as _;
use qproxy_protocol::{ChatMessage, FileAttachment, ToolDefinition};
use qproxy_provider::openai::NO_TEXT_SENTINEL;

const AUDIO_EMPTY_PLACEHOLDER: &str =
    "[Audio processed. No spoken words detected (Music/Instrumental).]";
const OCR_EMPTY_PLACEHOLDER: &str = "Visual content only. No text detected in this image.";

pub async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    messages: Option<JsonValue>,
    #[serde(default)]
    files: Option<Vec<FileAttachment>>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    organization_id: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, rename = "nameUser")]
    name_user: Option<String>,
    #[serde(default)]
    ticket_id: Option<String>,
    #[serde(default)]
    ticket_categories: Option<Vec<String>>,
    #[serde(default)]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    tool_choice: Option<JsonValue>,
}

/// Chat admission: validate, enqueue, make sure a worker is live, then hold
/// the request open until the result slot fills or the deadline passes.
pub async fn chat(State(state): State<Arc<AppState>>, Json(body): Json<ChatBody>) -> Response {
    let Some(messages_value) = body.messages.filter(JsonValue::is_array) else {
        return bad_request("messages must be an array");
    };
    let messages: Vec<ChatMessage> = match serde_json::from_value(messages_value) {
        Ok(messages) => messages,
        Err(err) => return bad_request(&format!("invalid messages: {err}")),
    };

    let tenant = body
        .organization_id
        .filter(|tenant| !tenant.is_empty())
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let provider = state.router.select_provider(body.provider.as_deref());

    let job = Job {
        id: Job::new_id(&tenant),
        request_id: Uuid::new_v4().to_string(),
        tenant: tenant.clone(),
        provider,
        messages,
        files: body.files.unwrap_or_default(),
        temperature: body.temperature.unwrap_or(0.7),
        tools: body.tools,
        tool_choice: body.tool_choice,
        ticket_id: body.ticket_id,
        ticket_categories: body.ticket_categories,
        category: body.category,
        name_user: body.name_user,
        started_at: now_epoch_ms(),
    };
    info!(
        event = "chat_admitted",
        request_id = %job.request_id,
        job_id = %job.id,
        tenant = %tenant,
        provider = %job.provider
    );

    let payload = match serde_json::to_string(&job) {
        Ok(payload) => payload,
        Err(err) => {
            error!(event = "job_encode_failed", job_id = %job.id, error = %err);
            return internal_error("failed to enqueue request");
        }
    };
    if let Err(err) = state.kv.rpush(&queue_key(&tenant), &payload).await {
        error!(event = "enqueue_failed", job_id = %job.id, error = %err);
        return internal_error("queue unavailable");
    }
    ensure_worker(&state, &tenant);

    match wait_for_result(state.kv.as_ref(), &job.id, JOB_WAIT_TIMEOUT).await {
        WaitOutcome::Completed(result) if result.success => {
            (StatusCode::OK, Json(result.data.unwrap_or(JsonValue::Null))).into_response()
        }
        WaitOutcome::Completed(result) => internal_error(
            result
                .error
                .as_deref()
                .unwrap_or("job failed without detail"),
        ),
        WaitOutcome::TimedOut => {
            warn!(event = "chat_timeout", job_id = %job.id, tenant = %tenant);
            internal_error("Timeout")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    #[serde(default)]
    texts: Option<JsonValue>,
    #[serde(default)]
    input: Option<JsonValue>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    organization_id: Option<String>,
}

/// Synchronous embedding call; no queue.
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmbeddingsBody>,
) -> Response {
    let mut inputs = normalize_inputs(body.texts);
    if inputs.is_empty() {
        inputs = normalize_inputs(body.input);
    }
    if inputs.is_empty() {
        return bad_request("texts or input required");
    }

    let provider = state.router.embedding_provider(body.provider.as_deref());
    let request_id = Uuid::new_v4().to_string();
    let started_at = now_epoch_ms();
    info!(
        event = "embeddings_requested",
        request_id = %request_id,
        tenant = %body.organization_id.as_deref().unwrap_or(DEFAULT_TENANT),
        provider = %provider,
        inputs = inputs.len()
    );

    match state.router.dispatch_embed(&provider, &inputs).await {
        Ok((served_by, response)) => {
            let kind =
                ProviderKind::parse(&served_by).unwrap_or(state.settings.embedding_provider);
            let metadata = json!({
                "request_id": request_id,
                "provider": served_by,
                "timestamp": iso_timestamp(),
                "query_type": QueryType::Embedding.as_str(),
                "credits_used": QueryType::Embedding.credits(),
                "cost_usd": embedding_cost_usd(kind, response.usage.prompt_tokens),
                "response_time_ms": (now_epoch_ms() - started_at).max(0),
            });
            match serde_json::to_value(&response) {
                Ok(mut data) => {
                    data["metadata"] = metadata;
                    (StatusCode::OK, Json(data)).into_response()
                }
                Err(err) => {
                    error!(event = "embedding_encode_failed", error = %err);
                    internal_error("failed to encode embeddings")
                }
            }
        }
        Err(err) => internal_error(&err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AudioBody {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Errors still answer 200; the caller uses the reply as a save signal.
pub async fn audio(State(state): State<Arc<AppState>>, Json(body): Json<AudioBody>) -> Response {
    let Some(url) = body.url.filter(|url| !url.is_empty()) else {
        return bad_request("url required");
    };

    let result = match state
        .openai
        .transcribe_audio(&url, body.model.as_deref())
        .await
    {
        Ok(text) if text.trim().is_empty() => AUDIO_EMPTY_PLACEHOLDER.to_string(),
        Ok(text) => text,
        Err(err) => {
            warn!(event = "audio_failed", url = %url, error = %err);
            format!("[Error processing audio: {err}]")
        }
    };
    (StatusCode::OK, Json(json!({ "output": { "result": result } }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct OcrBody {
    #[serde(default)]
    image_url: Option<String>,
}

pub async fn image_ocr(State(state): State<Arc<AppState>>, Json(body): Json<OcrBody>) -> Response {
    let Some(image_url) = body.image_url.filter(|url| !url.is_empty()) else {
        return bad_request("image_url required");
    };

    let content = match state.openai.extract_image_text(&image_url).await {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.contains(NO_TEXT_SENTINEL) {
                OCR_EMPTY_PLACEHOLDER.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(err) => {
            warn!(event = "ocr_failed", url = %image_url, error = %err);
            format!("Error processing image: {err}")
        }
    };
    (StatusCode::OK, Json(json!({ "content": content }))).into_response()
}

fn normalize_inputs(value: Option<JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::String(text)) => vec![text],
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(text) => Some(text),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}
