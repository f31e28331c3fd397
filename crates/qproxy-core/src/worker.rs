use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use qproxy_common::{
    iso_timestamp, now_epoch_ms, ProviderKind, BLPOP_TIMEOUT_SECS, LOCK_TTL_SECS, RESULT_TTL_SECS,
};
use qproxy_kv::KvStore as _;
use qproxy_provider::{ChatRequest, OutputFormat};

use crate::classifier;
use crate::credits::{chat_cost_usd, detect_query_type};
use crate::job::{lock_key, queue_key, result_key, Job, JobResult};
use crate::state::AppState;

/// Process-local map from tenant to the live worker's generation id.
/// Guards against redundant spawns; the KV lock stays authoritative.
#[derive(Default)]
pub struct WorkerRegistry {
    active: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the tenant slot; `None` when a local worker already owns it.
    fn try_claim(&self, tenant: &str) -> Option<u64> {
        let mut active = lock_unpoisoned(&self.active);
        if active.contains_key(tenant) {
            return None;
        }
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.insert(tenant.to_string(), worker_id);
        Some(worker_id)
    }

    /// Remove the entry, but only when it still belongs to this worker.
    fn release(&self, tenant: &str, worker_id: u64) {
        let mut active = lock_unpoisoned(&self.active);
        if active.get(tenant) == Some(&worker_id) {
            active.remove(tenant);
        }
    }

    pub fn is_active(&self, tenant: &str) -> bool {
        lock_unpoisoned(&self.active).contains_key(tenant)
    }
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Spawn the singleton worker for a tenant unless one is already live in
/// this process.
pub fn ensure_worker(state: &Arc<AppState>, tenant: &str) {
    let Some(worker_id) = state.workers.try_claim(tenant) else {
        return;
    };
    let state = state.clone();
    let tenant = tenant.to_string();
    tokio::spawn(async move {
        run_worker(state, tenant, worker_id).await;
    });
}

async fn run_worker(state: Arc<AppState>, tenant: String, worker_id: u64) {
    let queue = queue_key(&tenant);
    let lock = lock_key(&tenant);

    match state.kv.set_nx(&lock, "1", LOCK_TTL_SECS).await {
        Ok(true) => {}
        Ok(false) => {
            // Another worker (possibly on another node) owns this tenant.
            debug!(event = "lock_held_elsewhere", tenant = %tenant);
            state.workers.release(&tenant, worker_id);
            return;
        }
        Err(err) => {
            warn!(event = "lock_acquire_failed", tenant = %tenant, error = %err);
            state.workers.release(&tenant, worker_id);
            return;
        }
    }
    info!(event = "worker_started", tenant = %tenant, worker_id = worker_id);

    loop {
        match state.kv.blpop(&queue, BLPOP_TIMEOUT_SECS).await {
            Ok(Some(payload)) => process_job(&state, &tenant, &payload).await,
            Ok(None) => match state.kv.queue_cleanup(&queue, &lock).await {
                Ok(true) => {
                    state.workers.release(&tenant, worker_id);
                    info!(event = "worker_stopped", tenant = %tenant, worker_id = worker_id);
                    return;
                }
                // A producer pushed concurrently; keep draining.
                Ok(false) => {}
                Err(err) => {
                    abort_worker(&state, &tenant, worker_id, &lock, err).await;
                    return;
                }
            },
            Err(err) => {
                abort_worker(&state, &tenant, worker_id, &lock, err).await;
                return;
            }
        }
    }
}

/// Crash path outside the per-job boundary: best-effort lock release so the
/// next admission can take over without waiting out the TTL.
async fn abort_worker(
    state: &Arc<AppState>,
    tenant: &str,
    worker_id: u64,
    lock: &str,
    err: impl Display,
) {
    warn!(event = "worker_crashed", tenant = %tenant, worker_id = worker_id, error = %err);
    if let Err(del_err) = state.kv.del(lock).await {
        warn!(event = "lock_release_failed", tenant = %tenant, error = %del_err);
    }
    state.workers.release(tenant, worker_id);
}

/// Per-job boundary: every failure lands in the result slot, never back in
/// the worker loop.
async fn process_job(state: &Arc<AppState>, tenant: &str, payload: &str) {
    let job: Job = match serde_json::from_str(payload) {
        Ok(job) => job,
        Err(err) => {
            warn!(event = "job_decode_failed", tenant = %tenant, error = %err);
            return;
        }
    };
    info!(
        event = "job_started",
        tenant = %tenant,
        job_id = %job.id,
        request_id = %job.request_id,
        provider = %job.provider
    );

    let result = match execute_job(state, &job).await {
        Ok(data) => JobResult::ok(data),
        Err(message) => {
            warn!(event = "job_failed", job_id = %job.id, error = %message);
            JobResult::err(message)
        }
    };

    let serialized = match serde_json::to_string(&result) {
        Ok(serialized) => serialized,
        Err(err) => {
            warn!(event = "result_encode_failed", job_id = %job.id, error = %err);
            return;
        }
    };
    if let Err(err) = state
        .kv
        .setex(&result_key(&job.id), RESULT_TTL_SECS, &serialized)
        .await
    {
        warn!(event = "result_publish_failed", job_id = %job.id, error = %err);
    }
}

async fn execute_job(state: &Arc<AppState>, job: &Job) -> Result<JsonValue, String> {
    let request = ChatRequest {
        messages: job.messages.clone(),
        files: job.files.clone(),
        temperature: job.temperature,
        tools: job.tools.clone(),
        tool_choice: job.tool_choice.clone(),
        output_format: OutputFormat::Text,
    };
    let (served_by, response) = state
        .router
        .dispatch(&job.provider, &request)
        .await
        .map_err(|err| err.to_string())?;

    let query_type = detect_query_type(&job.messages, &job.files);
    let credits_used = query_type.credits();
    let kind = ProviderKind::parse(&served_by).unwrap_or(state.settings.primary_provider);
    let cost_usd = chat_cost_usd(kind, &response.usage);
    let response_time_ms = (now_epoch_ms() - job.started_at).max(0);

    // The credit record is logged only; persistence belongs to a collaborator.
    info!(
        event = "credit_record",
        tenant = %job.tenant,
        job_id = %job.id,
        provider = %served_by,
        query_type = query_type.as_str(),
        credits_used = credits_used,
        cost_usd = cost_usd,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        response_time_ms = response_time_ms
    );

    if classifier::should_classify(job) {
        if let Some(reply) = response.first_text() {
            let state = state.clone();
            let job = job.clone();
            let reply = reply.to_string();
            tokio::spawn(async move {
                classifier::classify_and_push(state, job, reply).await;
            });
        }
    }

    let metadata = json!({
        "request_id": job.request_id,
        "provider": served_by,
        "nameUser": job.name_user,
        "hasFiles": !job.files.is_empty(),
        "timestamp": iso_timestamp(),
        "query_type": query_type.as_str(),
        "priority": job.category,
        "credits_used": credits_used,
        "response_time_ms": response_time_ms,
        "cost_usd": cost_usd,
    });

    let mut data = serde_json::to_value(&response).map_err(|err| err.to_string())?;
    data["metadata"] = metadata;
    Ok(data)
}
