use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use qproxy_common::{now_epoch_ms, ProviderKind, Settings};
use qproxy_core::job::{lock_key, queue_key, result_key, Job};
use qproxy_core::{ensure_worker, wait_for_result, AppState, ProviderRouter, WaitOutcome};
use qproxy_kv::{KvStore, MemoryStore};
use qproxy_protocol::{CanonicalResponse, ChatMessage, EmbeddingResponse, Role, Usage};
use qproxy_provider::{
    ChatRequest, OpenAiConfig, OpenAiProvider, Provider, ProviderError, ProviderResult,
};

/// Records the last-user-message text of every invocation, in order.
struct ScriptedProvider {
    name: &'static str,
    credentialed: bool,
    fail: bool,
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &'static str, credentialed: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            credentialed,
            fail,
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn has_credentials(&self) -> bool {
        self.credentialed
    }

    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<CanonicalResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.as_ref())
            .map(|c| c.flattened_text())
            .unwrap_or_default();
        self.seen.lock().unwrap().push(text.clone());
        if self.fail {
            return Err(ProviderError::Upstream {
                status: 401,
                body: "invalid key".to_string(),
            });
        }
        Ok(CanonicalResponse::from_text(
            format!("echo: {text}"),
            Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        ))
    }

    async fn embed(&self, _inputs: &[String]) -> ProviderResult<EmbeddingResponse> {
        Err(ProviderError::MissingCredentials(self.name))
    }
}

fn test_state(providers: Vec<Arc<dyn Provider>>, primary: ProviderKind) -> Arc<AppState> {
    let router = ProviderRouter::new(providers, primary, primary, false);
    let openai = Arc::new(
        OpenAiProvider::new(OpenAiConfig {
            api_key: None,
            base_url: "http://127.0.0.1:0".to_string(),
            chat_model: "chat".to_string(),
            vision_model: "vision".to_string(),
            embedding_model: "embed".to_string(),
        })
        .unwrap(),
    );
    Arc::new(AppState::new(
        Settings::default(),
        Arc::new(MemoryStore::new()),
        router,
        openai,
    ))
}

fn make_job(tenant: &str, text: &str, provider: &str) -> Job {
    Job {
        id: Job::new_id(tenant),
        request_id: "req-test".to_string(),
        tenant: tenant.to_string(),
        provider: provider.to_string(),
        messages: vec![ChatMessage::text(Role::User, text)],
        files: Vec::new(),
        temperature: 0.7,
        tools: None,
        tool_choice: None,
        ticket_id: None,
        ticket_categories: None,
        category: None,
        name_user: None,
        started_at: now_epoch_ms(),
    }
}

async fn admit(state: &Arc<AppState>, job: &Job) {
    let payload = serde_json::to_string(job).unwrap();
    state
        .kv
        .rpush(&queue_key(&job.tenant), &payload)
        .await
        .unwrap();
    ensure_worker(state, &job.tenant);
}

async fn expect_completed(state: &Arc<AppState>, job_id: &str) -> qproxy_core::JobResult {
    match wait_for_result(state.kv.as_ref(), job_id, Duration::from_secs(180)).await {
        WaitOutcome::Completed(result) => result,
        WaitOutcome::TimedOut => panic!("job {job_id} timed out"),
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_complete_in_admission_order() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider.clone()], ProviderKind::OpenAi);

    let jobs: Vec<Job> = (0..10)
        .map(|i| make_job("t1", &format!("job-{i}"), "openai"))
        .collect();
    for job in &jobs {
        admit(&state, job).await;
    }

    for job in &jobs {
        let result = expect_completed(&state, &job.id).await;
        assert!(result.success, "job {} failed: {:?}", job.id, result.error);
    }

    let order: Vec<String> = (0..10).map(|i| format!("job-{i}")).collect();
    assert_eq!(provider.seen(), order);
}

#[tokio::test(start_paused = true)]
async fn repeated_admissions_spawn_a_single_worker() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider.clone()], ProviderKind::OpenAi);

    let jobs: Vec<Job> = (0..5)
        .map(|i| make_job("t1", &format!("job-{i}"), "openai"))
        .collect();
    for job in &jobs {
        // Every admission asks for a worker; only the first claim wins.
        admit(&state, job).await;
        ensure_worker(&state, "t1");
    }
    assert!(state.workers.is_active("t1"));

    for job in &jobs {
        assert!(expect_completed(&state, &job.id).await.success);
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn idle_worker_cleans_up_and_releases_the_lock() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider], ProviderKind::OpenAi);

    let job = make_job("t1", "hello", "openai");
    admit(&state, &job).await;
    assert!(expect_completed(&state, &job.id).await.success);

    // One blpop timeout plus the cleanup round trip.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let lock_gone = state.kv.get(&lock_key("t1")).await.unwrap().is_none();
        if lock_gone && !state.workers.is_active("t1") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker did not clean up in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // A later admission starts a fresh worker.
    let next = make_job("t1", "again", "openai");
    admit(&state, &next).await;
    assert!(expect_completed(&state, &next.id).await.success);
}

#[tokio::test(start_paused = true)]
async fn failing_primary_falls_back_and_reports_the_serving_provider() {
    let gemini = ScriptedProvider::new("gemini", true, true);
    let openai = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![gemini.clone(), openai.clone()], ProviderKind::Gemini);

    let job = make_job("t1", "hello", "gemini");
    admit(&state, &job).await;

    let result = expect_completed(&state, &job.id).await;
    assert!(result.success);
    let data = result.data.unwrap();
    assert_eq!(data["metadata"]["provider"], "openai");
    assert_eq!(data["choices"][0]["message"]["content"], "echo: hello");
    assert_eq!(gemini.calls.load(Ordering::SeqCst), 1);
    assert_eq!(openai.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_providers_store_a_failed_result() {
    let gemini = ScriptedProvider::new("gemini", true, true);
    let openai = ScriptedProvider::new("openai", true, true);
    let state = test_state(vec![gemini, openai], ProviderKind::Gemini);

    let job = make_job("t1", "hello", "gemini");
    admit(&state, &job).await;

    let result = expect_completed(&state, &job.id).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("all providers failed"));
}

#[tokio::test(start_paused = true)]
async fn result_slot_is_deleted_by_the_consuming_reader() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider], ProviderKind::OpenAi);

    let job = make_job("t1", "hello", "openai");
    admit(&state, &job).await;
    assert!(expect_completed(&state, &job.id).await.success);
    assert!(state.kv.get(&result_key(&job.id)).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn foreign_lock_holder_blocks_local_popping() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider.clone()], ProviderKind::OpenAi);

    // Another node owns this tenant.
    assert!(state.kv.set_nx(&lock_key("t1"), "1", 300).await.unwrap());

    let stranded = make_job("t1", "stranded", "openai");
    admit(&state, &stranded).await;

    // The local worker backs off without popping; the job stays queued.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert!(!state.workers.is_active("t1"));

    // Once the foreign holder releases, the next admission drains both jobs.
    state.kv.del(&lock_key("t1")).await.unwrap();
    let next = make_job("t1", "resumed", "openai");
    admit(&state, &next).await;

    assert!(expect_completed(&state, &stranded.id).await.success);
    assert!(expect_completed(&state, &next.id).await.success);
    assert_eq!(provider.seen(), vec!["stranded", "resumed"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_queue_payload_does_not_kill_the_worker() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider], ProviderKind::OpenAi);

    state.kv.rpush(&queue_key("t1"), "not json").await.unwrap();
    let job = make_job("t1", "still alive", "openai");
    admit(&state, &job).await;

    let result = expect_completed(&state, &job.id).await;
    assert!(result.success);
    let data = result.data.unwrap();
    assert_eq!(data["choices"][0]["message"]["content"], "echo: still alive");
}

#[tokio::test(start_paused = true)]
async fn metadata_carries_query_type_and_credits() {
    let provider = ScriptedProvider::new("openai", true, false);
    let state = test_state(vec![provider], ProviderKind::OpenAi);

    let job = make_job("acme", "hi", "openai");
    admit(&state, &job).await;

    let result = expect_completed(&state, &job.id).await;
    let data = result.data.unwrap();
    let metadata = &data["metadata"];
    assert_eq!(metadata["query_type"], "basic_query");
    assert_eq!(metadata["credits_used"], 1.0);
    assert_eq!(metadata["request_id"], "req-test");
    assert!(metadata["cost_usd"].as_f64().unwrap() > 0.0);
    assert!(metadata["response_time_ms"].as_i64().unwrap() >= 0);
}
