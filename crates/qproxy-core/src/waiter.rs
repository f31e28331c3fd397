use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

use qproxy_common::RESULT_POLL_INTERVAL;
use qproxy_kv::KvStore;

use crate::job::{result_key, JobResult};

#[derive(Debug)]
pub enum WaitOutcome {
    Completed(JobResult),
    TimedOut,
}

/// Poll the result slot until the job completes or the wall-clock deadline
/// passes. The consuming reader deletes the slot; a timed-out job may still
/// finish later and its slot ages out by TTL. Transient poll failures are
/// logged and retried; only the deadline or a published result resolves the
/// wait.
pub async fn wait_for_result(kv: &dyn KvStore, job_id: &str, timeout: Duration) -> WaitOutcome {
    let deadline = Instant::now() + timeout;
    let key = result_key(job_id);

    loop {
        match kv.get(&key).await {
            Ok(Some(raw)) => {
                if let Err(err) = kv.del(&key).await {
                    warn!(event = "result_delete_failed", job_id = %job_id, error = %err);
                }
                return match serde_json::from_str::<JobResult>(&raw) {
                    Ok(result) => WaitOutcome::Completed(result),
                    Err(err) => {
                        warn!(event = "result_decode_failed", job_id = %job_id, error = %err);
                        WaitOutcome::Completed(JobResult::err(format!(
                            "malformed result payload: {err}"
                        )))
                    }
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(event = "result_poll_failed", job_id = %job_id, error = %err);
            }
        }

        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
        sleep(RESULT_POLL_INTERVAL).await;
    }
}
