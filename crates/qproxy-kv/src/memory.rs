use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

use crate::{KvResult, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-memory stand-in with the same contracts as the Redis gateway,
/// including TTL expiry and the atomic cleanup check. Used by tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(inner: &mut Inner, key: &str) -> Option<String> {
        let expired = inner
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            inner.strings.remove(key);
        }
        inner.strings.get(key).map(|entry| entry.value.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens when a test panics mid-operation.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn rpush(&self, key: &str, payload: &str) -> KvResult<()> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let wakeup = self.pushed.notified();
            if let Some(head) = self
                .lock()
                .lists
                .get_mut(key)
                .and_then(|list| list.pop_front())
            {
                return Ok(Some(head));
            }
            tokio::select! {
                _ = wakeup => {}
                _ = sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<bool> {
        let mut inner = self.lock();
        if Self::live_value(&mut inner, key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(true)
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> KvResult<()> {
        self.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.lock();
        Ok(Self::live_value(&mut inner, key))
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.lock().strings.remove(key);
        Ok(())
    }

    async fn queue_cleanup(&self, queue_key: &str, lock_key: &str) -> KvResult<bool> {
        let mut inner = self.lock();
        let queue_len = inner.lists.get(queue_key).map(VecDeque::len).unwrap_or(0);
        if queue_len == 0 {
            inner.strings.remove(lock_key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(&self) -> KvResult<()> {
        Ok(())
    }
}
