mod memory;
mod redis_store;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("kv store is closed")]
    Closed,
}

/// Gateway to the shared key-value service.
///
/// Implementations keep two independent connections: one for plain commands
/// and one dedicated to blocking list pops, so a blocking pop never stalls
/// unrelated commands.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Append to the tail of a list.
    async fn rpush(&self, key: &str, payload: &str) -> KvResult<()>;

    /// Block up to `timeout_secs` for the head of a list; `None` on timeout.
    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>>;

    /// Set only if absent, with a TTL. Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<bool>;

    /// Set with a TTL, overwriting.
    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn del(&self, key: &str) -> KvResult<()>;

    /// Atomic idle-cleanup check: when the queue is empty, delete the lock
    /// and return true; otherwise leave both untouched and return false.
    /// Closes the race between a worker deciding to shut down and a
    /// producer pushing a new job.
    async fn queue_cleanup(&self, queue_key: &str, lock_key: &str) -> KvResult<bool>;

    /// Release held connections on shutdown.
    async fn close(&self) -> KvResult<()>;
}
