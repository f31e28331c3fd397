use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use crate::{KvError, KvResult, KvStore};

const CLEANUP_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[2])
    return 1
else
    return 0
end
"#;

/// Redis-backed gateway. `commands` serves every non-blocking operation;
/// `blocking` is reserved for BLPOP so queued pops cannot head-of-line
/// block plain commands. Both reconnect automatically and are dropped by
/// `close()` on shutdown.
pub struct RedisStore {
    commands: Mutex<Option<ConnectionManager>>,
    blocking: Mutex<Option<ConnectionManager>>,
    cleanup: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(KvError::Redis)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        info!(event = "kv_connected", url = %url);
        Ok(Self {
            commands: Mutex::new(Some(commands)),
            blocking: Mutex::new(Some(blocking)),
            cleanup: Script::new(CLEANUP_SCRIPT),
        })
    }

    fn command_conn(&self) -> KvResult<ConnectionManager> {
        lock_unpoisoned(&self.commands).clone().ok_or(KvError::Closed)
    }

    fn blocking_conn(&self) -> KvResult<ConnectionManager> {
        lock_unpoisoned(&self.blocking).clone().ok_or(KvError::Closed)
    }
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn rpush(&self, key: &str, payload: &str) -> KvResult<()> {
        let mut conn = self.command_conn()?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout_secs: u64) -> KvResult<Option<String>> {
        let mut conn = self.blocking_conn()?;
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<bool> {
        let mut conn = self.command_conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> KvResult<()> {
        let mut conn = self.command_conn()?;
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.command_conn()?;
        let reply: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut conn = self.command_conn()?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn queue_cleanup(&self, queue_key: &str, lock_key: &str) -> KvResult<bool> {
        let mut conn = self.command_conn()?;
        let deleted: i64 = self
            .cleanup
            .key(queue_key)
            .key(lock_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    /// Drops both connection managers; later operations fail with
    /// [`KvError::Closed`].
    async fn close(&self) -> KvResult<()> {
        lock_unpoisoned(&self.commands).take();
        lock_unpoisoned(&self.blocking).take();
        info!(event = "kv_closed");
        Ok(())
    }
}
