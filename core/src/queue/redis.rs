/*!
# Redis Queue

Queue on top of three Redis keys per queue name:

- `{name}`: list of ready jobs (`RPUSH` on push, `LPOP` on consume)
- `{name}:delayed`: sorted set of delayed jobs scored by their due epoch second
- `{name}:deleted`: hash recording deleted jobs by id, kept as an audit trail

Due delayed jobs are migrated into the ready list before every `size` and `consume`.
The migration runs under `{name}:delayed:lock` (`SET NX EX`) so concurrent workers
do not move the same entry twice; the lock expires on its own if a worker dies.

Every entry is a JSON object `{"jobId": .., "payload": "<envelope json>", "attempts": n}`.
A popped job is gone from Redis until it is released; there is no lease to expire.
*/

use super::{new_job_id, JobBackend, Purgeable, Queue};
use crate::clock::{system_clock, Clock};
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The Redis commands the queue relies on
#[async_trait]
pub trait RedisTransport: Send + Sync + 'static {
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    /// `ZADD key NX score member`
    async fn zadd_nx(&self, key: &str, score: i64, member: &str) -> Result<()>;

    /// `ZRANGEBYSCORE key -inf max`
    async fn zrangebyscore(&self, key: &str, max: i64) -> Result<Vec<String>>;

    /// Returns whether the member was present
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// `SET key value NX EX ttl`; returns whether the key was set
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    async fn del(&self, keys: &[&str]) -> Result<()>;

    /// Delete `key` only while it still holds `value`; returns whether it was deleted
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
}

#[cfg(feature = "redis")]
const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[cfg(feature = "redis")]
#[async_trait]
impl RedisTransport for ::redis::aio::ConnectionManager {
    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.clone();
        let _: i64 = ::redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.clone();
        let value: Option<String> = ::redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.clone();
        let len: u64 = ::redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zadd_nx(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut conn = self.clone();
        let _: i64 = ::redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.clone();
        let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.clone();
        let removed: i64 = ::redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.clone();
        let _: i64 = ::redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.clone();
        let removed: i64 = ::redis::cmd("EVAL")
            .arg(DEL_IF_EQ_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.clone();
        let _: i64 = ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Tuning knobs for `RedisQueue`
#[derive(Debug, Clone)]
pub struct RedisQueueOptions {
    /// Expiry of the delayed-migration lock
    pub lock_ttl_secs: u64,
    pub clock: Arc<dyn Clock>,
}

impl Default for RedisQueueOptions {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 10,
            clock: system_clock(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "jobId")]
    job_id: String,
    payload: String,
    #[serde(default)]
    attempts: u32,
}

struct RedisBackend {
    name: String,
    delayed_key: String,
    lock_key: String,
    deleted_key: String,
    transport: Arc<dyn RedisTransport>,
    options: RedisQueueOptions,
}

impl RedisBackend {
    /// Store an entry in the ready list or the delayed set
    async fn store(&self, entry: &Entry, delay: Delay) -> Result<()> {
        let now = self.options.clock.now();
        let delay_secs = delay.seconds_from(now);
        let encoded = serde_json::to_string(entry)?;

        if delay_secs > 0 {
            let due = now.timestamp().saturating_add(delay_secs as i64);
            self.transport.zadd_nx(&self.delayed_key, due, &encoded).await
        } else {
            self.transport.rpush(&self.name, &encoded).await
        }
    }

    /// Move due delayed entries into the ready list
    async fn free_delayed_jobs(&self) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        if !self
            .transport
            .set_nx_ex(&self.lock_key, &token, self.options.lock_ttl_secs)
            .await?
        {
            debug!(queue = %self.name, "Delayed jobs migration already running elsewhere");
            return Ok(());
        }

        let migrated = self.migrate_due().await;
        // The lock may have expired and been taken by another worker meanwhile
        let unlocked = self.transport.del_if_eq(&self.lock_key, &token).await;

        let moved = migrated?;
        if !unlocked? {
            warn!(queue = %self.name, "Delayed jobs lock expired during migration");
        }

        if moved > 0 {
            debug!(queue = %self.name, moved, "Delayed jobs now ready");
        }
        Ok(())
    }

    async fn migrate_due(&self) -> Result<usize> {
        let now = self.options.clock.now().timestamp();
        let due = self.transport.zrangebyscore(&self.delayed_key, now).await?;

        let mut moved = 0;
        for member in due {
            if self.transport.zrem(&self.delayed_key, &member).await? {
                self.transport.rpush(&self.name, &member).await?;
                moved += 1;
            }
        }

        Ok(moved)
    }
}

#[async_trait]
impl JobBackend for RedisBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn release(&self, job: &Job, delay: Delay) -> Result<()> {
        job.ensure_unresolved()?;

        let entry = Entry {
            job_id: job.id().to_string(),
            payload: job.descriptor().encode()?,
            attempts: job.attempts(),
        };
        self.store(&entry, delay).await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job released");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        job.ensure_unresolved()?;

        let entry = Entry {
            job_id: job.id().to_string(),
            payload: job.descriptor().encode()?,
            attempts: job.attempts(),
        };
        self.transport
            .hset(&self.deleted_key, job.id(), &serde_json::to_string(&entry)?)
            .await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job deleted");
        Ok(())
    }
}

/// Queue stored in Redis lists and sorted sets
#[derive(Clone)]
pub struct RedisQueue {
    inner: Arc<RedisBackend>,
}

impl RedisQueue {
    pub fn new(transport: Arc<dyn RedisTransport>, name: impl Into<String>) -> Self {
        Self::with_options(transport, name, RedisQueueOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn RedisTransport>,
        name: impl Into<String>,
        options: RedisQueueOptions,
    ) -> Self {
        let name = name.into();

        Self {
            inner: Arc::new(RedisBackend {
                delayed_key: format!("{}:delayed", name),
                lock_key: format!("{}:delayed:lock", name),
                deleted_key: format!("{}:deleted", name),
                name,
                transport,
                options,
            }),
        }
    }

    /// Connect a managed connection to `url`
    #[cfg(feature = "redis")]
    pub async fn connect(
        url: &str,
        name: impl Into<String>,
        options: RedisQueueOptions,
    ) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let manager = ::redis::aio::ConnectionManager::new(client).await?;

        Ok(Self::with_options(Arc::new(manager), name, options))
    }

    /// Run the delayed-jobs migration now
    pub async fn free_delayed_jobs(&self) -> Result<()> {
        self.inner.free_delayed_jobs().await
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self) -> Result<u64> {
        self.inner.free_delayed_jobs().await?;
        self.inner.transport.llen(&self.inner.name).await
    }

    async fn consume(&self) -> Result<Option<Job>> {
        self.inner.free_delayed_jobs().await?;

        let raw = match self.inner.transport.lpop(&self.inner.name).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let entry: Entry = serde_json::from_str(&raw).map_err(|err| {
            warn!(queue = %self.inner.name, error = %err, "Dropping malformed entry");
            StevedoreError::InvalidJob(format!(
                "invalid job structure, missing jobId or payload: {}",
                err
            ))
        })?;

        let descriptor = JobDescriptor::decode(&entry.payload)?;
        let backend: Arc<dyn JobBackend> = self.inner.clone();

        Ok(Some(Job::new(
            entry.job_id,
            descriptor,
            entry.attempts.saturating_add(1),
            backend,
        )))
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        let entry = Entry {
            job_id: new_job_id(),
            payload: serde_json::to_string(&payload)?,
            attempts,
        };
        self.inner.store(&entry, delay).await?;

        debug!(job_id = %entry.job_id, queue = %self.inner.name, "Job pushed");
        Ok(entry.job_id)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for RedisQueue {
    async fn purge(&self) -> Result<()> {
        self.inner
            .transport
            .del(&[self.inner.name.as_str(), self.inner.delayed_key.as_str()])
            .await
    }
}
