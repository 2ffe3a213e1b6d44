/*!
# Queue Module

This module defines the queue abstraction for Stevedore.

Queues are responsible for:
- Storing jobs until they become eligible (not delayed, not leased, under the attempt cap)
- Leasing exactly one eligible job per `consume`, so concurrent consumers never share a record
- Resolving consumed jobs: `delete` on success, `release` to retry after a delay

The module includes:
- The `Queue` trait implemented by every backend and by `QueueManager`
- The `JobBackend` trait a consumed `Job` calls back into when it is resolved
- The optional `Purgeable` capability for backends that support bulk clearing
- Backends: memory, database, Redis, AMQP, cloud queue (SQS-like) and null

Each backend keeps its storage private; all mutation goes through the trait methods.
*/

use crate::delay::Delay;
use crate::error::Result;
use crate::job::{Job, JobDescriptor};
use async_trait::async_trait;
use serde_json::Value;

pub mod amqp;
#[cfg(feature = "database")]
pub mod database;
pub mod memory;
pub mod null;
pub mod redis;
pub mod sqs;

pub use self::amqp::{AmqpQueue, AmqpQueueOptions, AmqpTransport};
#[cfg(feature = "database")]
pub use self::database::{DatabaseQueue, DatabaseQueueOptions};
pub use self::memory::{MemoryQueue, MemoryQueueOptions};
pub use self::null::NullQueue;
pub use self::redis::{RedisQueue, RedisQueueOptions, RedisTransport};
pub use self::sqs::{CloudQueue, CloudQueueClient, CloudQueueOptions};

/// Queue trait defining the interface for every job queue
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Queue name
    fn name(&self) -> &str;

    /// Number of jobs currently eligible for consumption
    async fn size(&self) -> Result<u64>;

    /// Lease the next eligible job, if any
    async fn consume(&self) -> Result<Option<Job>>;

    /// Push a new job, available after `delay`; returns the generated id
    async fn push(&self, job: &JobDescriptor, delay: Delay) -> Result<String> {
        self.push_raw(job.to_envelope(), delay, 0).await
    }

    /// Push an already encoded envelope with a pre-existing attempt count
    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String>;

    /// Bulk clearing capability, when the backend supports it
    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        None
    }
}

/// Queues that can drop every record at once
#[async_trait]
pub trait Purgeable: Send + Sync {
    /// Remove all records, whatever their eligibility
    async fn purge(&self) -> Result<()>;
}

/// Backend side of job resolution; implementations must reject resolved jobs
/// with `Job::ensure_unresolved` before touching storage.
#[async_trait]
pub trait JobBackend: Send + Sync + 'static {
    fn queue_name(&self) -> &str;

    /// Make the job eligible again after `delay` and clear its lease
    async fn release(&self, job: &Job, delay: Delay) -> Result<()>;

    /// Remove the job permanently
    async fn delete(&self, job: &Job) -> Result<()>;
}

#[async_trait]
impl<Q: Queue + ?Sized> Queue for std::sync::Arc<Q> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn size(&self) -> Result<u64> {
        (**self).size().await
    }

    async fn consume(&self) -> Result<Option<Job>> {
        (**self).consume().await
    }

    async fn push(&self, job: &JobDescriptor, delay: Delay) -> Result<String> {
        (**self).push(job, delay).await
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        (**self).push_raw(payload, delay, attempts).await
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        (**self).as_purgeable()
    }
}

/// Identifier for a new record; UUIDv7 strings sort in creation order.
pub(crate) fn new_job_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Convert a configured timeout into a chrono interval, saturating at one year.
pub(crate) fn chrono_interval(timeout: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365))
}
