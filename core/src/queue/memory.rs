//! In-process queue backend.
//!
//! Records live in a `VecDeque` behind a `tokio::sync::Mutex`, kept sorted by
//! availability time. A consumed record stays in the store with a lock stamp;
//! once the stamp is older than `retry_time` the record becomes eligible again.

use super::{chrono_interval, new_job_id, JobBackend, Purgeable, Queue};
use crate::clock::{system_clock, Clock};
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Tuning knobs for `MemoryQueue`
#[derive(Debug, Clone)]
pub struct MemoryQueueOptions {
    /// How long a consumed job stays leased before it can be consumed again
    pub retry_time: Duration,
    /// Records with this many attempts are never consumed again
    pub max_attempts: u32,
    pub clock: Arc<dyn Clock>,
}

impl Default for MemoryQueueOptions {
    fn default() -> Self {
        Self {
            retry_time: Duration::from_secs(30),
            max_attempts: 5,
            clock: system_clock(),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    id: String,
    payload: Value,
    attempts: u32,
    available_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
}

struct MemoryBackend {
    name: String,
    options: MemoryQueueOptions,
    records: Mutex<VecDeque<Record>>,
}

impl MemoryBackend {
    fn is_eligible(&self, record: &Record, now: DateTime<Utc>) -> bool {
        if record.attempts >= self.options.max_attempts || record.available_at > now {
            return false;
        }

        match record.locked_at {
            None => true,
            Some(locked_at) => {
                let stale_before = now
                    .checked_sub_signed(chrono_interval(self.options.retry_time))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                locked_at <= stale_before
            }
        }
    }
}

/// Keep the store ordered by availability; equal times keep insertion order.
fn insert_sorted(records: &mut VecDeque<Record>, record: Record) {
    let position = records
        .iter()
        .position(|existing| existing.available_at > record.available_at)
        .unwrap_or(records.len());
    records.insert(position, record);
}

#[async_trait]
impl JobBackend for MemoryBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn release(&self, job: &Job, delay: Delay) -> Result<()> {
        job.ensure_unresolved()?;

        let available_at = delay.available_at(self.options.clock.now());
        let mut records = self.records.lock().await;

        let index = records
            .iter()
            .position(|record| record.id == job.id())
            .ok_or_else(|| StevedoreError::backend(format!("Job #{} not found", job.id())))?;

        if let Some(mut record) = records.remove(index) {
            record.available_at = available_at;
            record.locked_at = None;
            insert_sorted(&mut records, record);
        }

        debug!(job_id = %job.id(), queue = %self.name, "Job released");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        job.ensure_unresolved()?;

        let mut records = self.records.lock().await;
        records.retain(|record| record.id != job.id());

        debug!(job_id = %job.id(), queue = %self.name, "Job deleted");
        Ok(())
    }
}

/// Queue held entirely in process memory
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryBackend>,
}

impl MemoryQueue {
    /// Create an in-memory queue with default options
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, MemoryQueueOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: MemoryQueueOptions) -> Self {
        Self {
            inner: Arc::new(MemoryBackend {
                name: name.into(),
                options,
                records: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Number of stored records, eligible or not
    pub async fn stored(&self) -> usize {
        self.inner.records.lock().await.len()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self) -> Result<u64> {
        let now = self.inner.options.clock.now();
        let records = self.inner.records.lock().await;

        Ok(records
            .iter()
            .filter(|record| self.inner.is_eligible(record, now))
            .count() as u64)
    }

    async fn consume(&self) -> Result<Option<Job>> {
        let now = self.inner.options.clock.now();

        let leased = {
            let mut records = self.inner.records.lock().await;

            match records
                .iter_mut()
                .find(|record| self.inner.is_eligible(record, now))
            {
                Some(record) => {
                    record.attempts += 1;
                    record.locked_at = Some(now);
                    Some(record.clone())
                }
                None => None,
            }
        };

        let record = match leased {
            Some(record) => record,
            None => return Ok(None),
        };

        let descriptor = JobDescriptor::from_envelope(record.payload)?;
        let backend: Arc<dyn JobBackend> = self.inner.clone();

        Ok(Some(Job::new(record.id, descriptor, record.attempts, backend)))
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        let id = new_job_id();
        let record = Record {
            id: id.clone(),
            payload,
            attempts,
            available_at: delay.available_at(self.inner.options.clock.now()),
            locked_at: None,
        };

        let mut records = self.inner.records.lock().await;
        insert_sorted(&mut records, record);

        debug!(job_id = %id, queue = %self.inner.name, "Job pushed");
        Ok(id)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for MemoryQueue {
    async fn purge(&self) -> Result<()> {
        self.inner.records.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::job::Payload;

    fn queue_with_clock(clock: &MockClock) -> MemoryQueue {
        MemoryQueue::with_options(
            "default",
            MemoryQueueOptions {
                clock: Arc::new(clock.clone()),
                ..Default::default()
            },
        )
    }

    fn email() -> JobDescriptor {
        JobDescriptor::new("send-email", Payload::new().with("to", "x@y"))
    }

    #[tokio::test]
    async fn size_counts_eligible_jobs() {
        let queue = MemoryQueue::new("default");

        for _ in 0..3 {
            queue.push(&email(), Delay::none()).await.unwrap();
        }
        assert_eq!(queue.size().await.unwrap(), 3);

        while let Some(mut job) = queue.consume().await.unwrap() {
            job.delete().await.unwrap();
        }
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.stored().await, 0);
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let clock = MockClock::default();
        let queue = queue_with_clock(&clock);

        queue.push(&email(), Delay::from(10)).await.unwrap();
        assert!(queue.consume().await.unwrap().is_none());

        clock.advance_secs(10);
        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.name(), Some("send-email"));
    }

    #[tokio::test]
    async fn consumes_in_availability_order() {
        let clock = MockClock::default();
        let queue = queue_with_clock(&clock);

        let late = queue
            .push(&JobDescriptor::new("late", Payload::new()), Delay::from(5))
            .await
            .unwrap();
        let first = queue
            .push(&JobDescriptor::new("first", Payload::new()), Delay::none())
            .await
            .unwrap();
        let second = queue
            .push(&JobDescriptor::new("second", Payload::new()), Delay::none())
            .await
            .unwrap();

        clock.advance_secs(5);
        let ids: Vec<String> = vec![
            queue.consume().await.unwrap().unwrap().id().to_string(),
            queue.consume().await.unwrap().unwrap().id().to_string(),
            queue.consume().await.unwrap().unwrap().id().to_string(),
        ];
        assert_eq!(ids, vec![first, second, late]);
    }

    #[tokio::test]
    async fn stale_lease_becomes_eligible_again() {
        let clock = MockClock::default();
        let queue = queue_with_clock(&clock);
        queue.push(&email(), Delay::none()).await.unwrap();

        let leaked = queue.consume().await.unwrap().unwrap();
        assert!(queue.consume().await.unwrap().is_none());

        clock.advance_secs(30);
        let again = queue.consume().await.unwrap().unwrap();
        assert_eq!(again.id(), leaked.id());
        assert_eq!(again.attempts(), 2);
    }

    #[tokio::test]
    async fn release_preserves_attempts_and_applies_delay() {
        let clock = MockClock::default();
        let queue = queue_with_clock(&clock);
        queue.push(&email(), Delay::none()).await.unwrap();

        let mut job = queue.consume().await.unwrap().unwrap();
        job.release(60).await.unwrap();
        assert!(job.is_released());

        clock.advance_secs(59);
        assert!(queue.consume().await.unwrap().is_none());

        clock.advance_secs(1);
        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);
    }

    #[tokio::test]
    async fn max_attempts_stops_consumption() {
        let queue = MemoryQueue::with_options(
            "default",
            MemoryQueueOptions {
                max_attempts: 2,
                ..Default::default()
            },
        );
        queue.push(&email(), Delay::none()).await.unwrap();

        for _ in 0..2 {
            let mut job = queue.consume().await.unwrap().unwrap();
            job.release(Delay::none()).await.unwrap();
        }

        assert!(queue.consume().await.unwrap().is_none());
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.stored().await, 1);
    }

    #[tokio::test]
    async fn double_resolution_is_rejected() {
        let queue = MemoryQueue::new("default");
        queue.push(&email(), Delay::none()).await.unwrap();

        let mut job = queue.consume().await.unwrap().unwrap();
        job.delete().await.unwrap();

        assert!(matches!(
            job.release(0).await,
            Err(StevedoreError::AlreadyDeleted(_))
        ));
        assert!(matches!(
            job.delete().await,
            Err(StevedoreError::AlreadyDeleted(_))
        ));
        assert_eq!(queue.stored().await, 0);
    }

    #[tokio::test]
    async fn push_raw_keeps_attempts() {
        let queue = MemoryQueue::new("default");
        queue
            .push_raw(email().to_envelope(), Delay::none(), 3)
            .await
            .unwrap();

        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 4);
    }

    #[tokio::test]
    async fn purge_drops_everything() {
        let queue = MemoryQueue::new("default");
        queue.push(&email(), Delay::none()).await.unwrap();
        queue.push(&email(), Delay::from(3600)).await.unwrap();

        queue.as_purgeable().unwrap().purge().await.unwrap();
        assert_eq!(queue.stored().await, 0);
    }
}
