/*!
# Cloud Queue

Queue on a hosted message service with SQS semantics. The service owns visibility:
a received message stays hidden until its visibility timeout elapses, `release`
shortens that timeout to the back-off delay, `delete` removes it by receipt handle.

The service SDK is supplied by the caller through `CloudQueueClient`.
*/

use super::{JobBackend, Purgeable, Queue};
use crate::clock::{system_clock, Clock};
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor, Receipt};
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest `DelaySeconds` the service accepts
pub const MAX_DELAY_SECS: u64 = 900;
/// Longest visibility timeout the service accepts
pub const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Message returned by a receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Hex MD5 digest of `body` computed by the service
    pub md5_of_body: String,
    /// `ApproximateReceiveCount`, this receive included
    pub receive_count: u32,
}

/// Service calls the queue relies on
#[async_trait]
pub trait CloudQueueClient: Send + Sync + 'static {
    /// Returns the service message id
    async fn send_message(&self, queue_url: &str, body: &str, delay_secs: u64) -> Result<String>;

    /// Receive at most one message
    async fn receive_message(&self, queue_url: &str) -> Result<Option<CloudMessage>>;

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_secs: u64,
    ) -> Result<()>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    async fn purge_queue(&self, queue_url: &str) -> Result<()>;

    /// `ApproximateNumberOfMessages` attribute
    async fn approximate_number_of_messages(&self, queue_url: &str) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct CloudQueueOptions {
    pub clock: Arc<dyn Clock>,
}

impl Default for CloudQueueOptions {
    fn default() -> Self {
        Self {
            clock: system_clock(),
        }
    }
}

/// Hex MD5 digest, as reported by the service
pub fn md5_hex(body: &str) -> String {
    format!("{:x}", Md5::digest(body.as_bytes()))
}

struct CloudBackend {
    name: String,
    queue_url: String,
    client: Arc<dyn CloudQueueClient>,
    options: CloudQueueOptions,
}

impl CloudBackend {
    fn receipt_handle(job: &Job) -> Result<&str> {
        match job.receipt() {
            Receipt::Handle(handle) => Ok(handle),
            other => Err(StevedoreError::backend(format!(
                "job #{} has no receipt handle ({:?})",
                job.id(),
                other
            ))),
        }
    }
}

#[async_trait]
impl JobBackend for CloudBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn release(&self, job: &Job, delay: Delay) -> Result<()> {
        job.ensure_unresolved()?;
        let handle = Self::receipt_handle(job)?;

        let timeout = delay
            .seconds_from(self.options.clock.now())
            .min(MAX_VISIBILITY_SECS);
        self.client
            .change_message_visibility(&self.queue_url, handle, timeout)
            .await?;

        debug!(job_id = %job.id(), queue = %self.name, timeout, "Job released");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        job.ensure_unresolved()?;
        let handle = Self::receipt_handle(job)?;

        self.client.delete_message(&self.queue_url, handle).await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job deleted");
        Ok(())
    }
}

/// Queue hosted by an SQS-like service
#[derive(Clone)]
pub struct CloudQueue {
    inner: Arc<CloudBackend>,
}

impl CloudQueue {
    pub fn new(
        client: Arc<dyn CloudQueueClient>,
        queue_url: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::with_options(client, queue_url, name, CloudQueueOptions::default())
    }

    pub fn with_options(
        client: Arc<dyn CloudQueueClient>,
        queue_url: impl Into<String>,
        name: impl Into<String>,
        options: CloudQueueOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CloudBackend {
                name: name.into(),
                queue_url: queue_url.into(),
                client,
                options,
            }),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.inner.queue_url
    }
}

#[async_trait]
impl Queue for CloudQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self) -> Result<u64> {
        self.inner
            .client
            .approximate_number_of_messages(&self.inner.queue_url)
            .await
    }

    async fn consume(&self) -> Result<Option<Job>> {
        let message = match self
            .inner
            .client
            .receive_message(&self.inner.queue_url)
            .await?
        {
            Some(message) => message,
            None => return Ok(None),
        };

        let actual = md5_hex(&message.body);
        if !actual.eq_ignore_ascii_case(&message.md5_of_body) {
            warn!(
                job_id = %message.message_id,
                queue = %self.inner.name,
                "Message body failed its checksum"
            );
            return Err(StevedoreError::ChecksumMismatch {
                expected: message.md5_of_body,
                actual,
            });
        }

        let descriptor = JobDescriptor::decode(&message.body)?;
        let backend: Arc<dyn JobBackend> = self.inner.clone();

        Ok(Some(
            Job::new(
                message.message_id,
                descriptor,
                message.receive_count.max(1),
                backend,
            )
            .with_receipt(Receipt::Handle(message.receipt_handle)),
        ))
    }

    /// The service counts receives itself, so `attempts` is not transmitted
    async fn push_raw(&self, payload: Value, delay: Delay, _attempts: u32) -> Result<String> {
        let delay_secs = delay
            .seconds_from(self.inner.options.clock.now())
            .min(MAX_DELAY_SECS);
        let body = serde_json::to_string(&payload)?;

        let id = self
            .inner
            .client
            .send_message(&self.inner.queue_url, &body, delay_secs)
            .await?;

        debug!(job_id = %id, queue = %self.inner.name, "Job pushed");
        Ok(id)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for CloudQueue {
    async fn purge(&self) -> Result<()> {
        self.inner.client.purge_queue(&self.inner.queue_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::job::Payload;
    use crate::testing::InMemoryCloudQueue;

    const URL: &str = "https://queue.example/123/emails";

    fn email() -> JobDescriptor {
        JobDescriptor::new("send-email", Payload::new().with("to", "x@y"))
    }

    fn queue(service: &InMemoryCloudQueue, clock: &MockClock) -> CloudQueue {
        CloudQueue::with_options(
            Arc::new(service.clone()),
            URL,
            "emails",
            CloudQueueOptions {
                clock: Arc::new(clock.clone()),
            },
        )
    }

    #[test]
    fn md5_matches_known_digest() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn receive_count_drives_attempts() {
        let clock = MockClock::default();
        let service = InMemoryCloudQueue::new(clock.clone());
        let queue = queue(&service, &clock);

        queue.push(&email(), Delay::none()).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 1);

        let mut job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.name(), Some("send-email"));
        assert_eq!(queue.size().await.unwrap(), 0);

        job.release(20).await.unwrap();
        assert!(queue.consume().await.unwrap().is_none());

        clock.advance_secs(20);
        let mut job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);

        job.delete().await.unwrap();
        clock.advance_secs(3600);
        assert!(queue.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delay_is_clamped_to_service_maximum() {
        let clock = MockClock::default();
        let service = InMemoryCloudQueue::new(clock.clone());
        let queue = queue(&service, &clock);

        queue.push(&email(), Delay::from(3600)).await.unwrap();

        clock.advance_secs(MAX_DELAY_SECS as i64);
        assert!(queue.consume().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_body_fails_checksum() {
        let clock = MockClock::default();
        let service = InMemoryCloudQueue::new(clock.clone());
        let queue = queue(&service, &clock);

        queue.push(&email(), Delay::none()).await.unwrap();
        service.corrupt_next_receive();

        assert!(matches!(
            queue.consume().await,
            Err(StevedoreError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn purge_drops_messages() {
        let clock = MockClock::default();
        let service = InMemoryCloudQueue::new(clock.clone());
        let queue = queue(&service, &clock);
        queue.push(&email(), Delay::none()).await.unwrap();

        queue.as_purgeable().unwrap().purge().await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 0);
    }
}
