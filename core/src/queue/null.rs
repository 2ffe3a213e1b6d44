//! Placeholder queue for setups without a configured backend.

use super::Queue;
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor};
use async_trait::async_trait;
use serde_json::Value;

/// Queue whose every operation fails with `NoQueueDefined`
#[derive(Debug, Clone)]
pub struct NullQueue {
    name: String,
}

impl NullQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NullQueue {
    fn default() -> Self {
        Self::new("NULL")
    }
}

#[async_trait]
impl Queue for NullQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<u64> {
        Err(StevedoreError::NoQueueDefined)
    }

    async fn consume(&self) -> Result<Option<Job>> {
        Err(StevedoreError::NoQueueDefined)
    }

    async fn push(&self, _job: &JobDescriptor, _delay: Delay) -> Result<String> {
        Err(StevedoreError::NoQueueDefined)
    }

    async fn push_raw(&self, _payload: Value, _delay: Delay, _attempts: u32) -> Result<String> {
        Err(StevedoreError::NoQueueDefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Payload;

    #[tokio::test]
    async fn every_operation_fails() {
        let queue = NullQueue::default();
        assert_eq!(queue.name(), "NULL");

        assert!(matches!(queue.size().await, Err(StevedoreError::NoQueueDefined)));
        assert!(matches!(queue.consume().await, Err(StevedoreError::NoQueueDefined)));
        assert!(matches!(
            queue
                .push(&JobDescriptor::new("x", Payload::new()), Delay::none())
                .await,
            Err(StevedoreError::NoQueueDefined)
        ));
        assert!(queue.as_purgeable().is_none());
    }
}
