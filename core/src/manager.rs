/*!
# Queue Manager

`QueueManager` puts several queues behind the `Queue` trait:

- `consume` tries queues in declared order and returns the first job found
- `push` goes to the queue a job asks for, or to the first (default) queue
- `filter` narrows the manager to queues matching names or `*` globs, in requested order
- `size` sums, `stats` enumerates, `purge` clears every purgeable queue
*/

use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor};
use crate::pattern::NamePattern;
use crate::queue::{Purgeable, Queue};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Ordered, non-empty set of queues
#[derive(Clone)]
pub struct QueueManager {
    queues: Vec<Arc<dyn Queue>>,
    name: String,
}

impl QueueManager {
    /// Manager whose default queue is `queue`
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self::build(vec![queue])
    }

    /// Manager over `queues`; the first one is the default
    pub fn from_queues(queues: Vec<Arc<dyn Queue>>) -> Result<Self> {
        if queues.is_empty() {
            return Err(StevedoreError::NoQueueDefined);
        }
        Ok(Self::build(queues))
    }

    /// Append another queue, builder style
    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queues.push(queue);
        Self::build(self.queues)
    }

    fn build(queues: Vec<Arc<dyn Queue>>) -> Self {
        let name = queues
            .iter()
            .map(|queue| queue.name())
            .collect::<Vec<_>>()
            .join(", ");

        Self { queues, name }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queues in declared order
    pub fn queues(&self) -> impl Iterator<Item = &Arc<dyn Queue>> + '_ {
        self.queues.iter()
    }

    /// Queue receiving unrouted pushes
    pub fn default_queue(&self) -> &Arc<dyn Queue> {
        &self.queues[0]
    }

    /// First queue with exactly this name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Queue>> {
        self.queues.iter().find(|queue| queue.name() == name)
    }

    fn route(&self, name: Option<&str>) -> Result<&Arc<dyn Queue>> {
        match name {
            None => Ok(self.default_queue()),
            Some(name) => self
                .get(name)
                .ok_or_else(|| StevedoreError::queue_not_found([name])),
        }
    }

    /// Push to `queue`, unless the job names its own queue, which wins
    pub async fn push_to(
        &self,
        job: &JobDescriptor,
        delay: impl Into<Delay> + Send,
        queue: Option<&str>,
    ) -> Result<String> {
        let target = self.route(job.queue().or(queue))?;
        debug!(queue = %target.name(), job = ?job.name(), "Routing job");

        target.push(job, delay.into()).await
    }

    pub async fn push_raw_to(
        &self,
        payload: Value,
        delay: impl Into<Delay> + Send,
        attempts: u32,
        queue: Option<&str>,
    ) -> Result<String> {
        self.route(queue)?
            .push_raw(payload, delay.into(), attempts)
            .await
    }

    /// Restrict to queues matching `patterns` (exact names or `*` globs).
    ///
    /// Queues keep the order of the patterns that selected them and appear once.
    /// No pattern gives back the full manager.
    pub fn filter<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(self.clone());
        }

        let mut selected: Vec<Arc<dyn Queue>> = Vec::new();
        for pattern in patterns {
            let pattern = NamePattern::new(pattern.as_ref());

            for queue in &self.queues {
                if !pattern.matches(queue.name()) {
                    continue;
                }
                if selected.iter().any(|kept| kept.name() == queue.name()) {
                    continue;
                }
                selected.push(Arc::clone(queue));
            }
        }

        if selected.is_empty() {
            return Err(StevedoreError::queue_not_found(
                patterns.iter().map(|pattern| pattern.as_ref().to_string()),
            ));
        }

        Ok(Self::build(selected))
    }

    /// Lazily report `(name, size)` for each queue, in declared order
    pub fn stats(&self) -> impl Stream<Item = (String, Result<u64>)> + '_ {
        stream::iter(self.queues.iter()).then(|queue| async move {
            (queue.name().to_string(), queue.size().await)
        })
    }
}

#[async_trait]
impl Queue for QueueManager {
    /// Queue names joined with `", "`
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<u64> {
        let mut total = 0;
        for queue in &self.queues {
            total += queue.size().await?;
        }
        Ok(total)
    }

    async fn consume(&self) -> Result<Option<Job>> {
        for queue in &self.queues {
            if let Some(job) = queue.consume().await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn push(&self, job: &JobDescriptor, delay: Delay) -> Result<String> {
        self.push_to(job, delay, None).await
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        self.push_raw_to(payload, delay, attempts, None).await
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for QueueManager {
    /// Purge every queue that supports it; the others are skipped
    async fn purge(&self) -> Result<()> {
        for queue in &self.queues {
            match queue.as_purgeable() {
                Some(purgeable) => purgeable.purge().await?,
                None => debug!(queue = %queue.name(), "Queue is not purgeable, skipping"),
            }
        }
        Ok(())
    }
}
