/*!
# Handler Module

Dispatch from a consumed job to the code that runs it.

The module includes:
- The `JobHandler` trait called by the worker for each job
- `HandlerRegistry`, mapping job names (exact or ending in `*`) to handlers with an
  optional default handler
- `handler_fn`, adapting a plain closure into a handler

Any error returned by a handler marks the job as failed; the worker releases it with back-off.
*/

use crate::error::{Result, StevedoreError};
use crate::job::Job;
use crate::pattern::NamePattern;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Business logic for one or more job names
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Handler built from a synchronous closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure as a `JobHandler`
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Job) -> anyhow::Result<()> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        (self.f)(job)
    }
}

/// Routes jobs to handlers registered by name pattern
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<(NamePattern, Arc<dyn JobHandler>)>,
    default: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for jobs no pattern claims
    pub fn with_default(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.default = Some(handler);
        self
    }

    /// Register a handler for a job name, or a name prefix ending in `*`
    pub fn add_handler(
        &mut self,
        job_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&mut Self> {
        let job_name = job_name.into();
        if self
            .handlers
            .iter()
            .any(|(pattern, _)| pattern.as_str() == job_name)
        {
            return Err(StevedoreError::DuplicateHandler(job_name));
        }

        // only a trailing star makes a wildcard
        let pattern = if job_name.ends_with('*') {
            NamePattern::new(job_name)
        } else {
            NamePattern::literal(job_name)
        };
        self.handlers.push((pattern, handler));

        Ok(self)
    }

    /// Handler registered for `job_name`; exact names win over wildcards
    pub fn find_handler(&self, job_name: &str) -> Option<Arc<dyn JobHandler>> {
        let exact = self
            .handlers
            .iter()
            .find(|(pattern, _)| pattern.as_str() == job_name);

        exact
            .or_else(|| {
                self.handlers
                    .iter()
                    .find(|(pattern, _)| pattern.is_wildcard() && pattern.matches(job_name))
            })
            .map(|(_, handler)| Arc::clone(handler))
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let name = job.name().unwrap_or_default();

        let handler = match self.find_handler(name).or_else(|| self.default.clone()) {
            Some(handler) => handler,
            None => return Err(StevedoreError::InvalidHandler(name.to_string()).into()),
        };

        debug!(job_id = %job.id(), job = %name, "Dispatching job");
        handler.handle(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::Delay;
    use crate::job::{JobDescriptor, Payload};
    use crate::queue::{MemoryQueue, Queue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
        })
    }

    async fn consumed(name: &str) -> Job {
        let queue = MemoryQueue::new("default");
        queue
            .push(&JobDescriptor::new(name, Payload::new()), Delay::none())
            .await
            .unwrap();
        queue.consume().await.unwrap().unwrap()
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.add_handler("send-email", counting()).unwrap();

        assert!(matches!(
            registry.add_handler("send-email", counting()),
            Err(StevedoreError::DuplicateHandler(name)) if name == "send-email"
        ));
    }

    #[tokio::test]
    async fn exact_match_wins_over_wildcard() {
        let wildcard = counting();
        let exact = counting();

        let mut registry = HandlerRegistry::new();
        registry
            .add_handler("mail.*", wildcard.clone())
            .unwrap()
            .add_handler("mail.welcome", exact.clone())
            .unwrap();

        registry.handle(&consumed("mail.welcome").await).await.unwrap();
        registry.handle(&consumed("mail.reset").await).await.unwrap();

        assert_eq!(exact.calls.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_to_default_then_fails() {
        let fallback = counting();
        let registry = HandlerRegistry::new().with_default(fallback.clone());
        registry.handle(&consumed("unknown").await).await.unwrap();
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

        let err = HandlerRegistry::new()
            .handle(&consumed("unknown").await)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StevedoreError>(),
            Some(StevedoreError::InvalidHandler(name)) if name == "unknown"
        ));
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = handler_fn(|job: &Job| {
            anyhow::ensure!(job.name() == Some("ok"), "unexpected job");
            Ok(())
        });

        handler.handle(&consumed("ok").await).await.unwrap();
        assert!(handler.handle(&consumed("nope").await).await.is_err());
    }
}
