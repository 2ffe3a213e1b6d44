/*!
# Worker Module

Long-running consumption loop.

A worker repeatedly consumes one job from a queue (a single backend or a
`QueueManager`), hands it to a `JobHandler`, then deletes it on success or
releases it with back-off on failure. Between jobs it evaluates, in order:

1. termination requested (signal or `TerminationHandle`) or kill file present
2. memory usage at or above the limit
3. elapsed time at or above the limit
4. `stop_on_no_job` and the last poll came back empty
5. executed jobs at or above the maximum

The first predicate that holds ends the run with the matching `WorkerExit`.
Handler errors and panics never leave the loop; queue errors always do.
*/

use crate::error::Result;
use crate::handler::JobHandler;
use crate::queue::Queue;
use crate::rate_limit::{null_limiter, RateLimiter};
use crate::resources::{MemoryProbe, ProcessMemory};
use crate::retry::Backoff;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Name used in log spans when none is configured
pub const DEFAULT_WORKER_NAME: &str = "worker";

/// Run configuration for a worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Recorded on the `worker` span wrapping every log line of a run
    pub name: String,
    /// Stop after this many jobs; unlimited when unset
    pub max_jobs: Option<u64>,
    /// Stop once the process uses this many megabytes
    pub memory_limit_mb: Option<u64>,
    /// Stop once the run has lasted this long
    pub time_limit: Option<Duration>,
    /// Stop when this file exists
    pub kill_file: Option<PathBuf>,
    /// Stop on the first poll that finds no job
    pub stop_on_no_job: bool,
    /// Pause between two jobs
    pub sleep: Duration,
    /// Pause after a poll that found no job
    pub sleep_no_job: Duration,
    pub backoff: Backoff,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_WORKER_NAME.to_string(),
            max_jobs: None,
            memory_limit_mb: None,
            time_limit: None,
            kill_file: None,
            stop_on_no_job: false,
            sleep: Duration::ZERO,
            sleep_no_job: Duration::from_secs(1),
            backoff: Backoff::default(),
            rate_limiter: null_limiter(),
        }
    }
}

/// Why a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    ShouldTerminate,
    StopNoJob,
    MemoryLimit,
    TimeExceeded,
    LimitExceeded,
}

impl WorkerExit {
    /// Process exit code; every reason shares the same non-zero code
    pub fn code(&self) -> i32 {
        1
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::ShouldTerminate => "Signal to terminate",
            Self::StopNoJob => "No more job to execute",
            Self::MemoryLimit => "Memory limit exceeded",
            Self::TimeExceeded => "Time limit exceeded",
            Self::LimitExceeded => "Number of jobs exceeded",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShouldTerminate => "SHOULD_TERMINATE",
            Self::StopNoJob => "STOP_NO_JOB",
            Self::MemoryLimit => "MEMORY_LIMIT",
            Self::TimeExceeded => "TIME_EXCEEDED",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exit({}): {}", self.code(), self.reason())
    }
}

/// Shared cancellation flag, checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle {
    flag: Arc<AtomicBool>,
}

impl TerminationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop after the job in flight, if any
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Set the handle once Ctrl-C, SIGTERM or SIGQUIT is received.
pub fn listen_for_signals(handle: TerminationHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(signal, "Termination signal received");
                handle.terminate();
            }
            Err(e) => warn!("Failed to install signal handlers: {}", e),
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = term.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "CTRL_C")
}

#[derive(Debug, Default)]
struct RunState {
    executed: u64,
    last_poll_empty: bool,
}

/// Consumes jobs from a queue and dispatches them to a handler
pub struct Worker {
    handler: Arc<dyn JobHandler>,
    memory: Arc<dyn MemoryProbe>,
    termination: TerminationHandle,
}

impl Worker {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            memory: Arc::new(ProcessMemory::new()),
            termination: TerminationHandle::new(),
        }
    }

    /// Replace the memory probe consulted for `memory_limit_mb`
    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// Share an existing cancellation flag, e.g. one fed by `listen_for_signals`
    pub fn with_termination(mut self, termination: TerminationHandle) -> Self {
        self.termination = termination;
        self
    }

    pub fn termination_handle(&self) -> TerminationHandle {
        self.termination.clone()
    }

    /// Run until a stop condition holds; queue errors abort the run.
    pub async fn run(&self, queue: &dyn Queue, options: &WorkerOptions) -> Result<WorkerExit> {
        let span = info_span!("worker", name = %options.name);
        self.run_loop(queue, options).instrument(span).await
    }

    async fn run_loop(&self, queue: &dyn Queue, options: &WorkerOptions) -> Result<WorkerExit> {
        info!(queue = %queue.name(), "Start worker on queue(s): {}", queue.name());
        debug!(
            max_jobs = ?options.max_jobs,
            memory_limit_mb = ?options.memory_limit_mb,
            time_limit = ?options.time_limit,
            kill_file = ?options.kill_file,
            stop_on_no_job = options.stop_on_no_job,
            sleep_ms = options.sleep.as_millis() as u64,
            sleep_no_job_ms = options.sleep_no_job.as_millis() as u64,
            backoff = ?options.backoff,
            rate_limiter = ?options.rate_limiter,
            "Worker options"
        );

        let started = Instant::now();
        let mut state = RunState::default();

        loop {
            if let Some(exit) = self.stop_reason(options, &state, started) {
                info!(code = exit.code(), reason = exit.as_str(), "{}", exit);
                return Ok(exit);
            }

            if state.executed > 0 && !options.sleep.is_zero() {
                time::sleep(options.sleep).await;
            }

            if options.rate_limiter.reached() {
                debug!(
                    wait_ms = options.rate_limiter.wait_time().as_millis() as u64,
                    "Rate limit reached, waiting before next job"
                );
                options.rate_limiter.wait().await;
            }

            let mut job = match queue.consume().await? {
                Some(job) => job,
                None => {
                    debug!(queue = %queue.name(), "No job to consume");
                    state.last_poll_empty = true;
                    if !options.stop_on_no_job {
                        time::sleep(options.sleep_no_job).await;
                    }
                    continue;
                }
            };

            state.last_poll_empty = false;
            options.rate_limiter.pop()?;
            state.executed += 1;

            info!(
                job_id = %job.id(),
                job = job.name().unwrap_or("-"),
                queue = %job.queue_name(),
                attempts = job.attempts(),
                "Job consumed"
            );

            let job_started = Instant::now();
            let outcome = match AssertUnwindSafe(self.handler.handle(&job))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            let elapsed_ms = job_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    job.delete().await?;
                    info!(job_id = %job.id(), elapsed_ms, "Job executed");
                }
                Err(err) => {
                    let delay = options.backoff.next_delay(job.attempts());
                    error!(
                        job_id = %job.id(),
                        attempts = job.attempts(),
                        elapsed_ms,
                        retry_in_secs = delay.as_secs(),
                        "Job failed: {:#}",
                        err
                    );
                    job.release(delay).await?;
                }
            }
        }
    }

    fn stop_reason(
        &self,
        options: &WorkerOptions,
        state: &RunState,
        started: Instant,
    ) -> Option<WorkerExit> {
        if self.termination.is_terminated() {
            return Some(WorkerExit::ShouldTerminate);
        }

        if let Some(path) = &options.kill_file {
            if path.exists() {
                debug!(path = %path.display(), "Kill file found");
                return Some(WorkerExit::ShouldTerminate);
            }
        }

        if let Some(limit) = options.memory_limit_mb {
            if self.memory.used_mb() >= limit {
                return Some(WorkerExit::MemoryLimit);
            }
        }

        if let Some(limit) = options.time_limit {
            if started.elapsed() >= limit {
                return Some(WorkerExit::TimeExceeded);
            }
        }

        if options.stop_on_no_job && state.last_poll_empty {
            return Some(WorkerExit::StopNoJob);
        }

        if let Some(max) = options.max_jobs {
            if state.executed >= max {
                return Some(WorkerExit::LimitExceeded);
            }
        }

        None
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::delay::Delay;
    use crate::error::StevedoreError;
    use crate::handler::handler_fn;
    use crate::job::{JobDescriptor, Payload};
    use crate::queue::{MemoryQueue, MemoryQueueOptions, NullQueue};
    use crate::rate_limit::TimeWindowLimiter;
    use crate::resources::FixedMemory;
    use std::sync::atomic::AtomicUsize;

    fn counting_worker(fail: bool) -> (Worker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn(move |_job| {
            seen.fetch_add(1, Ordering::SeqCst);
            if fail {
                anyhow::bail!("smtp unavailable");
            }
            Ok(())
        });

        (Worker::new(Arc::new(handler)), calls)
    }

    async fn queue_with(jobs: usize) -> MemoryQueue {
        let queue = MemoryQueue::new("default");
        for n in 0..jobs {
            queue
                .push(
                    &JobDescriptor::new("send-email", Payload::new().with("n", n as u64)),
                    Delay::none(),
                )
                .await
                .unwrap();
        }
        queue
    }

    #[test]
    fn exit_reasons_share_one_code() {
        let all = [
            WorkerExit::ShouldTerminate,
            WorkerExit::StopNoJob,
            WorkerExit::MemoryLimit,
            WorkerExit::TimeExceeded,
            WorkerExit::LimitExceeded,
        ];

        assert!(all.iter().all(|exit| exit.code() == 1));
        assert_eq!(WorkerExit::StopNoJob.as_str(), "STOP_NO_JOB");
        assert_eq!(
            WorkerExit::LimitExceeded.to_string(),
            "Exit(1): Number of jobs exceeded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_jobs() {
        let queue = queue_with(3).await;
        let (worker, calls) = counting_worker(false);
        let options = WorkerOptions {
            max_jobs: Some(2),
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::LimitExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stored().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_queue_then_stops_on_no_job() {
        let queue = queue_with(4).await;
        let (worker, calls) = counting_worker(false);
        let options = WorkerOptions {
            stop_on_no_job: true,
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::StopNoJob);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.stored().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_released_with_backoff() {
        let clock = MockClock::default();
        let queue = MemoryQueue::with_options(
            "default",
            MemoryQueueOptions {
                clock: Arc::new(clock.clone()),
                ..Default::default()
            },
        );
        queue
            .push(&JobDescriptor::new("send-email", Payload::new()), Delay::none())
            .await
            .unwrap();

        let (worker, _) = counting_worker(true);
        let options = WorkerOptions {
            max_jobs: Some(1),
            backoff: Backoff::new(30, 2.0),
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();
        assert_eq!(exit, WorkerExit::LimitExceeded);
        assert_eq!(queue.stored().await, 1);

        clock.advance_secs(29);
        assert!(queue.consume().await.unwrap().is_none());

        clock.advance_secs(1);
        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_counts_as_failure() {
        let queue = queue_with(1).await;
        let handler = handler_fn(|_job| -> anyhow::Result<()> { panic!("boom") });
        let worker = Worker::new(Arc::new(handler));
        let options = WorkerOptions {
            max_jobs: Some(1),
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::LimitExceeded);
        assert_eq!(queue.stored().await, 1);
        assert_eq!(queue.consume().await.unwrap().unwrap().attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_handle_wins_over_everything() {
        let queue = queue_with(1).await;
        let (worker, calls) = counting_worker(false);
        worker.termination_handle().terminate();

        let options = WorkerOptions {
            max_jobs: Some(0),
            memory_limit_mb: Some(0),
            ..Default::default()
        };
        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::ShouldTerminate);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_file_stops_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let kill_file = dir.path().join("worker.kill");
        std::fs::write(&kill_file, b"").unwrap();

        let queue = queue_with(2).await;
        let (worker, calls) = counting_worker(false);
        let options = WorkerOptions {
            kill_file: Some(kill_file),
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::ShouldTerminate);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_limit_is_checked_before_time() {
        let queue = queue_with(1).await;
        let (worker, _) = counting_worker(false);
        let worker = worker.with_memory_probe(Arc::new(FixedMemory::new(512)));
        let options = WorkerOptions {
            memory_limit_mb: Some(256),
            time_limit: Some(Duration::ZERO),
            ..Default::default()
        };

        let exit = worker.run(&queue, &options).await.unwrap();
        assert_eq!(exit, WorkerExit::MemoryLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_ends_an_idle_worker() {
        let queue = MemoryQueue::new("default");
        let (worker, _) = counting_worker(false);
        let options = WorkerOptions {
            time_limit: Some(Duration::from_secs(5)),
            sleep_no_job: Duration::from_secs(1),
            ..Default::default()
        };

        let started = Instant::now();
        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::TimeExceeded);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_out_jobs() {
        let queue = queue_with(3).await;
        let (worker, calls) = counting_worker(false);
        let options = WorkerOptions {
            stop_on_no_job: true,
            rate_limiter: Arc::new(TimeWindowLimiter::per_seconds(2, 60)),
            ..Default::default()
        };

        let started = Instant::now();
        let exit = worker.run(&queue, &options).await.unwrap();

        assert_eq!(exit, WorkerExit::StopNoJob);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_errors_abort_the_run() {
        let (worker, _) = counting_worker(false);

        let result = worker.run(&NullQueue::default(), &WorkerOptions::default()).await;
        assert!(matches!(result, Err(StevedoreError::NoQueueDefined)));
    }
}
