/*!
# Stevedore Core

Core library for Stevedore, a backend-agnostic job queue client written in Rust.

This library provides the building blocks for producing and consuming jobs:

- Job descriptors and consumed jobs with at-most-once resolution (`delete` or `release`)
- Queue backends behind one `Queue` trait: memory, database, Redis, AMQP, cloud queue and null
- A `QueueManager` fanning in several backends by priority, with glob filtering
- Rate limiters (sliding window, composite) parsed from specs such as `"100/min"`
- A `Worker` loop with stop conditions, back-off and fault isolation per job
- Configuration from TOML files and `STEVEDORE__*` environment variables
*/

pub mod clock;
pub mod config;
pub mod delay;
pub mod error;
pub mod handler;
pub mod job;
pub mod manager;
pub mod pattern;
pub mod queue;
pub mod rate_limit;
pub mod resources;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use error::{Result, StevedoreError};

pub use config::Settings;
pub use delay::Delay;
pub use handler::{handler_fn, HandlerRegistry, JobHandler};
/// Re-export core types for convenience
pub use job::{Job, JobDescriptor, Payload};
pub use manager::QueueManager;
pub use queue::{Purgeable, Queue};
pub use rate_limit::RateLimiter;
pub use retry::Backoff;
pub use worker::{Worker, WorkerExit, WorkerOptions};
