/*!
# Config Module

File and environment configuration for workers and queues.

Settings are read with the `config` crate from an optional TOML file, then
overridden by `STEVEDORE__*` environment variables (`__` separates nested
keys, e.g. `STEVEDORE__WORKER__MAX_JOBS=100`).

```toml
[worker]
max_jobs = 1000
backoff_secs = 30
backoff_multiplier = 2
rate_limits = ["100/min"]

[[queues]]
backend = "redis"
name = "emails"
url = "redis://127.0.0.1/"
```
*/

use crate::error::{Result, StevedoreError};
use crate::manager::QueueManager;
use crate::queue::{MemoryQueue, MemoryQueueOptions, NullQueue, Queue};
use crate::rate_limit::limiter_from_specs;
use crate::retry::Backoff;
use crate::worker::{WorkerOptions, DEFAULT_WORKER_NAME};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ENV_VAR_PREFIX: &str = "STEVEDORE";
const ENV_VAR_SEPARATOR: &str = "__";

/// Complete configuration: one worker and its queues in priority order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
}

/// Worker run limits and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub name: Option<String>,
    pub max_jobs: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub time_limit_secs: Option<u64>,
    pub kill_file: Option<PathBuf>,
    pub stop_on_no_job: bool,
    pub sleep_secs: u64,
    pub sleep_no_job_secs: u64,
    pub backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    pub rate_limits: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: None,
            max_jobs: None,
            memory_limit_mb: None,
            time_limit_secs: None,
            kill_file: None,
            stop_on_no_job: false,
            sleep_secs: 0,
            sleep_no_job_secs: 1,
            backoff_secs: 0,
            backoff_multiplier: 1.0,
            backoff_jitter: 0.0,
            rate_limits: Vec::new(),
        }
    }
}

impl WorkerSettings {
    /// Build run options; fails on a malformed rate spec
    pub fn to_options(&self) -> Result<WorkerOptions> {
        Ok(WorkerOptions {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string()),
            max_jobs: self.max_jobs,
            memory_limit_mb: self.memory_limit_mb,
            time_limit: self.time_limit_secs.map(Duration::from_secs),
            kill_file: self.kill_file.clone(),
            stop_on_no_job: self.stop_on_no_job,
            sleep: Duration::from_secs(self.sleep_secs),
            sleep_no_job: Duration::from_secs(self.sleep_no_job_secs),
            backoff: Backoff::new(self.backoff_secs, self.backoff_multiplier)
                .with_jitter(self.backoff_jitter),
            rate_limiter: limiter_from_specs(&self.rate_limits)?,
        })
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_time_secs() -> u64 {
    30
}

fn default_lock_retries() -> u32 {
    5
}

fn default_table() -> String {
    "queue_jobs".to_string()
}

fn default_null_name() -> String {
    "NULL".to_string()
}

/// One queue backend, selected by the `backend` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum QueueSettings {
    Memory {
        name: String,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_retry_time_secs")]
        retry_time_secs: u64,
    },
    Database {
        name: String,
        url: String,
        #[serde(default = "default_table")]
        table: String,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_retry_time_secs")]
        retry_time_secs: u64,
        #[serde(default = "default_lock_retries")]
        lock_retries: u32,
        /// Create the jobs table on connect
        #[serde(default)]
        create_table: bool,
    },
    Redis {
        name: String,
        url: String,
    },
    Amqp {
        name: String,
        url: String,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default)]
        rate_limits: Vec<String>,
    },
    Null {
        #[serde(default = "default_null_name")]
        name: String,
    },
}

impl QueueSettings {
    pub fn name(&self) -> &str {
        match self {
            Self::Memory { name, .. }
            | Self::Database { name, .. }
            | Self::Redis { name, .. }
            | Self::Amqp { name, .. }
            | Self::Null { name } => name,
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Database { .. } => "database",
            Self::Redis { .. } => "redis",
            Self::Amqp { .. } => "amqp",
            Self::Null { .. } => "null",
        }
    }

    /// Open the backend described by these settings
    pub async fn connect(&self) -> Result<Arc<dyn Queue>> {
        info!(queue = %self.name(), backend = self.backend(), "Connecting queue");

        let queue: Arc<dyn Queue> = match self {
            Self::Memory {
                name,
                max_attempts,
                retry_time_secs,
            } => Arc::new(MemoryQueue::with_options(
                name.clone(),
                MemoryQueueOptions {
                    max_attempts: *max_attempts,
                    retry_time: Duration::from_secs(*retry_time_secs),
                    ..Default::default()
                },
            )),
            Self::Database { .. } => self.connect_database().await?,
            Self::Redis { .. } => self.connect_redis().await?,
            Self::Amqp { .. } => self.connect_amqp().await?,
            Self::Null { name } => Arc::new(NullQueue::new(name.clone())),
        };

        Ok(queue)
    }

    #[cfg(feature = "database")]
    async fn connect_database(&self) -> Result<Arc<dyn Queue>> {
        use crate::queue::{DatabaseQueue, DatabaseQueueOptions};

        let Self::Database {
            name,
            url,
            table,
            max_attempts,
            retry_time_secs,
            lock_retries,
            create_table,
        } = self
        else {
            return Err(StevedoreError::Configuration(
                "not a database queue".to_string(),
            ));
        };

        let options = DatabaseQueueOptions {
            table: table.clone(),
            max_attempts: *max_attempts,
            retry_time: Duration::from_secs(*retry_time_secs),
            lock_retries: *lock_retries,
            ..Default::default()
        };
        let queue = DatabaseQueue::connect(url, name.clone(), options).await?;
        if *create_table {
            queue.create_table().await?;
        }

        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "database"))]
    async fn connect_database(&self) -> Result<Arc<dyn Queue>> {
        Err(missing_feature("database"))
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self) -> Result<Arc<dyn Queue>> {
        use crate::queue::{RedisQueue, RedisQueueOptions};

        let Self::Redis { name, url } = self else {
            return Err(StevedoreError::Configuration(
                "not a redis queue".to_string(),
            ));
        };

        let queue = RedisQueue::connect(url, name.clone(), RedisQueueOptions::default()).await?;
        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self) -> Result<Arc<dyn Queue>> {
        Err(missing_feature("redis"))
    }

    #[cfg(feature = "amqp")]
    async fn connect_amqp(&self) -> Result<Arc<dyn Queue>> {
        use crate::queue::{AmqpQueue, AmqpQueueOptions};

        let Self::Amqp {
            name,
            url,
            max_attempts,
            rate_limits,
        } = self
        else {
            return Err(StevedoreError::Configuration("not an amqp queue".to_string()));
        };

        let options = AmqpQueueOptions {
            max_attempts: *max_attempts,
            rate_limiter: limiter_from_specs(rate_limits)?,
            ..Default::default()
        };
        let queue = AmqpQueue::connect_url(url, name.clone(), options).await?;
        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "amqp"))]
    async fn connect_amqp(&self) -> Result<Arc<dyn Queue>> {
        Err(missing_feature("amqp"))
    }
}

#[allow(dead_code)]
fn missing_feature(feature: &str) -> StevedoreError {
    StevedoreError::Configuration(format!(
        "stevedore_core was built without the `{}` feature",
        feature
    ))
}

impl Settings {
    /// Read `path` (when given) then apply `STEVEDORE__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config = builder
            .add_source(
                Environment::default()
                    .prefix(ENV_VAR_PREFIX)
                    .separator(ENV_VAR_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml(text: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Connect every declared queue, in declaration order
    pub async fn connect(&self) -> Result<QueueManager> {
        let mut queues = Vec::with_capacity(self.queues.len());
        for settings in &self.queues {
            queues.push(settings.connect().await?);
        }

        QueueManager::from_queues(queues)
    }
}
