/*!
# Error Module

This module defines the error handling infrastructure for Stevedore.

The module includes:
- The `StevedoreError` enum that categorizes every failure the library can surface
- A `Result` type alias for convenience
- Conversions from the transport clients (database, Redis, AMQP) into `Backend` errors

Job resolution violations (`AlreadyReleased`, `AlreadyDeleted`) and backend errors
are never retried by the queue layer; they always reach the caller.
*/

use thiserror::Error;

/// Result type alias for Stevedore operations
pub type Result<T> = std::result::Result<T, StevedoreError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during Stevedore operations
#[derive(Debug, Error)]
pub enum StevedoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{}", queue_not_found_message(.0))]
    QueueNotFound(Vec<String>),

    #[error("Invalid job handler for job `{0}`")]
    InvalidHandler(String),

    #[error("A job handler already exists for job `{0}`")]
    DuplicateHandler(String),

    #[error("Queue error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Checksum mismatch (expected {expected}, actual {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Job #{0} has already been released")]
    AlreadyReleased(String),

    #[error("Job #{0} has already been deleted")]
    AlreadyDeleted(String),

    #[error("No queue defined")]
    NoQueueDefined,

    #[error("Rate limit reached")]
    RateLimitReached,

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("Path `{0}` not found in payload")]
    PathNotFound(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StevedoreError {
    /// Backend failure without an underlying cause
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Backend failure wrapping the transport error that caused it
    pub fn backend_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Queue lookup miss for one or several names
    pub fn queue_not_found<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::QueueNotFound(names.into_iter().map(Into::into).collect())
    }
}

fn queue_not_found_message(names: &[String]) -> String {
    let quoted = names
        .iter()
        .map(|name| format!("`{}`", name))
        .collect::<Vec<_>>()
        .join(", ");

    if names.len() > 1 {
        format!("Queues {} not found", quoted)
    } else {
        format!("Queue {} not found", quoted)
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StevedoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend_with("database operation failed", err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StevedoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::backend_with("redis operation failed", err)
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for StevedoreError {
    fn from(err: lapin::Error) -> Self {
        Self::backend_with("amqp operation failed", err)
    }
}

impl From<config::ConfigError> for StevedoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
