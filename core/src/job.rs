/*!
# Job Module

This module defines the unit of work moved through Stevedore queues.

Every job has:
- An optional name, used by handler dispatch
- A payload, an ordered JSON object of user fields
- Once consumed: an identifier, an attempt counter and the backend that owns it

The module includes:
- `Payload`, the decoded job data with dotted-path lookups
- `JobDescriptor`, what producers push
- `Job`, what consumers receive; it must be resolved exactly once by `delete` or `release`
- The wire envelope shared by every backend: the payload fields merged with a `jobName` key
*/

use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::queue::JobBackend;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Envelope key carrying the job name on the wire
pub const JOB_NAME_KEY: &str = "jobName";

/// Decoded job data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a value by dotted path (`"user.email"`, `"items.0"`)
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(path) {
            return Some(value);
        }

        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// Look up a value, falling back to `default`
    pub fn get_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get(path).unwrap_or(default)
    }

    /// Look up a value or fail with `PathNotFound`
    pub fn get_or_fail(&self, path: &str) -> Result<&Value> {
        self.get(path)
            .ok_or_else(|| StevedoreError::PathNotFound(path.to_string()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = StevedoreError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(StevedoreError::InvalidJob(format!(
                "payload must be a JSON object, got `{}`",
                other
            ))),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A job as pushed by a producer
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    name: Option<String>,
    payload: Payload,
    queue: Option<String>,
}

impl JobDescriptor {
    /// Create a named job
    pub fn new(name: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            name: Some(name.into()),
            payload: payload.into(),
            queue: None,
        }
    }

    /// Create a job without a name; only a default handler can run it
    pub fn anonymous(payload: impl Into<Payload>) -> Self {
        Self {
            name: None,
            payload: payload.into(),
            queue: None,
        }
    }

    /// Declare the queue this job prefers; wins over the queue given to `QueueManager::push_to`
    pub fn for_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Preferred queue, if any
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Wire form: payload fields merged with `jobName`
    pub fn to_envelope(&self) -> Value {
        let mut map = self.payload.as_map().clone();
        map.insert(
            JOB_NAME_KEY.to_string(),
            self.name.clone().map(Value::String).unwrap_or(Value::Null),
        );
        Value::Object(map)
    }

    /// Serialized wire form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }

    /// Split a wire envelope back into name and payload
    pub fn from_envelope(envelope: Value) -> Result<Self> {
        let mut map = match envelope {
            Value::Object(map) => map,
            other => {
                return Err(StevedoreError::InvalidJob(format!(
                    "envelope must be a JSON object, got `{}`",
                    other
                )))
            }
        };

        let name = match map.remove(JOB_NAME_KEY) {
            Some(Value::String(name)) => Some(name),
            _ => None,
        };

        Ok(Self {
            name,
            payload: Payload(map),
            queue: None,
        })
    }

    /// Parse a serialized wire envelope
    pub fn decode(body: &str) -> Result<Self> {
        Self::from_envelope(serde_json::from_str(body)?)
    }
}

/// Backend data needed to resolve a consumed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Resolved by id alone (memory, database, redis)
    None,
    /// Broker delivery tag (AMQP)
    DeliveryTag(u64),
    /// Service receipt handle (cloud queue)
    Handle(String),
}

/// A consumed job, owned by one consumer for one processing attempt
pub struct Job {
    id: String,
    descriptor: JobDescriptor,
    attempts: u32,
    queue: String,
    receipt: Receipt,
    backend: Arc<dyn JobBackend>,
    released: bool,
    deleted: bool,
}

impl Job {
    /// Build a job for the backend that leased it
    pub fn new(
        id: impl Into<String>,
        descriptor: JobDescriptor,
        attempts: u32,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        let queue = backend.queue_name().to_string();

        Self {
            id: id.into(),
            descriptor,
            attempts,
            queue,
            receipt: Receipt::None,
            backend,
            released: false,
            deleted: false,
        }
    }

    pub fn with_receipt(mut self, receipt: Receipt) -> Self {
        self.receipt = receipt;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.name()
    }

    pub fn payload(&self) -> &Payload {
        self.descriptor.payload()
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// Number of times this job has been consumed, this attempt included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Name of the queue the job was consumed from
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Fail if the job already reached a terminal resolution
    pub fn ensure_unresolved(&self) -> Result<()> {
        if self.released {
            return Err(StevedoreError::AlreadyReleased(self.id.clone()));
        }
        if self.deleted {
            return Err(StevedoreError::AlreadyDeleted(self.id.clone()));
        }
        Ok(())
    }

    /// Hand the job back to its queue, eligible again after `delay`
    pub async fn release(&mut self, delay: impl Into<Delay> + Send) -> Result<()> {
        self.ensure_unresolved()?;

        let backend = Arc::clone(&self.backend);
        backend.release(&*self, delay.into()).await?;
        self.released = true;

        Ok(())
    }

    /// Remove the job from its queue for good
    pub async fn delete(&mut self) -> Result<()> {
        self.ensure_unresolved()?;

        let backend = Arc::clone(&self.backend);
        backend.delete(&*self).await?;
        self.deleted = true;

        Ok(())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.descriptor.name())
            .field("attempts", &self.attempts)
            .field("queue", &self.queue)
            .field("released", &self.released)
            .field("deleted", &self.deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_dotted_lookup() {
        let payload = Payload::try_from(json!({
            "to": "x@y",
            "user": {"id": 7, "tags": ["a", "b"]},
            "odd.key": true,
        }))
        .unwrap();

        assert_eq!(payload.get("to"), Some(&json!("x@y")));
        assert_eq!(payload.get("user.id"), Some(&json!(7)));
        assert_eq!(payload.get("user.tags.1"), Some(&json!("b")));
        assert_eq!(payload.get("odd.key"), Some(&json!(true)));
        assert_eq!(payload.get("user.missing"), None);
        assert_eq!(payload.get_or("nope", &json!(0)), &json!(0));
        assert!(matches!(
            payload.get_or_fail("user.name"),
            Err(StevedoreError::PathNotFound(path)) if path == "user.name"
        ));
    }

    #[test]
    fn payload_rejects_non_objects() {
        assert!(Payload::try_from(json!([1, 2])).is_err());
        assert!(Payload::try_from(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn envelope_carries_job_name() {
        let descriptor = JobDescriptor::new("send-email", Payload::new().with("to", "x@y"));

        let envelope = descriptor.to_envelope();
        assert_eq!(envelope, json!({"to": "x@y", "jobName": "send-email"}));

        let decoded = JobDescriptor::decode(&descriptor.encode().unwrap()).unwrap();
        assert_eq!(decoded.name(), Some("send-email"));
        assert_eq!(decoded.payload().get("to"), Some(&json!("x@y")));
        assert!(decoded.payload().get(JOB_NAME_KEY).is_none());
    }

    #[test]
    fn anonymous_envelope_has_null_name() {
        let descriptor = JobDescriptor::anonymous(Payload::new());
        assert_eq!(descriptor.to_envelope(), json!({"jobName": null}));
        assert_eq!(JobDescriptor::decode("{\"jobName\":null}").unwrap().name(), None);
    }

    #[test]
    fn preferred_queue_is_not_part_of_the_envelope() {
        let descriptor = JobDescriptor::new("report", Payload::new()).for_queue("slow");
        assert_eq!(descriptor.queue(), Some("slow"));
        assert_eq!(descriptor.to_envelope(), json!({"jobName": "report"}));
    }
}
