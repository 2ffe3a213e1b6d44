/*!
# AMQP Queue

Queue on an AMQP 0-9-1 broker (RabbitMQ).

Topology for a queue named `jobs`:

- exchange `jobs` (direct) bound to queue `jobs` with routing key `jobs`;
  the queue declares `x-max-priority = max_attempts`
- delay queues `jobs:<secs>` on the default exchange, auto-deleted, with
  `x-message-ttl = secs * 1000` and dead-lettering back to exchange `jobs`
- dead queue `jobs:dead`, receiving jobs that exhausted `max_attempts`

Messages carry the job envelope as body and `jobId`, `attempts`, `delay` headers.
Priority is `max_attempts - attempts`, so first attempts are delivered before retries.
*/

use super::{new_job_id, JobBackend, Purgeable, Queue};
use crate::clock::{system_clock, Clock};
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor, Receipt};
use crate::rate_limit::{null_limiter, RateLimiter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Arguments of a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub max_priority: Option<u8>,
    pub message_ttl_ms: Option<u64>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub auto_delete: bool,
}

/// Message published to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpMessage {
    pub body: Vec<u8>,
    pub job_id: String,
    pub attempts: u32,
    /// Requested delay in seconds
    pub delay: u64,
    pub priority: u8,
    /// Epoch seconds
    pub timestamp: i64,
}

/// Message fetched from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub job_id: Option<String>,
    pub attempts: u32,
}

/// Broker operations the queue relies on
#[async_trait]
pub trait AmqpTransport: Send + Sync + 'static {
    /// Declare a durable direct exchange
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue, returning its ready message count
    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<u64>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish persistently; `exchange` may be `""` for the default exchange
    async fn publish(&self, exchange: &str, routing_key: &str, message: AmqpMessage) -> Result<()>;

    /// Fetch one message without auto-ack
    async fn get(&self, queue: &str) -> Result<Option<AmqpDelivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn purge(&self, queue: &str) -> Result<()>;
}

/// Tuning knobs for `AmqpQueue`
#[derive(Debug, Clone)]
pub struct AmqpQueueOptions {
    /// Jobs published with this many attempts go to the dead queue
    pub max_attempts: u32,
    /// Consulted before every fetch
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

impl Default for AmqpQueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rate_limiter: null_limiter(),
            clock: system_clock(),
        }
    }
}

/// Where a message goes, depending on its delay and attempts
enum Route {
    Live,
    Delayed(u64),
    Dead,
}

struct AmqpBackend {
    name: String,
    transport: Arc<dyn AmqpTransport>,
    options: AmqpQueueOptions,
}

impl AmqpBackend {
    fn live_arguments(&self) -> QueueArguments {
        QueueArguments {
            max_priority: Some(u8::try_from(self.options.max_attempts).unwrap_or(u8::MAX)),
            ..Default::default()
        }
    }

    fn dead_queue(&self) -> String {
        format!("{}:dead", self.name)
    }

    fn delay_queue(&self, secs: u64) -> String {
        format!("{}:{}", self.name, secs)
    }

    async fn publish(&self, job_id: &str, body: Vec<u8>, delay: Delay, attempts: u32) -> Result<()> {
        let now = self.options.clock.now();
        let delay_secs = delay.seconds_from(now);

        let route = if attempts >= self.options.max_attempts {
            Route::Dead
        } else if delay_secs > 0 {
            Route::Delayed(delay_secs)
        } else {
            Route::Live
        };

        let message = AmqpMessage {
            body,
            job_id: job_id.to_string(),
            attempts,
            delay: delay_secs,
            priority: u8::try_from(self.options.max_attempts.saturating_sub(attempts))
                .unwrap_or(u8::MAX),
            timestamp: now.timestamp(),
        };

        match route {
            Route::Live => {
                self.transport.publish(&self.name, &self.name, message).await?;
            }
            Route::Delayed(secs) => {
                let queue = self.delay_queue(secs);
                let arguments = QueueArguments {
                    message_ttl_ms: Some(secs.saturating_mul(1000)),
                    dead_letter_exchange: Some(self.name.clone()),
                    dead_letter_routing_key: Some(self.name.clone()),
                    auto_delete: true,
                    ..Default::default()
                };
                self.transport.declare_queue(&queue, &arguments).await?;
                self.transport.publish("", &queue, message).await?;
            }
            Route::Dead => {
                self.dead_letter(message).await?;
                debug!(job_id, queue = %self.name, attempts, "Job dead-lettered");
            }
        }

        Ok(())
    }

    async fn dead_letter(&self, message: AmqpMessage) -> Result<()> {
        let queue = self.dead_queue();
        self.transport
            .declare_queue(&queue, &QueueArguments::default())
            .await?;
        self.transport.publish("", &queue, message).await
    }

    /// Park a delivery that is not a job in the dead queue and ack it
    async fn reject(&self, delivery: AmqpDelivery, err: StevedoreError) -> StevedoreError {
        let job_id = delivery
            .job_id
            .unwrap_or_else(|| delivery.delivery_tag.to_string());
        warn!(job_id = %job_id, queue = %self.name, "Undecodable message dead-lettered: {}", err);

        let message = AmqpMessage {
            body: delivery.body,
            job_id,
            attempts: delivery.attempts,
            delay: 0,
            priority: 0,
            timestamp: self.options.clock.now().timestamp(),
        };

        let parked = match self.dead_letter(message).await {
            Ok(()) => self.transport.ack(delivery.delivery_tag).await,
            Err(e) => Err(e),
        };
        match parked {
            Ok(()) => err,
            Err(e) => e,
        }
    }

    fn delivery_tag(job: &Job) -> Result<u64> {
        match job.receipt() {
            Receipt::DeliveryTag(tag) => Ok(*tag),
            other => Err(StevedoreError::backend(format!(
                "job #{} has no delivery tag ({:?})",
                job.id(),
                other
            ))),
        }
    }
}

#[async_trait]
impl JobBackend for AmqpBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn release(&self, job: &Job, delay: Delay) -> Result<()> {
        job.ensure_unresolved()?;
        let tag = Self::delivery_tag(job)?;

        let body = job.descriptor().encode()?.into_bytes();
        self.publish(job.id(), body, delay, job.attempts()).await?;
        self.transport.ack(tag).await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job released");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        job.ensure_unresolved()?;
        let tag = Self::delivery_tag(job)?;

        self.transport.ack(tag).await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job deleted");
        Ok(())
    }
}

/// Queue backed by an AMQP broker
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpBackend>,
}

impl AmqpQueue {
    /// Declare the live exchange and queue, then return the queue handle
    pub async fn connect(
        transport: Arc<dyn AmqpTransport>,
        name: impl Into<String>,
        options: AmqpQueueOptions,
    ) -> Result<Self> {
        let backend = AmqpBackend {
            name: name.into(),
            transport,
            options,
        };

        backend.transport.declare_exchange(&backend.name).await?;
        backend
            .transport
            .declare_queue(&backend.name, &backend.live_arguments())
            .await?;
        backend
            .transport
            .bind_queue(&backend.name, &backend.name, &backend.name)
            .await?;

        Ok(Self {
            inner: Arc::new(backend),
        })
    }

    /// Connect to a broker at `url` through `lapin`
    #[cfg(feature = "amqp")]
    pub async fn connect_url(
        url: &str,
        name: impl Into<String>,
        options: AmqpQueueOptions,
    ) -> Result<Self> {
        let transport = LapinTransport::connect(url).await?;
        Self::connect(Arc::new(transport), name, options).await
    }
}

#[async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self) -> Result<u64> {
        self.inner
            .transport
            .declare_queue(&self.inner.name, &self.inner.live_arguments())
            .await
    }

    async fn consume(&self) -> Result<Option<Job>> {
        let limiter = &self.inner.options.rate_limiter;
        limiter.wait().await;

        let delivery = match self.inner.transport.get(&self.inner.name).await? {
            Some(delivery) => delivery,
            None => return Ok(None),
        };
        limiter.pop()?;

        let decoded = std::str::from_utf8(&delivery.body)
            .map_err(|err| {
                StevedoreError::InvalidJob(format!("message body is not UTF-8: {}", err))
            })
            .and_then(JobDescriptor::decode);
        let descriptor = match decoded {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(self.inner.reject(delivery, err).await),
        };
        let id = delivery
            .job_id
            .unwrap_or_else(|| delivery.delivery_tag.to_string());
        let backend: Arc<dyn JobBackend> = self.inner.clone();

        Ok(Some(
            Job::new(id, descriptor, delivery.attempts.saturating_add(1), backend)
                .with_receipt(Receipt::DeliveryTag(delivery.delivery_tag)),
        ))
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        let id = new_job_id();
        let body = serde_json::to_vec(&payload)?;
        self.inner.publish(&id, body, delay, attempts).await?;

        debug!(job_id = %id, queue = %self.inner.name, "Job pushed");
        Ok(id)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for AmqpQueue {
    async fn purge(&self) -> Result<()> {
        self.inner
            .transport
            .declare_queue(&self.inner.name, &self.inner.live_arguments())
            .await?;
        self.inner.transport.purge(&self.inner.name).await
    }
}

#[cfg(feature = "amqp")]
pub use self::lapin_transport::LapinTransport;

#[cfg(feature = "amqp")]
mod lapin_transport {
    use super::{AmqpDelivery, AmqpMessage, AmqpTransport, QueueArguments};
    use crate::error::Result;
    use async_trait::async_trait;
    use lapin::options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    };
    use lapin::types::{AMQPValue, FieldTable};
    use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

    /// `AmqpTransport` over a single `lapin` channel
    pub struct LapinTransport {
        // keeps the connection open for the channel's lifetime
        _connection: Connection,
        channel: Channel,
    }

    impl LapinTransport {
        pub async fn connect(url: &str) -> Result<Self> {
            let connection = Connection::connect(url, ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;

            Ok(Self {
                _connection: connection,
                channel,
            })
        }
    }

    fn header_u64(value: &AMQPValue) -> Option<u64> {
        match value {
            AMQPValue::ShortShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::LongUInt(v) => Some(u64::from(*v)),
            AMQPValue::Timestamp(v) => Some(*v),
            AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn header_string(value: &AMQPValue) -> Option<String> {
        match value {
            AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
            AMQPValue::ShortString(v) => Some(v.as_str().to_string()),
            other => header_u64(other).map(|n| n.to_string()),
        }
    }

    #[async_trait]
    impl AmqpTransport for LapinTransport {
        async fn declare_exchange(&self, name: &str) -> Result<()> {
            self.channel
                .exchange_declare(
                    name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Ok(())
        }

        async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<u64> {
            let mut table = FieldTable::default();
            if let Some(priority) = arguments.max_priority {
                table.insert("x-max-priority".into(), AMQPValue::LongInt(i32::from(priority)));
            }
            if let Some(ttl) = arguments.message_ttl_ms {
                table.insert(
                    "x-message-ttl".into(),
                    AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
                );
            }
            if let Some(exchange) = &arguments.dead_letter_exchange {
                table.insert(
                    "x-dead-letter-exchange".into(),
                    AMQPValue::LongString(exchange.clone().into()),
                );
            }
            if let Some(routing_key) = &arguments.dead_letter_routing_key {
                table.insert(
                    "x-dead-letter-routing-key".into(),
                    AMQPValue::LongString(routing_key.clone().into()),
                );
            }

            let queue = self
                .channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: !arguments.auto_delete,
                        auto_delete: arguments.auto_delete,
                        ..Default::default()
                    },
                    table,
                )
                .await?;

            Ok(u64::from(queue.message_count()))
        }

        async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok(())
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            message: AmqpMessage,
        ) -> Result<()> {
            let mut headers = FieldTable::default();
            headers.insert("jobId".into(), AMQPValue::LongString(message.job_id.into()));
            headers.insert(
                "attempts".into(),
                AMQPValue::LongLongInt(i64::from(message.attempts)),
            );
            headers.insert(
                "delay".into(),
                AMQPValue::LongLongInt(i64::try_from(message.delay).unwrap_or(i64::MAX)),
            );

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2)
                .with_priority(message.priority)
                .with_timestamp(u64::try_from(message.timestamp).unwrap_or_default())
                .with_headers(headers);

            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties,
                )
                .await?
                .await?;
            Ok(())
        }

        async fn get(&self, queue: &str) -> Result<Option<AmqpDelivery>> {
            let message = self
                .channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await?;

            Ok(message.map(|message| {
                let delivery = message.delivery;
                let header = |key: &str| {
                    delivery.properties.headers().as_ref().and_then(|headers| {
                        headers
                            .inner()
                            .iter()
                            .find(|(name, _)| name.as_str() == key)
                            .map(|(_, value)| value.clone())
                    })
                };

                let job_id = header("jobId").as_ref().and_then(header_string);
                let attempts = header("attempts")
                    .as_ref()
                    .and_then(header_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0);

                AmqpDelivery {
                    delivery_tag: delivery.delivery_tag,
                    body: delivery.data,
                    job_id,
                    attempts,
                }
            }))
        }

        async fn ack(&self, delivery_tag: u64) -> Result<()> {
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await?;
            Ok(())
        }

        async fn purge(&self, queue: &str) -> Result<()> {
            self.channel
                .queue_purge(queue, QueuePurgeOptions::default())
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::job::Payload;
    use crate::rate_limit::TimeWindowLimiter;
    use crate::testing::InMemoryBroker;

    fn email() -> JobDescriptor {
        JobDescriptor::new("send-email", Payload::new().with("to", "x@y"))
    }

    async fn queue(broker: &InMemoryBroker, clock: &MockClock, max_attempts: u32) -> AmqpQueue {
        AmqpQueue::connect(
            Arc::new(broker.clone()),
            "jobs",
            AmqpQueueOptions {
                max_attempts,
                clock: Arc::new(clock.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn declares_live_topology() {
        let broker = InMemoryBroker::new(MockClock::default());
        let _queue = queue(&broker, &MockClock::default(), 5).await;

        let arguments = broker.queue_arguments("jobs").unwrap();
        assert_eq!(arguments.max_priority, Some(5));
        assert!(broker.is_bound("jobs", "jobs", "jobs"));
    }

    #[tokio::test]
    async fn push_consume_delete() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 5).await;

        let id = queue.push(&email(), Delay::none()).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 1);

        let mut job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.name(), Some("send-email"));
        assert_eq!(broker.unacked(), 1);

        job.delete().await.unwrap();
        assert_eq!(broker.unacked(), 0);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_release_goes_through_ttl_queue() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 5).await;
        queue.push(&email(), Delay::none()).await.unwrap();

        let mut job = queue.consume().await.unwrap().unwrap();
        job.release(30).await.unwrap();
        assert_eq!(broker.unacked(), 0);

        let delay_queue = broker.queue_arguments("jobs:30").unwrap();
        assert_eq!(delay_queue.message_ttl_ms, Some(30_000));
        assert_eq!(delay_queue.dead_letter_exchange.as_deref(), Some("jobs"));
        assert!(delay_queue.auto_delete);

        assert!(queue.consume().await.unwrap().is_none());
        clock.advance_secs(30);

        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);
        assert_eq!(job.payload().get("to"), Some(&serde_json::json!("x@y")));
    }

    #[tokio::test]
    async fn exhausted_jobs_are_dead_lettered() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 2).await;
        queue.push(&email(), Delay::none()).await.unwrap();

        let mut job = queue.consume().await.unwrap().unwrap();
        job.release(0).await.unwrap();
        let mut job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.attempts(), 2);
        job.release(0).await.unwrap();

        assert!(queue.consume().await.unwrap().is_none());
        assert_eq!(broker.ready("jobs:dead"), 1);
    }

    #[tokio::test]
    async fn earlier_attempts_have_higher_priority() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 5).await;

        let retried = queue
            .push_raw(email().to_envelope(), Delay::none(), 3)
            .await
            .unwrap();
        let fresh = queue.push(&email(), Delay::none()).await.unwrap();

        assert_eq!(queue.consume().await.unwrap().unwrap().id(), fresh);
        assert_eq!(queue.consume().await.unwrap().unwrap().id(), retried);
    }

    #[tokio::test(start_paused = true)]
    async fn consumption_is_rate_limited() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let limiter = Arc::new(TimeWindowLimiter::per_seconds(1, 5));
        let queue = AmqpQueue::connect(
            Arc::new(broker.clone()),
            "jobs",
            AmqpQueueOptions {
                rate_limiter: limiter.clone(),
                clock: Arc::new(clock.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        queue.push(&email(), Delay::none()).await.unwrap();
        queue.push(&email(), Delay::none()).await.unwrap();

        let start = tokio::time::Instant::now();
        queue.consume().await.unwrap().unwrap();
        assert!(limiter.reached());
        queue.consume().await.unwrap().unwrap();

        assert!(start.elapsed() >= std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn purge_empties_live_queue() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 5).await;
        queue.push(&email(), Delay::none()).await.unwrap();

        queue.as_purgeable().unwrap().purge().await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_message_is_parked_and_acked() {
        let clock = MockClock::default();
        let broker = InMemoryBroker::new(clock.clone());
        let queue = queue(&broker, &clock, 5).await;

        let garbage = AmqpMessage {
            body: vec![0xff, 0xfe, 0xfd],
            job_id: "garbage".to_string(),
            attempts: 0,
            delay: 0,
            priority: 5,
            timestamp: 0,
        };
        broker.publish("", "jobs", garbage).await.unwrap();
        queue.push(&email(), Delay::none()).await.unwrap();

        assert!(matches!(
            queue.consume().await,
            Err(StevedoreError::InvalidJob(_))
        ));
        assert_eq!(broker.unacked(), 0);
        assert_eq!(broker.ready("jobs:dead"), 1);

        let job = queue.consume().await.unwrap().unwrap();
        assert_eq!(job.name(), Some("send-email"));
    }
}
