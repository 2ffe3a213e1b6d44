/*!
# Testing Module

In-memory stand-ins for the external services behind the Redis, AMQP and
cloud queue backends. They implement the transport traits with the service
semantics the backends rely on, so queue behaviour can be exercised without a
running server. Enabled under `cfg(test)` and with the `testing` feature.
*/

use crate::clock::Clock;
use crate::error::{Result, StevedoreError};
use crate::queue::amqp::{AmqpDelivery, AmqpMessage, AmqpTransport, QueueArguments};
use crate::queue::redis::RedisTransport;
use crate::queue::sqs::{md5_hex, CloudMessage, CloudQueueClient, MAX_DELAY_SECS};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub use crate::clock::MockClock;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RedisData {
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    strings: HashMap<String, (String, Instant)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl RedisData {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// Redis keyspace held in memory; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRedis {
    data: Arc<Mutex<RedisData>>,
}

impl InMemoryRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a sorted set
    pub fn zcard(&self, key: &str) -> usize {
        lock(&self.data)
            .sorted_sets
            .get(key)
            .map_or(0, HashMap::len)
    }

    /// Whether `key` holds a live value of any type
    pub fn exists(&self, key: &str) -> bool {
        let mut data = lock(&self.data);
        data.purge_expired();

        data.lists.get(key).is_some_and(|list| !list.is_empty())
            || data.sorted_sets.get(key).is_some_and(|set| !set.is_empty())
            || data.strings.contains_key(key)
            || data.hashes.get(key).is_some_and(|hash| !hash.is_empty())
    }

    /// Live value of a string key
    pub fn get(&self, key: &str) -> Option<String> {
        let mut data = lock(&self.data);
        data.purge_expired();
        data.strings.get(key).map(|(value, _)| value.clone())
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        lock(&self.data)
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned())
    }
}

#[async_trait]
impl RedisTransport for InMemoryRedis {
    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.data)
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.data)
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(lock(&self.data)
            .lists
            .get(key)
            .map_or(0, |list| list.len() as u64))
    }

    async fn zadd_nx(&self, key: &str, score: i64, member: &str) -> Result<()> {
        lock(&self.data)
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(score);
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max: i64) -> Result<Vec<String>> {
        let data = lock(&self.data);
        let mut members: Vec<(i64, &String)> = data
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max)
                    .map(|(member, score)| (*score, member))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();

        Ok(members.into_iter().map(|(_, member)| member.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(lock(&self.data)
            .sorted_sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut data = lock(&self.data);
        data.purge_expired();

        if data.strings.contains_key(key) {
            return Ok(false);
        }

        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        data.strings
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    async fn del(&self, keys: &[&str]) -> Result<()> {
        let mut data = lock(&self.data);
        for key in keys {
            data.lists.remove(*key);
            data.sorted_sets.remove(*key);
            data.strings.remove(*key);
            data.hashes.remove(*key);
        }
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut data = lock(&self.data);
        data.purge_expired();

        if data.strings.get(key).is_some_and(|(held, _)| held == value) {
            data.strings.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        lock(&self.data)
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AMQP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Enqueued {
    message: AmqpMessage,
    enqueued_at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct BrokerQueue {
    arguments: QueueArguments,
    messages: Vec<Enqueued>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, BrokerQueue>,
    bindings: HashSet<(String, String, String)>,
    unacked: HashMap<u64, AmqpMessage>,
    next_tag: u64,
    next_sequence: u64,
}

impl BrokerState {
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: AmqpMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            if !self.exchanges.contains(exchange) {
                return Err(StevedoreError::backend(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            self.bindings
                .iter()
                .filter(|(_, bound_exchange, key)| bound_exchange == exchange && key == routing_key)
                .map(|(queue, _, _)| queue.clone())
                .collect()
        };

        for target in targets {
            // Unroutable messages are dropped, as the broker does without `mandatory`
            if let Some(queue) = self.queues.get_mut(&target) {
                self.next_sequence += 1;
                queue.messages.push(Enqueued {
                    message: message.clone(),
                    enqueued_at: now,
                    sequence: self.next_sequence,
                });
            }
        }

        Ok(())
    }

    /// Dead-letter every message whose TTL elapsed
    fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut expired = Vec::new();

        for queue in self.queues.values_mut() {
            let ttl_ms = match queue.arguments.message_ttl_ms {
                Some(ttl_ms) => ttl_ms,
                None => continue,
            };
            let ttl = ChronoDuration::milliseconds(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
            let arguments = queue.arguments.clone();

            let (gone, kept): (Vec<Enqueued>, Vec<Enqueued>) = queue
                .messages
                .drain(..)
                .partition(|enqueued| enqueued.enqueued_at + ttl <= now);
            queue.messages = kept;

            for enqueued in gone {
                expired.push((arguments.clone(), enqueued));
            }
        }

        expired.sort_by_key(|(_, enqueued)| enqueued.sequence);
        for (arguments, enqueued) in expired {
            if let Some(exchange) = &arguments.dead_letter_exchange {
                let routing_key = arguments.dead_letter_routing_key.as_deref().unwrap_or("");
                self.route(exchange, routing_key, enqueued.message, now)?;
            }
        }

        Ok(())
    }
}

/// AMQP broker emulation: direct exchanges, priorities, message TTL and dead-lettering.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    clock: MockClock,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|queue| queue.arguments.clone())
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        lock(&self.state).bindings.contains(&(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ))
    }

    /// Deliveries not acknowledged yet
    pub fn unacked(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    /// Messages ready in `queue`, after TTL processing
    pub fn ready(&self, queue: &str) -> usize {
        let mut state = lock(&self.state);
        // A missing dead-letter exchange surfaces on the next publish or get
        let _ = state.expire(self.clock.now());
        state.queues.get(queue).map_or(0, |queue| queue.messages.len())
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        lock(&self.state).exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<u64> {
        let mut state = lock(&self.state);
        state.expire(self.clock.now())?;

        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| BrokerQueue {
                arguments: arguments.clone(),
                messages: Vec::new(),
            });

        Ok(queue.messages.len() as u64)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.exchanges.contains(exchange) {
            return Err(StevedoreError::backend(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        state.bindings.insert((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: AmqpMessage) -> Result<()> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        state.expire(now)?;
        state.route(exchange, routing_key, message, now)
    }

    async fn get(&self, queue: &str) -> Result<Option<AmqpDelivery>> {
        let mut state = lock(&self.state);
        state.expire(self.clock.now())?;

        let broker_queue = match state.queues.get_mut(queue) {
            Some(broker_queue) => broker_queue,
            None => {
                return Err(StevedoreError::backend(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )))
            }
        };

        let max_priority = broker_queue.arguments.max_priority.unwrap_or(0);
        let next = broker_queue
            .messages
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                let a_priority = a.message.priority.min(max_priority);
                let b_priority = b.message.priority.min(max_priority);
                a_priority
                    .cmp(&b_priority)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
            .map(|(index, _)| index);

        let enqueued = match next {
            Some(index) => broker_queue.messages.remove(index),
            None => return Ok(None),
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let message = enqueued.message;
        state.unacked.insert(delivery_tag, message.clone());

        Ok(Some(AmqpDelivery {
            delivery_tag,
            body: message.body,
            job_id: Some(message.job_id),
            attempts: message.attempts,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        match lock(&self.state).unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(StevedoreError::backend(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn purge(&self, queue: &str) -> Result<()> {
        if let Some(queue) = lock(&self.state).queues.get_mut(queue) {
            queue.messages.clear();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cloud queue
// ---------------------------------------------------------------------------

/// Visibility timeout applied to a received message
pub const DEFAULT_VISIBILITY_SECS: i64 = 30;

#[derive(Debug, Clone)]
struct CloudRecord {
    message_id: String,
    body: String,
    md5_of_body: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    receipt_handle: Option<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    queues: HashMap<String, Vec<CloudRecord>>,
    corrupt_next: bool,
}

/// Hosted queue emulation with delays, visibility timeouts and body digests.
#[derive(Debug, Clone)]
pub struct InMemoryCloudQueue {
    clock: MockClock,
    state: Arc<Mutex<CloudState>>,
}

impl InMemoryCloudQueue {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(CloudState::default())),
        }
    }

    /// Make the next receive return a digest that does not match its body
    pub fn corrupt_next_receive(&self) {
        lock(&self.state).corrupt_next = true;
    }

    /// Messages stored for `queue_url`, visible or not
    pub fn stored(&self, queue_url: &str) -> usize {
        lock(&self.state).queues.get(queue_url).map_or(0, Vec::len)
    }
}

fn unknown_handle(receipt_handle: &str) -> StevedoreError {
    StevedoreError::backend(format!(
        "ReceiptHandleIsInvalid - {}",
        receipt_handle
    ))
}

#[async_trait]
impl CloudQueueClient for InMemoryCloudQueue {
    async fn send_message(&self, queue_url: &str, body: &str, delay_secs: u64) -> Result<String> {
        if delay_secs > MAX_DELAY_SECS {
            return Err(StevedoreError::backend(format!(
                "InvalidParameterValue - DelaySeconds {} exceeds {}",
                delay_secs, MAX_DELAY_SECS
            )));
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let delay = ChronoDuration::seconds(i64::try_from(delay_secs).unwrap_or(i64::MAX));

        lock(&self.state)
            .queues
            .entry(queue_url.to_string())
            .or_default()
            .push(CloudRecord {
                message_id: message_id.clone(),
                body: body.to_string(),
                md5_of_body: md5_hex(body),
                visible_at: self.clock.now() + delay,
                receive_count: 0,
                receipt_handle: None,
            });

        Ok(message_id)
    }

    async fn receive_message(&self, queue_url: &str) -> Result<Option<CloudMessage>> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let corrupt = state.corrupt_next;

        let record = match state
            .queues
            .get_mut(queue_url)
            .and_then(|records| records.iter_mut().find(|record| record.visible_at <= now))
        {
            Some(record) => record,
            None => return Ok(None),
        };

        let receipt_handle = uuid::Uuid::new_v4().to_string();
        record.receive_count += 1;
        record.visible_at = now + ChronoDuration::seconds(DEFAULT_VISIBILITY_SECS);
        record.receipt_handle = Some(receipt_handle.clone());

        let mut message = CloudMessage {
            message_id: record.message_id.clone(),
            receipt_handle,
            body: record.body.clone(),
            md5_of_body: record.md5_of_body.clone(),
            receive_count: record.receive_count,
        };

        if corrupt {
            message.md5_of_body = "0".repeat(32);
            state.corrupt_next = false;
        }

        Ok(Some(message))
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_secs: u64,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        let record = state
            .queues
            .get_mut(queue_url)
            .and_then(|records| {
                records
                    .iter_mut()
                    .find(|record| record.receipt_handle.as_deref() == Some(receipt_handle))
            })
            .ok_or_else(|| unknown_handle(receipt_handle))?;

        let timeout = ChronoDuration::seconds(i64::try_from(timeout_secs).unwrap_or(i64::MAX));
        record.visible_at = now + timeout;
        Ok(())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let records = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| unknown_handle(receipt_handle))?;

        let before = records.len();
        records.retain(|record| record.receipt_handle.as_deref() != Some(receipt_handle));

        if records.len() == before {
            return Err(unknown_handle(receipt_handle));
        }
        Ok(())
    }

    async fn purge_queue(&self, queue_url: &str) -> Result<()> {
        if let Some(records) = lock(&self.state).queues.get_mut(queue_url) {
            records.clear();
        }
        Ok(())
    }

    async fn approximate_number_of_messages(&self, queue_url: &str) -> Result<u64> {
        let now = self.clock.now();
        Ok(lock(&self.state)
            .queues
            .get(queue_url)
            .map_or(0, |records| {
                records
                    .iter()
                    .filter(|record| record.visible_at <= now)
                    .count() as u64
            }))
    }
}
