//! An in-process broker that dead-letters the way RabbitMQ does.
//!
//! It keeps just enough broker behavior to exercise the retry loop without a
//! server: direct and fanout exchanges, queue dead-letter arguments, `x-death`
//! bookkeeping (newest entry first, one entry per queue and reason with a
//! growing `count`), prefetch limits, and redelivery of deliveries dropped
//! without being settled.
//!
//! TTLs are not timed. A queue marked with [`InMemoryBroker::expire_on_arrival`]
//! dead-letters every message as `expired` the moment it arrives, and
//! [`InMemoryBroker::expire`] expires whatever is waiting in a queue on demand.

use super::{BrokerGateway, DeliveryHandle, DeliveryStream};
use crate::death::X_DEATH;
use crate::error::WorkerError;
use crate::message::{Delivery, TaskMessage};
use crate::topology::QueueSpec;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use lapin::ExchangeKind;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

// Dead-letter cycles between queues that expire on arrival are cut here.
const MAX_DEAD_LETTER_HOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Direct,
    Fanout,
}

struct ExchangeState {
    kind: RouteKind,
    bindings: Vec<(String, String)>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<TaskMessage>,
    expire_on_arrival: bool,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub delivery_tag: u64,
    pub queue: String,
    pub settlement: Settlement,
}

/// A message as it was handed to `publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Option<FieldTable>,
}

struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
    connected: bool,
    settlements: Vec<SettlementRecord>,
    published: Vec<PublishedMessage>,
    closes: usize,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Cloning yields another handle onto the same broker, much like opening a
/// second channel on a RabbitMQ server.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            "amq.direct".to_string(),
            ExchangeState { kind: RouteKind::Direct, bindings: Vec::new() },
        );
        exchanges.insert(
            "amq.fanout".to_string(),
            ExchangeState { kind: RouteKind::Fanout, bindings: Vec::new() },
        );

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    exchanges,
                    queues: HashMap::new(),
                    next_delivery_tag: 1,
                    connected: true,
                    settlements: Vec::new(),
                    published: Vec::new(),
                    closes: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Treats `queue` as a TTL queue nobody consumes from: every message that
    /// arrives is dead-lettered as `expired` straight away.
    pub fn expire_on_arrival(&self, queue: &str) -> Result<(), WorkerError> {
        let mut state = self.state();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| WorkerError::from(format!("NOT_FOUND - no queue '{}'", queue)))?;
        queue_state.expire_on_arrival = true;
        Ok(())
    }

    /// Expires every message waiting in `queue`. Returns how many were dead-lettered.
    pub fn expire(&self, queue: &str) -> Result<usize, WorkerError> {
        let expired = {
            let mut state = self.state();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| WorkerError::from(format!("NOT_FOUND - no queue '{}'", queue)))?;
            let expired: Vec<TaskMessage> = queue_state.ready.drain(..).collect();
            for message in expired.iter().cloned() {
                dead_letter(&mut state, queue, message, "expired", 0);
            }
            expired.len()
        };
        self.shared.notify.notify_waiters();
        Ok(expired)
    }

    /// Publishes a fully formed message, keeping its headers and message id.
    pub fn inject(&self, exchange: &str, routing_key: &str, message: TaskMessage) -> Result<(), WorkerError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(WorkerError::disconnected("in-memory broker is disconnected"));
            }
            let mut message = message;
            message.exchange = exchange.to_string();
            message.routing_key = routing_key.to_string();
            route(&mut state, exchange, routing_key, message, 0)?;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Drops the connection: open streams yield an error and end, every other
    /// operation fails until [`InMemoryBroker::reconnect`].
    pub fn disconnect(&self) {
        self.state().connected = false;
        self.shared.notify.notify_waiters();
        log::warn!("In-memory broker disconnected");
    }

    pub fn reconnect(&self) {
        self.state().connected = true;
        self.shared.notify.notify_waiters();
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Snapshot of the messages waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<TaskMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    fn pop(&self, queue: &str) -> Result<Option<(u64, TaskMessage)>, WorkerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(WorkerError::disconnected("in-memory broker is disconnected"));
        }
        let Some(message) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };
        let delivery_tag = state.next_delivery_tag;
        state.next_delivery_tag += 1;
        Ok(Some((delivery_tag, message)))
    }

    fn settle(
        &self,
        delivery_tag: u64,
        queue: &str,
        message: TaskMessage,
        settlement: Settlement,
    ) -> Result<(), WorkerError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(WorkerError::disconnected("in-memory broker is disconnected"));
            }
            state.settlements.push(SettlementRecord {
                delivery_tag,
                queue: queue.to_string(),
                settlement,
            });
            if settlement == Settlement::Reject {
                dead_letter(&mut state, queue, message, "rejected", 0);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn requeue(&self, queue: &str, mut message: TaskMessage) {
        message.redelivered = true;
        if let Some(q) = self.state().queues.get_mut(queue) {
            q.ready.push_front(message);
        }
        self.shared.notify.notify_waiters();
    }
}

fn route(
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    message: TaskMessage,
    hops: usize,
) -> Result<(), WorkerError> {
    // The default exchange routes straight to the queue named by the key.
    if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            enqueue(state, routing_key, message, hops);
        }
        return Ok(());
    }

    let exchange_state = state
        .exchanges
        .get(exchange)
        .ok_or_else(|| WorkerError::from(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

    let targets: Vec<String> = exchange_state
        .bindings
        .iter()
        .filter(|(_, key)| exchange_state.kind == RouteKind::Fanout || key == routing_key)
        .map(|(queue, _)| queue.clone())
        .collect();

    if targets.is_empty() {
        log::debug!("Unroutable message dropped: exchange '{}', routing key '{}'", exchange, routing_key);
    }
    for queue in targets {
        enqueue(state, &queue, message.clone(), hops);
    }
    Ok(())
}

fn enqueue(state: &mut State, queue: &str, message: TaskMessage, hops: usize) {
    let Some(queue_state) = state.queues.get_mut(queue) else {
        return;
    };
    if queue_state.expire_on_arrival {
        dead_letter(state, queue, message, "expired", hops);
    } else {
        queue_state.ready.push_back(message);
    }
}

fn dead_letter(state: &mut State, queue: &str, mut message: TaskMessage, reason: &str, hops: usize) {
    if hops >= MAX_DEAD_LETTER_HOPS {
        log::warn!("Dead-letter cycle through '{}' detected, dropping message", queue);
        return;
    }

    let Some(spec) = state.queues.get(queue).map(|q| q.spec.clone()) else {
        return;
    };
    let Some(dlx) = spec.dead_letter_exchange else {
        log::debug!("Message {} from '{}' dropped, queue has no dead-letter exchange", reason, queue);
        return;
    };

    record_death(&mut message, queue, reason);

    let routing_key = spec
        .dead_letter_routing_key
        .unwrap_or_else(|| message.routing_key.clone());
    message.exchange = dlx.clone();
    message.routing_key = routing_key.clone();
    message.redelivered = false;

    if let Err(e) = route(state, &dlx, &routing_key, message, hops + 1) {
        log::warn!("Dead-lettering out of '{}' failed: {}", queue, e);
    }
}

fn long_string_eq(value: Option<&AMQPValue>, expected: &str) -> bool {
    matches!(value, Some(AMQPValue::LongString(s)) if s.as_bytes() == expected.as_bytes())
}

/// Adds a death to `x-death`: an existing entry for the same queue and reason
/// gets its count bumped and moves to the front, otherwise a new entry is prepended.
fn record_death(message: &mut TaskMessage, queue: &str, reason: &str) {
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    let exchange = message.exchange.clone();
    let routing_key = message.routing_key.clone();
    let headers = message.headers.get_or_insert_with(FieldTable::default);

    let mut entries: Vec<AMQPValue> = match headers.inner().get(X_DEATH) {
        Some(AMQPValue::FieldArray(entries)) => entries.as_slice().to_vec(),
        _ => Vec::new(),
    };

    let existing = entries.iter().position(|entry| match entry {
        AMQPValue::FieldTable(table) => {
            long_string_eq(table.inner().get("queue"), queue) && long_string_eq(table.inner().get("reason"), reason)
        }
        _ => false,
    });

    let entry = match existing.map(|i| entries.remove(i)) {
        Some(AMQPValue::FieldTable(mut table)) => {
            let count = match table.inner().get("count") {
                Some(AMQPValue::LongLongInt(count)) => *count,
                _ => 0,
            };
            table.insert("count".into(), AMQPValue::LongLongInt(count + 1));
            table.insert("time".into(), AMQPValue::Timestamp(now));
            table
        }
        _ => {
            let mut table = FieldTable::default();
            table.insert("count".into(), AMQPValue::LongLongInt(1));
            table.insert("reason".into(), AMQPValue::LongString(reason.into()));
            table.insert("queue".into(), AMQPValue::LongString(queue.into()));
            table.insert("exchange".into(), AMQPValue::LongString(exchange.as_str().into()));
            table.insert(
                "routing-keys".into(),
                AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(routing_key.as_str().into())])),
            );
            table.insert("time".into(), AMQPValue::Timestamp(now));
            table
        }
    };
    entries.insert(0, AMQPValue::FieldTable(entry));
    headers.insert(X_DEATH.into(), AMQPValue::FieldArray(FieldArray::from(entries)));

    if !headers.inner().contains_key("x-first-death-reason") {
        headers.insert("x-first-death-reason".into(), AMQPValue::LongString(reason.into()));
        headers.insert("x-first-death-queue".into(), AMQPValue::LongString(queue.into()));
        headers.insert("x-first-death-exchange".into(), AMQPValue::LongString(exchange.as_str().into()));
    }
}

/// A delivery from [`InMemoryBroker`]. Dropping it unsettled puts the message
/// back at the head of its queue, flagged as redelivered.
pub struct MemoryDeliveryHandle {
    broker: InMemoryBroker,
    queue: String,
    delivery_tag: u64,
    message: Option<TaskMessage>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryDeliveryHandle {
    fn settle(&mut self, settlement: Settlement) -> Result<(), WorkerError> {
        let Some(message) = self.message.take() else {
            return Ok(());
        };
        if let Err(e) = self.broker.settle(self.delivery_tag, &self.queue, message.clone(), settlement) {
            // Left unsettled, so Drop hands it back to the queue.
            self.message = Some(message);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandle for MemoryDeliveryHandle {
    async fn ack(mut self) -> Result<(), WorkerError> {
        self.settle(Settlement::Ack)
    }

    async fn reject(mut self) -> Result<(), WorkerError> {
        self.settle(Settlement::Reject)
    }
}

impl Drop for MemoryDeliveryHandle {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            log::debug!("Delivery {} dropped unsettled, requeueing on '{}'", self.delivery_tag, self.queue);
            self.broker.requeue(&self.queue, message);
        }
    }
}

struct ConsumeState {
    broker: InMemoryBroker,
    queue: String,
    permits: Arc<Semaphore>,
    finished: bool,
}

async fn next_delivery(
    mut consume: ConsumeState,
) -> Option<(Result<Delivery<MemoryDeliveryHandle>, WorkerError>, ConsumeState)> {
    if consume.finished {
        return None;
    }

    // Blocks while `prefetch` deliveries are still unsettled.
    let permit = consume.permits.clone().acquire_owned().await.ok()?;
    let shared = consume.broker.shared.clone();

    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match consume.broker.pop(&consume.queue) {
            Ok(Some((delivery_tag, message))) => {
                let delivery = Delivery {
                    delivery_tag,
                    message: message.clone(),
                    handle: MemoryDeliveryHandle {
                        broker: consume.broker.clone(),
                        queue: consume.queue.clone(),
                        delivery_tag,
                        message: Some(message),
                        _permit: permit,
                    },
                };
                return Some((Ok(delivery), consume));
            }
            Ok(None) => notified.await,
            Err(e) => {
                consume.finished = true;
                return Some((Err(e), consume));
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    type Handle = MemoryDeliveryHandle;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), WorkerError> {
        let kind = match kind {
            ExchangeKind::Direct => RouteKind::Direct,
            ExchangeKind::Fanout => RouteKind::Fanout,
            other => {
                return Err(WorkerError::from(format!(
                    "exchange kind {:?} is not supported by the in-memory broker",
                    other
                )))
            }
        };

        let mut state = self.state();
        if !state.connected {
            return Err(WorkerError::disconnected("in-memory broker is disconnected"));
        }
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(WorkerError::from(format!(
                "PRECONDITION_FAILED - exchange '{}' redeclared with a different type",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeState { kind, bindings: Vec::new() });
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), WorkerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(WorkerError::disconnected("in-memory broker is disconnected"));
        }
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(WorkerError::from(format!(
                "PRECONDITION_FAILED - queue '{}' redeclared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        expire_on_arrival: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: Option<&str>) -> Result<(), WorkerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(WorkerError::disconnected("in-memory broker is disconnected"));
        }
        if !state.queues.contains_key(queue) {
            return Err(WorkerError::from(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| WorkerError::from(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), routing_key.unwrap_or(queue).to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Handle>, WorkerError> {
        {
            let state = self.state();
            if !state.connected {
                return Err(WorkerError::disconnected("in-memory broker is disconnected"));
            }
            if !state.queues.contains_key(queue) {
                return Err(WorkerError::from(format!("NOT_FOUND - no queue '{}'", queue)));
            }
        }

        // AMQP treats a prefetch of zero as "no limit".
        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        log::debug!("Consumer '{}' attached to '{}' with prefetch {}", consumer_tag, queue, prefetch);

        let consume = ConsumeState {
            broker: self.clone(),
            queue: queue.to_string(),
            permits: Arc::new(Semaphore::new(permits)),
            finished: false,
        };
        Ok(futures_util::stream::unfold(consume, next_delivery).boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<(), WorkerError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(WorkerError::disconnected("in-memory broker is disconnected"));
            }
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                headers: headers.clone(),
            });

            let message = TaskMessage {
                payload: payload.to_vec(),
                headers,
                message_id: None,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            };
            route(&mut state, exchange, routing_key, message, 0)?;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.state().closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::death::{DeathHistory, DeathReason};
    use std::time::Duration;

    async fn loop_broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("work", ExchangeKind::Direct).await.unwrap();
        broker.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue(&QueueSpec::new("tasks").dead_letter("dlx", "retry"))
            .await
            .unwrap();
        broker
            .declare_queue(
                &QueueSpec::new("parking")
                    .message_ttl(Duration::from_secs(1))
                    .dead_letter("work", "tasks"),
            )
            .await
            .unwrap();
        broker.bind_queue("tasks", "work", None).await.unwrap();
        broker.bind_queue("parking", "dlx", Some("retry")).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_reject_dead_letters_and_expiry_routes_back() {
        let broker = loop_broker().await;
        broker.publish("work", "tasks", b"job", None).await.unwrap();

        let mut stream = broker.consume("tasks", "t", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(delivery.message.headers.is_none());
        delivery.handle.reject().await.unwrap();

        assert_eq!(broker.queue_depth("tasks"), 0);
        assert_eq!(broker.queue_depth("parking"), 1);
        assert_eq!(broker.expire("parking").unwrap(), 1);

        let delivery = stream.next().await.unwrap().unwrap();
        let history = delivery.message.death_history().unwrap().unwrap();
        let reasons: Vec<_> = history.records().iter().map(|r| r.reason.clone()).collect();
        assert_eq!(reasons, vec![DeathReason::Rejected, DeathReason::Expired]);
        assert_eq!(history.death_count(Some("tasks")), 1);
        assert_eq!(delivery.message.exchange, "work");
        delivery.handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_deaths_collapse_into_counts() {
        let broker = loop_broker().await;
        broker.expire_on_arrival("parking").unwrap();
        broker.publish("work", "tasks", b"job", None).await.unwrap();

        let mut stream = broker.consume("tasks", "t", 1).await.unwrap();
        for _ in 0..3 {
            let delivery = stream.next().await.unwrap().unwrap();
            delivery.handle.reject().await.unwrap();
        }

        let message = &broker.messages("tasks")[0];
        let history = DeathHistory::from_headers(message.headers.as_ref().unwrap()).unwrap().unwrap();
        assert_eq!(history.records().len(), 2);
        assert_eq!(history.death_count(Some("tasks")), 3);
        assert_eq!(history.death_count(Some("parking")), 3);
        assert_eq!(history.latest().unwrap().reason, DeathReason::Expired);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_is_redelivered() {
        let broker = loop_broker().await;
        broker.publish("work", "tasks", b"job", None).await.unwrap();

        let mut stream = broker.consume("tasks", "t", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        drop(delivery);

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.message.redelivered);
        assert_eq!(again.message.payload, b"job".to_vec());
        again.handle.ack().await.unwrap();
        assert_eq!(broker.settlements().len(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_second_delivery() {
        let broker = loop_broker().await;
        broker.publish("work", "tasks", b"one", None).await.unwrap();
        broker.publish("work", "tasks", b"two", None).await.unwrap();

        let mut stream = broker.consume("tasks", "t", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        first.handle.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message.payload, b"two".to_vec());
        second.handle.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_with_error() {
        let broker = loop_broker().await;
        let mut stream = broker.consume("tasks", "t", 1).await.unwrap();
        broker.disconnect();

        let err = stream.next().await.unwrap().err().unwrap();
        assert!(err.is_connectivity_failure());
        assert!(stream.next().await.is_none());
        assert!(broker.publish("work", "tasks", b"job", None).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_redeclare_with_other_arguments_fails() {
        let broker = loop_broker().await;
        let err = broker.declare_queue(&QueueSpec::new("tasks")).await.unwrap_err();
        assert!(!err.is_connectivity_failure());
        assert!(broker
            .declare_queue(&QueueSpec::new("tasks").dead_letter("dlx", "retry"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = loop_broker().await;
        broker.publish("", "tasks", b"direct", None).await.unwrap();
        broker.publish("", "missing", b"lost", None).await.unwrap();
        assert_eq!(broker.queue_depth("tasks"), 1);
        assert_eq!(broker.published().len(), 2);
    }
}
