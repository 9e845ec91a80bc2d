//! The task consumer and its configuration.

use crate::death::{DeathHistoryInspector, Exhaustion, Verdict};
use crate::error::WorkerError;
use crate::gateway::{BrokerGateway, DeliveryHandle};
use crate::handler::Task;
use crate::message::{Delivery, TaskMessage};
use crate::retry::RetryPolicy;
use crate::supervisor::Shutdown;
use crate::topology::RetryTopology;
use futures_util::{FutureExt, StreamExt};
use lapin::types::AMQPValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Header set on quarantined copies, saying why the consumer gave up.
pub const X_DLQ_REASON: &str = "x-dlq-reason";
pub const X_DLQ_DETAIL: &str = "x-dlq-detail";

/// Configuration for a `TaskConsumer`.
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Exchange, queue and routing-key names of the retry loop.
    pub topology: RetryTopology,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// How many dead-letter round-trips a message gets before it is given up on.
    pub retry_policy: RetryPolicy,
    /// The number of unacknowledged deliveries the broker may hand out at a time.
    pub prefetch_count: u16,
    /// Whether messages that exhausted their retries are copied to the quarantine queue before the terminal ack.
    pub quarantine_exhausted: bool,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the primary queue to consume from.
    pub fn builder(queue_name: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into())
    }

    pub fn queue_name(&self) -> &str {
        &self.topology.primary_queue
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    exchange_name: Option<String>,
    routing_key: Option<String>,
    consumer_tag: Option<String>,
    retry_policy: Option<RetryPolicy>,
    retry_delay: Option<Duration>,
    prefetch_count: Option<u16>,
    quarantine_exhausted: Option<bool>,
}

impl WorkerConfigBuilder {
    fn new(queue_name: String) -> Self {
        Self {
            queue_name,
            exchange_name: None,
            routing_key: None,
            consumer_tag: None,
            retry_policy: None,
            retry_delay: None,
            prefetch_count: None,
            quarantine_exhausted: None,
        }
    }

    /// Sets a custom work exchange name.
    /// Defaults to `{queue_name}_exchange` if not set.
    pub fn exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    /// Sets a custom routing key.
    /// Defaults to `{queue_name}.process` if not set.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets a custom retry policy.
    /// Defaults to `RetryPolicy::default()`.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn max_retries(self, max_retries: u32) -> Self {
        self.retry_policy(RetryPolicy::new(max_retries))
    }

    /// Sets how long a rejected message waits in the retry queue.
    /// Defaults to one second.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Defaults to `true`.
    pub fn quarantine_exhausted(mut self, enabled: bool) -> Self {
        self.quarantine_exhausted = Some(enabled);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> Result<WorkerConfig, WorkerError> {
        if self.queue_name.is_empty() {
            return Err("queue name must not be empty".into());
        }
        let prefetch_count = self.prefetch_count.unwrap_or(1);
        if prefetch_count == 0 {
            return Err("prefetch count must be at least 1".into());
        }

        let mut topology =
            RetryTopology::for_queue(&self.queue_name, self.retry_delay.unwrap_or(Duration::from_secs(1)));
        if let Some(exchange_name) = self.exchange_name {
            topology.work_exchange = exchange_name;
        }
        if let Some(routing_key) = self.routing_key {
            topology.primary_routing_key = routing_key;
        }

        Ok(WorkerConfig {
            consumer_tag: self
                .consumer_tag
                .unwrap_or_else(|| format!("{}_consumer", self.queue_name)),
            retry_policy: self.retry_policy.unwrap_or_default(),
            prefetch_count,
            quarantine_exhausted: self.quarantine_exhausted.unwrap_or(true),
            topology,
        })
    }
}

/// How a single delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The task succeeded and the message is gone.
    Acked,
    /// The task failed and the message went back around the dead-letter loop.
    Rejected { retry_count: u32 },
    /// The task failed and the message will not be retried again.
    TerminallyAcked { cause: Exhaustion, quarantined: bool },
}

/// Counters for one consumer session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub terminally_acked: u64,
    pub quarantined: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &Outcome) {
        self.received += 1;
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Rejected { .. } => self.rejected += 1,
            Outcome::TerminallyAcked { quarantined, .. } => {
                self.terminally_acked += 1;
                if *quarantined {
                    self.quarantined += 1;
                }
            }
        }
    }
}

/// Consumes the primary queue, runs the task on every delivery and settles it.
///
/// Deliveries are processed one at a time. Retries are never run in-process:
/// a failed delivery is rejected and comes back as a new delivery once the
/// broker has routed it through the retry queue.
pub struct TaskConsumer<G: BrokerGateway, T: Task + ?Sized> {
    gateway: G,
    task: Arc<T>,
    config: WorkerConfig,
    inspector: DeathHistoryInspector,
}

impl<G: BrokerGateway, T: Task + ?Sized> TaskConsumer<G, T> {
    /// Creates a new consumer that owns `gateway` for its whole lifetime.
    pub fn new(gateway: G, task: Arc<T>, config: WorkerConfig) -> Self {
        let inspector = DeathHistoryInspector::for_queue(config.retry_policy, config.queue_name());
        Self {
            gateway,
            task,
            config,
            inspector,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Declares the primary, retry and quarantine queues and their exchanges.
    pub async fn declare_topology(&self) -> Result<(), WorkerError> {
        self.config.topology.declare(&self.gateway).await
    }

    /// Consumes until shutdown is requested or the broker session fails.
    ///
    /// Shutdown is only checked between deliveries: the delivery being processed
    /// is finished and settled, then the gateway is closed. A broker failure
    /// ends the session with an error that
    /// [`WorkerError::is_connectivity_failure`] classifies for reconnecting.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<ConsumerStats, WorkerError> {
        log::info!(
            "Starting task '{}' on queue '{}' (max retries {}, prefetch {})",
            self.task.name(),
            self.config.queue_name(),
            self.config.retry_policy.max_retries,
            self.config.prefetch_count
        );

        let mut deliveries = self
            .gateway
            .consume(self.config.queue_name(), &self.config.consumer_tag, self.config.prefetch_count)
            .await?;
        let mut stats = ConsumerStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.requested() => {
                    log::info!("Shutdown requested, stopping consumer '{}'", self.config.consumer_tag);
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let outcome = self.process(delivery).await?;
                    stats.record(&outcome);
                }
                Some(Err(e)) => {
                    log::error!("Delivery stream on '{}' failed: {}", self.config.queue_name(), e);
                    return Err(e);
                }
                None => {
                    return Err(WorkerError::disconnected(format!(
                        "delivery stream on '{}' ended",
                        self.config.queue_name()
                    )));
                }
            }
        }

        drop(deliveries);
        self.gateway.close().await?;
        log::info!("Consumer '{}' stopped: {:?}", self.config.consumer_tag, stats);
        Ok(stats)
    }

    /// Runs the task for one delivery and settles it exactly once.
    ///
    /// An `Err` here means the broker could not be reached to settle the
    /// delivery. The handle is then dropped unsettled and the broker redelivers
    /// the message on a later session.
    pub async fn process(&self, delivery: Delivery<G::Handle>) -> Result<Outcome, WorkerError> {
        let Delivery {
            delivery_tag,
            message,
            handle,
        } = delivery;

        log::debug!(
            "Received delivery {} of {} (redelivered: {})",
            delivery_tag,
            message.identity(),
            message.redelivered
        );

        let failure = match self.execute(&message).await {
            Ok(()) => {
                handle.ack().await?;
                log::info!("Message processed successfully. Tag: {}", delivery_tag);
                return Ok(Outcome::Acked);
            }
            Err(failure) => failure,
        };

        log::warn!(
            "Task '{}' failed. Tag: {}, Error: {}",
            self.task.name(),
            delivery_tag,
            failure
        );

        match self.inspector.inspect(message.headers.as_ref()) {
            Verdict::RetryEligible { retry_count } => {
                handle.reject().await?;
                log::info!(
                    "Message {} rejected for retry {} of {}. Tag: {}",
                    message.identity(),
                    retry_count + 1,
                    self.config.retry_policy.max_retries,
                    delivery_tag
                );
                Ok(Outcome::Rejected { retry_count })
            }
            Verdict::RetriesExhausted(cause) => {
                let quarantined = if self.config.quarantine_exhausted {
                    self.quarantine(&message, &cause).await?;
                    true
                } else {
                    false
                };
                handle.ack().await?;
                log::error!(
                    "Giving up on message {}: {}. Death history: {}. Quarantined: {}. Tag: {}",
                    message.identity(),
                    cause,
                    message.describe_death_history(),
                    quarantined,
                    delivery_tag
                );
                Ok(Outcome::TerminallyAcked { cause, quarantined })
            }
        }
    }

    /// Runs the task body, turning both errors and panics into a failure description.
    async fn execute(&self, message: &TaskMessage) -> Result<(), String> {
        match AssertUnwindSafe(self.task.execute(message)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("task panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Publishes a copy of an exhausted message to the quarantine queue.
    async fn quarantine(&self, message: &TaskMessage, cause: &Exhaustion) -> Result<(), WorkerError> {
        let reason = match cause {
            Exhaustion::ThresholdReached { .. } => "max-retries-exceeded",
            Exhaustion::Malformed(_) => "malformed-death-history",
        };

        let mut headers = message.headers.clone().unwrap_or_default();
        headers.insert(X_DLQ_REASON.into(), AMQPValue::LongString(reason.into()));
        headers.insert(X_DLQ_DETAIL.into(), AMQPValue::LongString(cause.to_string().into()));

        let topology = &self.config.topology;
        self.gateway
            .publish(
                &topology.dead_letter_exchange,
                &topology.quarantine_routing_key,
                &message.payload,
                Some(headers),
            )
            .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::death::tests::{death_entry, headers_with_deaths};
    use crate::death::MalformedDeathHistory;
    use crate::gateway::memory::Settlement;
    use crate::gateway::{DeliveryStream, InMemoryBroker, MemoryDeliveryHandle};
    use crate::death::X_RETRY_COUNT;
    use crate::supervisor::shutdown_channel;
    use async_trait::async_trait;
    use lapin::types::FieldTable;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Fails its first `failures` executions, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn always_failing() -> Arc<Self> {
            Self::new(u32::MAX)
        }
    }

    #[async_trait]
    impl Task for Flaky {
        async fn execute(&self, _message: &TaskMessage) -> Result<(), WorkerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(WorkerError::from(format!("attempt {} failed", call + 1)));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct Panicking;

    #[async_trait]
    impl Task for Panicking {
        async fn execute(&self, _message: &TaskMessage) -> Result<(), WorkerError> {
            panic!("boom");
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    async fn retry_loop(max_retries: u32, quarantine: bool) -> (InMemoryBroker, WorkerConfig) {
        let broker = InMemoryBroker::new();
        let config = WorkerConfig::builder("tasks")
            .max_retries(max_retries)
            .quarantine_exhausted(quarantine)
            .build()
            .unwrap();
        config.topology.declare(&broker).await.unwrap();
        broker.expire_on_arrival(&config.topology.retry_queue).unwrap();
        (broker, config)
    }

    async fn publish_job(broker: &InMemoryBroker, config: &WorkerConfig) {
        broker
            .publish(&config.topology.work_exchange, &config.topology.primary_routing_key, b"job", None)
            .await
            .unwrap();
    }

    async fn consume(broker: &InMemoryBroker, config: &WorkerConfig) -> DeliveryStream<MemoryDeliveryHandle> {
        broker.consume(config.queue_name(), "test", 1).await.unwrap()
    }

    /// Processes deliveries until one is not rejected.
    async fn drive<T: Task + ?Sized>(
        consumer: &TaskConsumer<InMemoryBroker, T>,
        stream: &mut DeliveryStream<MemoryDeliveryHandle>,
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        loop {
            let delivery = stream.next().await.unwrap().unwrap();
            let outcome = consumer.process(delivery).await.unwrap();
            let done = !matches!(outcome, Outcome::Rejected { .. });
            outcomes.push(outcome);
            if done {
                return outcomes;
            }
        }
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        let config = WorkerConfig::builder("test_queue").build().unwrap();

        assert_eq!(config.queue_name(), "test_queue");
        assert_eq!(config.topology.work_exchange, "test_queue_exchange");
        assert_eq!(config.topology.primary_routing_key, "test_queue.process");
        assert_eq!(config.topology.retry_delay, Duration::from_secs(1));
        assert_eq!(config.consumer_tag, "test_queue_consumer");
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert!(config.quarantine_exhausted);
    }

    #[test]
    fn test_worker_config_builder_custom_values() {
        let config = WorkerConfig::builder("test_queue")
            .exchange_name("custom_exchange")
            .routing_key("custom.key")
            .consumer_tag("custom_consumer")
            .prefetch_count(10)
            .retry_delay(Duration::from_millis(250))
            .retry_policy(RetryPolicy::new(7))
            .quarantine_exhausted(false)
            .build()
            .unwrap();

        assert_eq!(config.topology.work_exchange, "custom_exchange");
        assert_eq!(config.topology.primary_routing_key, "custom.key");
        assert_eq!(config.topology.retry_spec().dead_letter_routing_key.as_deref(), Some("custom.key"));
        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.topology.retry_delay, Duration::from_millis(250));
        assert_eq!(config.retry_policy.max_retries, 7);
        assert!(!config.quarantine_exhausted);
    }

    #[test]
    fn test_worker_config_rejects_invalid_values() {
        assert!(WorkerConfig::builder("q").prefetch_count(0).build().is_err());
        assert!(WorkerConfig::builder("").build().is_err());
        assert!(WorkerConfig::builder("q").max_retries(0).build().is_ok());
    }

    #[tokio::test]
    async fn test_always_failing_task_is_given_up_after_fourth_delivery() {
        let (broker, config) = retry_loop(3, true).await;
        publish_job(&broker, &config).await;

        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let outcomes = drive(&consumer, &mut stream).await;

        assert_eq!(
            outcomes,
            vec![
                Outcome::Rejected { retry_count: 0 },
                Outcome::Rejected { retry_count: 1 },
                Outcome::Rejected { retry_count: 2 },
                Outcome::TerminallyAcked {
                    cause: Exhaustion::ThresholdReached { retry_count: 3 },
                    quarantined: true,
                },
            ]
        );

        let settlements: Vec<_> = broker.settlements().iter().map(|s| s.settlement).collect();
        assert_eq!(
            settlements,
            vec![Settlement::Reject, Settlement::Reject, Settlement::Reject, Settlement::Ack]
        );
        assert_eq!(broker.queue_depth(config.queue_name()), 0);
        assert_eq!(broker.queue_depth(&config.topology.retry_queue), 0);

        let quarantined = broker.messages(&config.topology.quarantine_queue);
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].payload, b"job".to_vec());
        let headers = quarantined[0].headers.as_ref().unwrap();
        assert_eq!(
            headers.inner().get(X_DLQ_REASON),
            Some(&AMQPValue::LongString("max-retries-exceeded".into()))
        );
        let history = quarantined[0].death_history().unwrap().unwrap();
        assert_eq!(history.death_count(Some(config.queue_name())), 3);
    }

    #[tokio::test]
    async fn test_task_succeeding_on_second_delivery_is_acked() {
        let (broker, config) = retry_loop(5, true).await;
        publish_job(&broker, &config).await;

        let task = Flaky::new(1);
        let consumer = TaskConsumer::new(broker.clone(), task.clone(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let outcomes = drive(&consumer, &mut stream).await;

        assert_eq!(outcomes, vec![Outcome::Rejected { retry_count: 0 }, Outcome::Acked]);
        assert_eq!(task.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.settlements().len(), 2);
        assert_eq!(broker.queue_depth(&config.topology.quarantine_queue), 0);
    }

    #[tokio::test]
    async fn test_malformed_history_is_given_up_immediately() {
        let (broker, config) = retry_loop(10, true).await;

        let mut broken = FieldTable::default();
        broken.insert("reason".into(), AMQPValue::LongString("rejected".into()));
        broken.insert("queue".into(), AMQPValue::LongString("tasks".into()));
        let message = TaskMessage::new(b"job".to_vec())
            .with_headers(headers_with_deaths(vec![AMQPValue::FieldTable(broken)]))
            .with_message_id("job-1");
        broker
            .inject(&config.topology.work_exchange, &config.topology.primary_routing_key, message)
            .unwrap();

        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let outcomes = drive(&consumer, &mut stream).await;

        assert_eq!(
            outcomes,
            vec![Outcome::TerminallyAcked {
                cause: Exhaustion::Malformed(MalformedDeathHistory::MissingField { index: 0, field: "count" }),
                quarantined: true,
            }]
        );
        let quarantined = broker.messages(&config.topology.quarantine_queue);
        assert_eq!(
            quarantined[0].headers.as_ref().unwrap().inner().get(X_DLQ_REASON),
            Some(&AMQPValue::LongString("malformed-death-history".into()))
        );
    }

    #[tokio::test]
    async fn test_retry_count_grows_by_one_per_round_trip() {
        let (broker, config) = retry_loop(4, false).await;
        publish_job(&broker, &config).await;

        let inspector = DeathHistoryInspector::for_queue(config.retry_policy, config.queue_name());
        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;

        for expected in 0..4u32 {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(inspector.retry_count(delivery.message.headers.as_ref()), Ok(expected));
            consumer.process(delivery).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stale_retry_counter_still_terminates() {
        let (broker, config) = retry_loop(3, true).await;
        let mut headers = FieldTable::default();
        headers.insert(X_RETRY_COUNT.into(), AMQPValue::LongLongInt(0));
        broker
            .inject(
                &config.topology.work_exchange,
                &config.topology.primary_routing_key,
                TaskMessage::new(b"job".to_vec()).with_headers(headers),
            )
            .unwrap();

        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let outcomes = drive(&consumer, &mut stream).await;

        assert!(outcomes.len() <= config.retry_policy.max_retries as usize + 1);
        assert_eq!(
            outcomes,
            vec![
                Outcome::Rejected { retry_count: 0 },
                Outcome::TerminallyAcked {
                    cause: Exhaustion::Malformed(MalformedDeathHistory::CounterBehindHistory {
                        counter: 0,
                        deaths: 1,
                    }),
                    quarantined: true,
                },
            ]
        );
        assert_eq!(broker.queue_depth(config.queue_name()), 0);
        assert_eq!(broker.messages(&config.topology.quarantine_queue).len(), 1);
    }

    #[tokio::test]
    async fn test_prior_deaths_elsewhere_do_not_count() {
        let (broker, config) = retry_loop(2, false).await;
        let message = TaskMessage::new(b"job".to_vec())
            .with_headers(headers_with_deaths(vec![death_entry("expired", "legacy_queue", 9)]));
        broker
            .inject(&config.topology.work_exchange, &config.topology.primary_routing_key, message)
            .unwrap();

        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(
            consumer.process(delivery).await.unwrap(),
            Outcome::Rejected { retry_count: 0 }
        );
    }

    #[tokio::test]
    async fn test_exhausted_without_quarantine_publishes_nothing() {
        let (broker, config) = retry_loop(0, false).await;
        publish_job(&broker, &config).await;

        let consumer = TaskConsumer::new(broker.clone(), Flaky::always_failing(), config.clone());
        let mut stream = consume(&broker, &config).await;
        let outcomes = drive(&consumer, &mut stream).await;

        assert_eq!(
            outcomes,
            vec![Outcome::TerminallyAcked {
                cause: Exhaustion::ThresholdReached { retry_count: 0 },
                quarantined: false,
            }]
        );
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.queue_depth(&config.topology.quarantine_queue), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_counts_as_failure() {
        let (broker, config) = retry_loop(3, true).await;
        publish_job(&broker, &config).await;

        let task: Arc<dyn Task> = Arc::new(Panicking);
        let consumer = TaskConsumer::new(broker.clone(), task, config.clone());
        let mut stream = consume(&broker, &config).await;
        let delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(
            consumer.process(delivery).await.unwrap(),
            Outcome::Rejected { retry_count: 0 }
        );
        assert_eq!(broker.settlements()[0].settlement, Settlement::Reject);
    }

    #[tokio::test]
    async fn test_every_delivery_is_settled_exactly_once() {
        let (broker, config) = retry_loop(2, true).await;
        for _ in 0..5 {
            publish_job(&broker, &config).await;
        }

        let consumer = TaskConsumer::new(broker.clone(), Flaky::new(4), config.clone());
        let mut stream = consume(&broker, &config).await;
        let mut deliveries = 0;
        while broker.queue_depth(config.queue_name()) > 0 {
            let delivery = stream.next().await.unwrap().unwrap();
            consumer.process(delivery).await.unwrap();
            deliveries += 1;
        }

        let mut tags: Vec<u64> = broker.settlements().iter().map(|s| s.delivery_tag).collect();
        assert_eq!(tags.len(), deliveries);
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), deliveries);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_closes_gateway() {
        let (broker, config) = retry_loop(3, true).await;
        publish_job(&broker, &config).await;
        publish_job(&broker, &config).await;

        let consumer = TaskConsumer::new(broker.clone(), Flaky::new(1), config.clone());
        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.settlements().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        trigger.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(
            stats,
            ConsumerStats {
                received: 3,
                acked: 2,
                rejected: 1,
                terminally_acked: 0,
                quarantined: 0,
            }
        );
        assert_eq!(broker.close_count(), 1);
    }

    struct Gated {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Task for Gated {
        async fn execute(&self, _message: &TaskMessage) -> Result<(), WorkerError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_shutdown_finishes_in_flight_delivery_only() {
        let (broker, config) = retry_loop(3, true).await;
        publish_job(&broker, &config).await;
        publish_job(&broker, &config).await;

        let task = Arc::new(Gated {
            started: Notify::new(),
            release: Notify::new(),
        });
        let consumer = TaskConsumer::new(broker.clone(), task.clone(), config.clone());
        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        task.started.notified().await;
        trigger.trigger();
        assert!(broker.settlements().is_empty());
        task.release.notify_one();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.settlements().len(), 1);
        assert_eq!(broker.queue_depth(config.queue_name()), 1);
    }

    #[tokio::test]
    async fn test_run_fails_with_connectivity_error_on_disconnect() {
        let (broker, config) = retry_loop(3, true).await;
        let consumer = TaskConsumer::new(broker.clone(), Flaky::new(0), config.clone());
        let (_trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.disconnect();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_connectivity_failure());
        assert_eq!(broker.close_count(), 0);
    }
}
