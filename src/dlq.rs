//! Dead Letter Queue (DLQ) observation.
//!
//! The observer drains the quarantine queue that the task consumer copies
//! exhausted messages into. It only reports: every delivery is logged and
//! acknowledged, nothing is ever republished.

use crate::death::{DeathHistory, DeathReason, MalformedDeathHistory};
use crate::error::WorkerError;
use crate::gateway::{BrokerGateway, DeliveryHandle};
use crate::message::{Delivery, TaskMessage};
use crate::supervisor::Shutdown;
use crate::topology::RetryTopology;
use crate::worker::X_DLQ_REASON;
use futures_util::StreamExt;
use lapin::types::AMQPValue;

/// Configuration for a `DeadLetterObserver`.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub queue_name: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
}

impl ObserverConfig {
    pub fn builder(queue_name: impl Into<String>) -> ObserverConfigBuilder {
        ObserverConfigBuilder {
            queue_name: queue_name.into(),
            consumer_tag: None,
            prefetch_count: None,
        }
    }

    /// Observes the quarantine queue of `topology`.
    pub fn for_topology(topology: &RetryTopology) -> ObserverConfigBuilder {
        Self::builder(topology.quarantine_queue.clone())
    }
}

pub struct ObserverConfigBuilder {
    queue_name: String,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
}

impl ObserverConfigBuilder {
    /// Defaults to `{queue_name}_observer`.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Defaults to 10.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    pub fn build(self) -> Result<ObserverConfig, WorkerError> {
        if self.queue_name.is_empty() {
            return Err("queue name must not be empty".into());
        }
        let prefetch_count = self.prefetch_count.unwrap_or(10);
        if prefetch_count == 0 {
            return Err("prefetch count must be at least 1".into());
        }

        Ok(ObserverConfig {
            consumer_tag: self
                .consumer_tag
                .unwrap_or_else(|| format!("{}_observer", self.queue_name)),
            queue_name: self.queue_name,
            prefetch_count,
        })
    }
}

/// What the observer learned about one quarantined message.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineReport {
    pub delivery_tag: u64,
    pub identity: String,
    /// Empty when the history was absent or malformed.
    pub history: DeathHistory,
    pub latest_reason: Option<DeathReason>,
    /// Sum of the per-record counts.
    pub total_deaths: u64,
    /// The `x-dlq-reason` set by the consumer when it quarantined the message.
    pub dlq_reason: Option<String>,
    pub malformed: Option<MalformedDeathHistory>,
}

impl QuarantineReport {
    fn from_message(delivery_tag: u64, message: &TaskMessage) -> Self {
        let (history, malformed) = match message.death_history() {
            Ok(history) => (history.unwrap_or_default(), None),
            Err(e) => (DeathHistory::default(), Some(e)),
        };

        let dlq_reason = message
            .headers
            .as_ref()
            .and_then(|headers| headers.inner().get(X_DLQ_REASON))
            .and_then(|value| match value {
                AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
                AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
                _ => None,
            });

        Self {
            delivery_tag,
            identity: message.identity(),
            latest_reason: history.latest().map(|record| record.reason.clone()),
            total_deaths: history.death_count(None),
            history,
            dlq_reason,
            malformed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub observed: u64,
    pub malformed: u64,
}

/// Logs and acknowledges everything that lands in a quarantine queue.
pub struct DeadLetterObserver<G: BrokerGateway> {
    gateway: G,
    config: ObserverConfig,
}

impl<G: BrokerGateway> DeadLetterObserver<G> {
    pub fn new(gateway: G, config: ObserverConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Consumes until shutdown is requested or the broker session fails.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<ObserverStats, WorkerError> {
        log::info!("Observing dead-lettered messages on '{}'", self.config.queue_name);

        let mut deliveries = self
            .gateway
            .consume(&self.config.queue_name, &self.config.consumer_tag, self.config.prefetch_count)
            .await?;
        let mut stats = ObserverStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let report = self.observe(delivery).await?;
                    stats.observed += 1;
                    if report.malformed.is_some() {
                        stats.malformed += 1;
                    }
                }
                Some(Err(e)) => {
                    log::error!("Delivery stream on '{}' failed: {}", self.config.queue_name, e);
                    return Err(e);
                }
                None => {
                    return Err(WorkerError::disconnected(format!(
                        "delivery stream on '{}' ended",
                        self.config.queue_name
                    )));
                }
            }
        }

        drop(deliveries);
        self.gateway.close().await?;
        log::info!("Observer '{}' stopped: {:?}", self.config.consumer_tag, stats);
        Ok(stats)
    }

    /// Logs one quarantined message and acks it.
    pub async fn observe(&self, delivery: Delivery<G::Handle>) -> Result<QuarantineReport, WorkerError> {
        let Delivery {
            delivery_tag,
            message,
            handle,
        } = delivery;

        let report = QuarantineReport::from_message(delivery_tag, &message);

        match (&report.malformed, &report.latest_reason) {
            (Some(e), _) => log::warn!(
                "Dead-lettered message {} carries a malformed death history: {}",
                report.identity,
                e
            ),
            (None, Some(reason)) => log::info!(
                "Dead-lettered message {}: latest death reason '{}', {} deaths {}",
                report.identity,
                reason,
                report.total_deaths,
                report.history
            ),
            (None, None) => log::info!("Dead-lettered message {} has no death history", report.identity),
        }
        if let Some(reason) = &report.dlq_reason {
            log::info!("Message {} was quarantined for: {}", report.identity, reason);
        }

        handle.ack().await?;
        Ok(report)
    }
}
