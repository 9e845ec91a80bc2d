//! Queue arguments and the exchange/queue layout of the dead-letter retry loop.

use crate::error::WorkerError;
use crate::gateway::BrokerGateway;
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use std::time::Duration;

/// A queue together with its TTL and dead-letter arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    /// The `queue.declare` arguments for this queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ttl) = self.message_ttl {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl_ms));
        }
        if let Some(ref exchange) = self.dead_letter_exchange {
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.as_str().into()));
        }
        if let Some(ref routing_key) = self.dead_letter_routing_key {
            args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(routing_key.as_str().into()));
        }
        args
    }
}

/// Names for the retry loop built around one primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    pub work_exchange: String,
    pub primary_queue: String,
    pub primary_routing_key: String,
    pub dead_letter_exchange: String,
    pub retry_queue: String,
    pub retry_routing_key: String,
    pub retry_delay: Duration,
    pub quarantine_queue: String,
    pub quarantine_routing_key: String,
}

impl RetryTopology {
    /// Derives every name from the primary queue, e.g. `tasks` gets `tasks_dlx`,
    /// `tasks_retry` (bound with `tasks.retry`) and `tasks_dlq` (bound with `tasks.failed`).
    pub fn for_queue(queue_name: &str, retry_delay: Duration) -> Self {
        Self {
            work_exchange: format!("{}_exchange", queue_name),
            primary_queue: queue_name.to_string(),
            primary_routing_key: format!("{}.process", queue_name),
            dead_letter_exchange: format!("{}_dlx", queue_name),
            retry_queue: format!("{}_retry", queue_name),
            retry_routing_key: format!("{}.retry", queue_name),
            retry_delay,
            quarantine_queue: format!("{}_dlq", queue_name),
            quarantine_routing_key: format!("{}.failed", queue_name),
        }
    }

    /// Rejected messages leave through the dead-letter exchange towards the retry queue.
    pub fn primary_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.primary_queue).dead_letter(&self.dead_letter_exchange, &self.retry_routing_key)
    }

    /// Messages sit here until the TTL expires, then go back to the work exchange.
    pub fn retry_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.retry_queue)
            .message_ttl(self.retry_delay)
            .dead_letter(&self.work_exchange, &self.primary_routing_key)
    }

    pub fn quarantine_spec(&self) -> QueueSpec {
        QueueSpec::new(&self.quarantine_queue)
    }

    /// Declares both exchanges and all three queues, and binds them.
    pub async fn declare<G: BrokerGateway>(&self, gateway: &G) -> Result<(), WorkerError> {
        gateway.declare_exchange(&self.work_exchange, ExchangeKind::Direct).await?;
        gateway.declare_exchange(&self.dead_letter_exchange, ExchangeKind::Direct).await?;

        gateway.declare_queue(&self.primary_spec()).await?;
        gateway.declare_queue(&self.retry_spec()).await?;
        gateway.declare_queue(&self.quarantine_spec()).await?;

        gateway
            .bind_queue(&self.primary_queue, &self.work_exchange, Some(&self.primary_routing_key))
            .await?;
        gateway
            .bind_queue(&self.retry_queue, &self.dead_letter_exchange, Some(&self.retry_routing_key))
            .await?;
        gateway
            .bind_queue(&self.quarantine_queue, &self.dead_letter_exchange, Some(&self.quarantine_routing_key))
            .await?;

        log::info!(
            "Retry topology declared: '{}' -> '{}' ({:?} TTL) -> '{}', quarantine '{}'",
            self.primary_queue,
            self.retry_queue,
            self.retry_delay,
            self.primary_queue,
            self.quarantine_queue
        );
        Ok(())
    }
}
