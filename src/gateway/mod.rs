//! The broker operations the consumer and observer rely on.
//!
//! TTL expiry, dead-letter rerouting and appending to `x-death` are the
//! broker's job. The core only reads the resulting headers, so anything that
//! implements [`BrokerGateway`] faithfully can drive it: [`AmqpGateway`] for a
//! real RabbitMQ, [`InMemoryBroker`] for tests and local runs.

mod amqp;
pub mod memory;

pub use amqp::{AmqpDeliveryHandle, AmqpGateway};
pub use memory::{InMemoryBroker, MemoryDeliveryHandle};

use crate::error::WorkerError;
use crate::message::Delivery;
use crate::topology::QueueSpec;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use lapin::ExchangeKind;

/// Pull-based sequence of deliveries from one queue. Ends (or yields an error)
/// only when the broker session goes away.
pub type DeliveryStream<H> = BoxStream<'static, Result<Delivery<H>, WorkerError>>;

/// Settles one delivery. Both methods consume the handle.
#[async_trait]
pub trait DeliveryHandle: Send + 'static {
    async fn ack(self) -> Result<(), WorkerError>;

    /// Rejects without requeue, handing the message to the queue's dead-letter exchange.
    async fn reject(self) -> Result<(), WorkerError>;
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    type Handle: DeliveryHandle;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), WorkerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), WorkerError>;

    /// Binds `queue` to `exchange`. Without a routing key the queue name is used.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: Option<&str>) -> Result<(), WorkerError>;

    /// Starts consuming with at most `prefetch` unacknowledged deliveries outstanding.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Handle>, WorkerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<(), WorkerError>;

    async fn close(&self) -> Result<(), WorkerError>;
}
