use super::{BrokerGateway, DeliveryHandle, DeliveryStream};
use crate::error::WorkerError;
use crate::message::{Delivery, TaskMessage};
use crate::topology::QueueSpec;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};

/// [`BrokerGateway`] over a single `lapin` channel.
///
/// The gateway owns its channel; give each consumer or observer its own
/// gateway instead of sharing one across tasks.
pub struct AmqpGateway {
    connection: Connection,
    channel: Channel,
}

impl AmqpGateway {
    /// Opens a connection and a channel on it.
    pub async fn connect(rabbitmq_url: &str) -> Result<Self, WorkerError> {
        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        log::info!("Connected to RabbitMQ, channel {} open", channel.id());
        Ok(Self { connection, channel })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

pub struct AmqpDeliveryHandle {
    acker: Acker,
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn ack(self) -> Result<(), WorkerError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(self) -> Result<(), WorkerError> {
        self.acker.reject(BasicRejectOptions { requeue: false }).await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery<AmqpDeliveryHandle> {
    let message = TaskMessage {
        headers: delivery.properties.headers().clone(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        payload: delivery.data,
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        message,
        handle: AmqpDeliveryHandle { acker: delivery.acker },
    }
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    type Handle = AmqpDeliveryHandle;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), WorkerError> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), WorkerError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions { durable: spec.durable, ..Default::default() },
                spec.arguments(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: Option<&str>) -> Result<(), WorkerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key.unwrap_or(queue),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Handle>, WorkerError> {
        self.channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", prefetch);

        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        log::info!("Consumer started with tag '{}' on queue '{}'", consumer.tag().as_str(), queue);

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(WorkerError::from))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<(), WorkerError> {
        let properties = match headers {
            Some(headers) => BasicProperties::default().with_headers(headers),
            None => BasicProperties::default(),
        };

        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, properties)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.channel.close(200, "consumer shutdown").await?;
        self.connection.close(200, "consumer shutdown").await?;
        log::info!("RabbitMQ channel and connection closed");
        Ok(())
    }
}
