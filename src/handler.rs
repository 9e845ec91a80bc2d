//! Defines the task bodies the consumer runs for each delivery.

use crate::error::WorkerError;
use crate::message::TaskMessage;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A unit of work executed once per delivery, on the raw message.
///
/// Returning `Err` (or panicking) marks the attempt as failed; the consumer then
/// decides between another dead-letter round-trip and giving up. The same
/// logical task can run more than once, so implementations should be idempotent.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, message: &TaskMessage) -> Result<(), WorkerError>;

    /// A name for the task, used for logging and identification.
    fn name(&self) -> &str;
}

/// A trait for processing JSON messages from a RabbitMQ queue.
///
/// Implement this trait for your specific message type and business logic,
/// then hand it to the consumer wrapped in [`JsonTask`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: DeserializeOwned + Send + Sync;

    /// Processes a single deserialized message.
    ///
    /// # Returns
    /// `Ok(())` if the message was processed successfully, or a `WorkerError` if not.
    async fn handle_message(&self, message: Self::MessageType) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Runs a [`MessageHandler`] as a [`Task`].
///
/// A payload that does not deserialize counts as a failed attempt like any
/// other, so it takes the same bounded path through the retry loop.
pub struct JsonTask<H>(pub H);

#[async_trait]
impl<H: MessageHandler> Task for JsonTask<H> {
    async fn execute(&self, message: &TaskMessage) -> Result<(), WorkerError> {
        let parsed: H::MessageType = serde_json::from_slice(&message.payload)?;
        self.0.handle_message(parsed).await
    }

    fn name(&self) -> &str {
        self.0.handler_name()
    }
}
