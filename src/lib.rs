//! # RabbitMQ DLX Worker
//! A RabbitMQ task consumer whose retries are driven by the broker: failed
//! deliveries are rejected into a TTL parking queue via a dead-letter exchange,
//! and the `x-death` history they come back with bounds the number of retries.

pub mod death;
pub mod dlq;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod message;
pub mod retry;
pub mod supervisor;
pub mod topology;
pub mod worker;

// Re-export key components for easy access
pub use death::{DeathHistory, DeathHistoryInspector, DeathReason, DeathRecord, Exhaustion, Verdict};
pub use dlq::{DeadLetterObserver, ObserverConfig, ObserverStats, QuarantineReport};
pub use error::WorkerError;
pub use gateway::{AmqpGateway, BrokerGateway, DeliveryHandle, InMemoryBroker};
pub use handler::{JsonTask, MessageHandler, Task};
pub use message::{Delivery, TaskMessage};
pub use retry::{ReconnectPolicy, RetryPolicy};
pub use supervisor::{run_with_reconnect, shutdown_channel, Shutdown, ShutdownTrigger};
pub use topology::{QueueSpec, RetryTopology};
pub use worker::{ConsumerStats, Outcome, TaskConsumer, WorkerConfig};
