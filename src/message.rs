//! Messages as the core sees them, independent of the broker client.

use crate::death::{DeathHistory, MalformedDeathHistory};
use lapin::types::FieldTable;

/// A task message as delivered by the broker.
///
/// The payload is opaque. Headers are only ever written by the broker
/// (dead-lettering appends to `x-death`); the consumer reads them.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub payload: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub message_id: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

impl TaskMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: None,
            message_id: None,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// The parsed `x-death` header, if the message has been dead-lettered before.
    pub fn death_history(&self) -> Result<Option<DeathHistory>, MalformedDeathHistory> {
        match &self.headers {
            Some(headers) => DeathHistory::from_headers(headers),
            None => Ok(None),
        }
    }

    /// The death history rendered for logs; never fails.
    pub fn describe_death_history(&self) -> String {
        match self.death_history() {
            Ok(Some(history)) => history.to_string(),
            Ok(None) => "[]".to_string(),
            Err(e) => format!("<malformed: {}>", e),
        }
    }

    /// Identity used in logs. Falls back to the routing key when publishers set no message id.
    pub fn identity(&self) -> String {
        match &self.message_id {
            Some(id) => id.clone(),
            None => format!("<no message-id, routing key '{}'>", self.routing_key),
        }
    }
}

/// One delivery attempt of a [`TaskMessage`].
///
/// The handle is settled by value, so a delivery can be acked or rejected once
/// and only once. Each retry arrives as a new `Delivery` with a new handle.
pub struct Delivery<H> {
    pub delivery_tag: u64,
    pub message: TaskMessage,
    pub handle: H,
}
