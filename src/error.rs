use thiserror::Error;

/// Generic error type for the dead-letter retry worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The broker connection or channel is gone.
    #[error("Broker connection lost: {message}")]
    Disconnected {
        message: String,
    },

    /// Error during message deserialization.
    #[error("Failed to deserialize message: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError {
        message: String,
    },

    /// Error from the task body.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl WorkerError {
    pub fn disconnected(message: impl Into<String>) -> Self {
        WorkerError::Disconnected { message: message.into() }
    }

    /// Whether this error ends the current broker session.
    ///
    /// Connectivity failures are retried at the connection layer with backoff.
    /// Everything else (bad configuration, topology mismatches) would fail the
    /// same way again after a reconnect.
    pub fn is_connectivity_failure(&self) -> bool {
        match self {
            WorkerError::Disconnected { .. } => true,
            WorkerError::Lapin(e) => matches!(
                e,
                lapin::Error::IOError(_)
                    | lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::MissingHeartbeatError
            ),
            _ => false,
        }
    }
}

// Allow converting from a string-like type into a MessagingError
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::MessagingError { message: s }
    }
}
