use thiserror::Error;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection or channel to the broker failed. The current process
    /// cannot trust its broker session anymore.
    #[error("Broker transport failure: {0}")]
    Transport(String),

    /// The broker refused a single operation (missing exchange, unknown queue...)
    #[error("Broker refused operation on '{target}': {reason}")]
    Operation { target: String, reason: String },

    /// The delivery tag is not (or no longer) held by this client
    #[error("Unknown delivery tag {0}, was the message already acknowledged or rejected ?")]
    UnknownDelivery(u64),

    /// The client was closed explicitly
    #[error("Broker connection is closed")]
    Closed,
}

impl BrokerError {
    pub fn operation(target: impl Into<String>, reason: impl Into<String>) -> Self {
        BrokerError::Operation {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Channel or connection level faults are fatal to the current worker.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::Closed)
    }
}

pub type Result<T> = core::result::Result<T, BrokerError>;
