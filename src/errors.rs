use rabbit_worker_broker::BrokerError;
use rabbit_worker_job_state::JobStateError;
use thiserror::Error;

/// Errors that can occur while producing, consuming or archiving jobs.
#[derive(Error, Debug)]
pub enum RabbitWorkerError {
    /// A queue connection is missing a required setting or references an
    /// unknown connection, queue or exchange
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A value offered to the job state is not plain data
    #[error(transparent)]
    InvalidValue(#[from] JobStateError),

    /// A received message cannot be turned into a job
    #[error("Malformed message '{message_id}': {reason}")]
    MalformedMessage { message_id: String, reason: String },

    /// The broker refused an operation or the connection to it failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Moving a single message during a failed job scan failed
    #[error("Failed to move message '{message_id}' to '{destination}': {source}")]
    TransientPublishFailure {
        message_id: String,
        destination: String,
        #[source]
        source: BrokerError,
    },

    /// A job attempt failed
    #[error("Job '{job_id}' failed: {message}")]
    Job { job_id: String, message: String },

    /// A payload could not be serialized
    #[error("Error while serializing payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configuration sources could not be read or deserialized
    #[error("Error while loading configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl RabbitWorkerError {
    pub(crate) fn malformed(message_id: Option<&str>, reason: impl Into<String>) -> Self {
        RabbitWorkerError::MalformedMessage {
            message_id: message_id.unwrap_or("<none>").to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error comes from a broker connection or channel fault.
    pub fn is_transport_fault(&self) -> bool {
        match self {
            RabbitWorkerError::Broker(e) => e.is_transport_fault(),
            RabbitWorkerError::TransientPublishFailure { source, .. } => source.is_transport_fault(),
            _ => false,
        }
    }
}

/// A Result type alias for RabbitWorkerError.
pub type Result<T> = core::result::Result<T, RabbitWorkerError>;
