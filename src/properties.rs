//! Message property names.
//!
//! These are part of the wire format shared with every other producer and
//! consumer of the queues, they must never change.

/// Delivery attempt of a job, an integer starting at 1
pub const ATTEMPTS: &str = "job-attempts";
/// Serialized [`JobState`](crate::JobState) of a released job
pub const STATE: &str = "job-state";
/// Unix timestamp (seconds) at which a job was archived as failed
pub const FAILED_AT: &str = "job-failed-at";
pub const CONNECTION_NAME: &str = "job-connection-name";
pub const QUEUE_NAME: &str = "job-queue-name";
/// Truncated text of the error that made the job fail
pub const EXCEPTION: &str = "job-exception";
/// Read by the delayed message exchange plugin, in milliseconds
pub const DELAY: &str = "x-delay";
