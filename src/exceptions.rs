use std::fmt::Display;

use tracing::error;

use crate::errors::RabbitWorkerError;

/// Sink for errors that are swallowed where they happen so that a worker or
/// a failed job scan can keep going.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn report(&self, error: &RabbitWorkerError);
}

/// Reports through `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionHandler;

impl ExceptionHandler for TracingExceptionHandler {
    fn report(&self, error: &RabbitWorkerError) {
        error!(error = %error, source = ?std::error::Error::source(error), "Reported exception");
    }
}

impl<F> ExceptionHandler for F
where
    F: Fn(&RabbitWorkerError) + Send + Sync + 'static,
{
    fn report(&self, error: &RabbitWorkerError) {
        self(error)
    }
}

const LOST_CONNECTION_PHRASES: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "lost connection",
    "is dead or not enabled",
    "error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "ssl connection has been closed unexpectedly",
    "error writing data to the connection",
    "resource deadlock avoided",
    "transaction() on null",
    "child connection forced to terminate due to client_idle_limit",
    "query_wait_timeout",
    "reset by peer",
    "physical connection is not usable",
    "packets out of order",
    "broken pipe",
    "connection refused",
    "connection timed out",
    "connection reset",
    "channel closed",
    "connection closed",
];

/// Whether the error text looks like the connection to a backing service
/// went away.
pub fn caused_by_lost_connection(error: &dyn Display) -> bool {
    let message = error.to_string().to_lowercase();
    LOST_CONNECTION_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn detects_lost_connections() {
        assert!(caused_by_lost_connection(&"SQLSTATE[HY000]: MySQL server has gone away"));
        assert!(caused_by_lost_connection(&"IO error: Broken pipe (os error 32)"));
        assert!(caused_by_lost_connection(&"Connection reset by peer"));
        assert!(!caused_by_lost_connection(&"division by zero"));
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |e: &RabbitWorkerError| sink.lock().unwrap().push(e.to_string());

        handler.report(&RabbitWorkerError::InvalidConfiguration("missing queue".into()));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["Invalid configuration: missing queue"]
        );
    }
}
