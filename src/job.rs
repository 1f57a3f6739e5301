use std::sync::Arc;

use rabbit_worker_broker::{Broker, Delivery, Message};
use rabbit_worker_job_state::JobState;
use tracing::{debug, warn};

use crate::delay::Delay;
use crate::errors::Result;
use crate::payload::JobPayload;
use crate::properties;
use crate::queue::route;

/// One received message, waiting to be deleted, released or rejected.
///
/// Each of those consumes the job, so a job can settle its message only once.
pub struct Job {
    broker: Arc<dyn Broker>,
    delivery: Delivery,
    connection_name: String,
    delayed_exchange: Option<String>,
    payload: JobPayload,
    state: Option<JobState>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id())
            .field("queue", &self.queue())
            .field("attempts", &self.attempts())
            .field("task", self.payload.job())
            .finish_non_exhaustive()
    }
}

fn restore_state(message: &Message) -> JobState {
    message
        .property(properties::STATE)
        .and_then(|value| value.as_str())
        .map(JobState::deserialize)
        .unwrap_or_default()
}

impl Job {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        delivery: Delivery,
        connection_name: &str,
        delayed_exchange: Option<String>,
        payload: JobPayload,
    ) -> Self {
        Job {
            broker,
            delivery,
            connection_name: connection_name.to_string(),
            delayed_exchange,
            payload,
            state: None,
        }
    }

    /// Message id of the underlying message.
    pub fn job_id(&self) -> &str {
        self.delivery.message().message_id().unwrap_or_default()
    }

    /// Queue the message was received from.
    pub fn queue(&self) -> &str {
        self.delivery.queue()
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn raw_body(&self) -> &[u8] {
        self.delivery.message().body()
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn message(&self) -> &Message {
        self.delivery.message()
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Delivery attempt of this message, 1 for a job that was never released.
    pub fn attempts(&self) -> u32 {
        self.delivery
            .message()
            .property(properties::ATTEMPTS)
            .and_then(|value| value.as_i64())
            .and_then(|attempts| u32::try_from(attempts).ok())
            .unwrap_or(1)
    }

    /// The job state, restored from the message on first access.
    pub fn state(&mut self) -> &mut JobState {
        self.state
            .get_or_insert_with(|| restore_state(self.delivery.message()))
    }

    pub fn set_state(&mut self, state: JobState) {
        self.state = Some(state);
    }

    /// Acknowledges the message.
    pub async fn delete(self) -> Result<()> {
        self.broker.acknowledge(&self.delivery).await?;
        debug!(job_id = self.job_id(), queue = self.queue(), "Deleted job");
        Ok(())
    }

    /// Puts a copy of the message back on its queue with the attempt counter
    /// incremented and the current state attached, then acknowledges this
    /// one.
    ///
    /// The copy goes through the delayed exchange when `delay` is not zero
    /// and one is configured; otherwise it is delivered right away. The copy
    /// is published before the original is acknowledged, so a failure in
    /// between can duplicate the job but never lose it. If publishing fails
    /// the original is rejected back onto its queue.
    pub async fn release(mut self, delay: impl Into<Delay>) -> Result<()> {
        let delay_ms = delay.into().as_millis();
        let attempts = self.attempts().saturating_add(1);
        let state = self.state().serialize();

        let mut message = self.delivery.message().clone();
        message.set_property(properties::ATTEMPTS, attempts);
        message.set_property(properties::STATE, state);
        let destination = route(
            &mut message,
            self.delivery.queue(),
            self.delayed_exchange.as_deref(),
            delay_ms,
        );

        if let Err(e) = self.broker.publish(&destination, message).await {
            if let Err(reject_error) = self.broker.reject(&self.delivery, true).await {
                warn!(
                    job_id = self.job_id(),
                    error = ?reject_error,
                    "Failed to reject job after a failed release"
                );
            }
            return Err(e.into());
        }

        self.broker.acknowledge(&self.delivery).await?;
        debug!(
            job_id = self.job_id(),
            queue = self.queue(),
            attempts,
            delay_ms,
            "Released job"
        );
        Ok(())
    }

    /// Rejects the message, putting it back on its queue when `requeue` is set.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.broker.reject(&self.delivery, requeue).await?;
        Ok(())
    }
}
