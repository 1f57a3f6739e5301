use std::sync::Arc;
use std::time::Duration;

use getset::Getters;
use rabbit_worker_broker::{Broker, Consumer, Delivery, DeliveryMode, Destination, Message};
use rabbit_worker_task_handler::TaskHandler;
use thiserror::Error;
use tracing::{debug, trace};

use crate::delay::Delay;
use crate::errors::{RabbitWorkerError, Result};
use crate::job::Job;
use crate::payload::JobPayload;
use crate::properties;
use crate::push_options::PushOptions;
use crate::utils::{generate_id, normalize_priority, unix_timestamp};

/// Prefix of the message ids given to pushed jobs.
pub const JOB_ID_PREFIX: &str = "job-";

/// A delivery that could not be turned into a [`Job`].
///
/// The delivery is handed back so that the caller can reject it.
#[derive(Error, Debug)]
#[error("Failed to convert delivery into a job: {source}")]
pub struct ConversionError {
    pub delivery: Delivery,
    #[source]
    pub source: RabbitWorkerError,
}

/// Points `message` at `queue`, going through the delayed exchange when
/// there is a delay and an exchange to honor it.
///
/// Without a delayed exchange the delay is dropped and the message goes
/// straight to the queue.
pub(crate) fn route(
    message: &mut Message,
    queue: &str,
    delayed_exchange: Option<&str>,
    delay_ms: u64,
) -> Destination {
    message.remove_property(properties::DELAY);

    match (delay_ms, delayed_exchange) {
        (0, _) => Destination::queue(queue),
        (delay_ms, Some(exchange)) => {
            message.set_property(properties::DELAY, delay_ms);
            message.set_routing_key(queue);
            Destination::exchange(exchange, queue)
        }
        (delay_ms, None) => {
            debug!(queue, delay_ms, "No delayed exchange configured, delivering immediately");
            Destination::queue(queue)
        }
    }
}

/// Producer side of a queue connection.
///
/// Holds no state between pushes: every push builds and publishes one
/// message.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct Queue {
    #[getset(skip)]
    broker: Arc<dyn Broker>,
    connection_name: String,
    queue_name: String,
    /// How long [`Queue::pop`] and every consume cycle of a worker wait for
    /// a message. Zero means "don't wait" for `pop` and "no limit" for a
    /// worker.
    time_to_run: Duration,
    delayed_exchange: Option<String>,
    #[getset(skip)]
    resume: bool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("connection_name", &self.connection_name)
            .field("queue_name", &self.queue_name)
            .field("time_to_run", &self.time_to_run)
            .field("delayed_exchange", &self.delayed_exchange)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(
        broker: Arc<dyn Broker>,
        connection_name: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Queue {
            broker,
            connection_name: connection_name.into(),
            queue_name: queue_name.into(),
            time_to_run: Duration::ZERO,
            delayed_exchange: None,
            resume: false,
        }
    }

    pub fn with_time_to_run(mut self, time_to_run: Duration) -> Self {
        self.time_to_run = time_to_run;
        self
    }

    /// Exchange of type `x-delayed-message` bound to the queue, used for
    /// delayed pushes and releases.
    pub fn with_delayed_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.delayed_exchange = Some(exchange.into());
        self
    }

    /// Whether a worker re-subscribes after a consume cycle ends.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn should_resume(&self) -> bool {
        self.resume
    }

    fn target<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.queue_name)
    }

    /// Pushes `job` and returns the message id.
    ///
    /// A job declaring its own priority wins over `options.priority`.
    pub async fn push<T: TaskHandler>(&self, job: &T, mut options: PushOptions) -> Result<String> {
        let payload = JobPayload::from_task(job)?;
        if let Some(priority) = job.priority() {
            options.priority = Some(priority.into());
        }
        self.push_raw(payload.to_bytes()?, options).await
    }

    /// Pushes `job` to be delivered after `delay`.
    pub async fn later<T: TaskHandler>(
        &self,
        delay: impl Into<Delay>,
        job: &T,
        mut options: PushOptions,
    ) -> Result<String> {
        options.delay = Some(delay.into());
        self.push(job, options).await
    }

    /// Publishes an already encoded payload as a persistent JSON message and
    /// returns its message id.
    pub async fn push_raw(&self, payload: impl Into<Vec<u8>>, options: PushOptions) -> Result<String> {
        let body = payload.into();
        let id = generate_id(JOB_ID_PREFIX, &body);
        let queue = self.target(options.queue.as_deref());

        let mut message = Message::new(body);
        message.set_timestamp(unix_timestamp());
        message.set_content_type("application/json");
        message.set_delivery_mode(DeliveryMode::Persistent);
        message.set_message_id(id.clone());
        if let Some(priority) = options.priority {
            message.set_priority(normalize_priority(priority));
        }

        let delay_ms = options.delay.map(|d| d.as_millis()).unwrap_or(0);
        let destination = route(&mut message, queue, self.delayed_exchange.as_deref(), delay_ms);

        self.broker.publish(&destination, message).await?;
        trace!(job_id = id.as_str(), queue, delay_ms, "Pushed job");
        Ok(id)
    }

    /// Receives one job, waiting at most the time to run.
    ///
    /// Returns `None` when nothing arrived in time. A message that is not a
    /// job is rejected without requeue and its conversion error returned.
    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>> {
        let consumer = Consumer::new(self.broker.clone(), self.target(queue));

        let delivery = if self.time_to_run.is_zero() {
            consumer.receive_no_wait().await?
        } else {
            consumer.receive(Some(self.time_to_run)).await?
        };
        let Some(delivery) = delivery else {
            return Ok(None);
        };

        match self.convert_delivery(delivery) {
            Ok(job) => Ok(Some(job)),
            Err(ConversionError { delivery, source }) => {
                consumer.reject(&delivery, false).await?;
                Err(source)
            }
        }
    }

    /// Broker reported number of ready messages.
    ///
    /// The broker updates this number asynchronously, right after a publish
    /// or a consume it may still be stale.
    pub async fn size(&self, queue: Option<&str>) -> Result<u32> {
        Ok(self.broker.declare_queue(self.target(queue)).await?)
    }

    /// Wraps a delivery of this connection into a [`Job`].
    pub fn convert_delivery(&self, delivery: Delivery) -> std::result::Result<Job, ConversionError> {
        match JobPayload::from_bytes(delivery.message().body()) {
            Ok(payload) => Ok(Job::new(
                self.broker.clone(),
                delivery,
                &self.connection_name,
                self.delayed_exchange.clone(),
                payload,
            )),
            Err(e) => {
                let source = RabbitWorkerError::malformed(
                    delivery.message().message_id(),
                    format!("invalid job payload: {e}"),
                );
                Err(ConversionError { delivery, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rabbit_worker_broker::MemoryBroker;

    use super::*;

    #[test]
    fn routes_delays_through_the_exchange() {
        let mut message = Message::new("{}");
        message.set_property(properties::DELAY, 100);

        let destination = route(&mut message, "jobs", Some("delayed"), 0);
        assert_eq!(destination, Destination::queue("jobs"));
        assert!(message.property(properties::DELAY).is_none());

        let destination = route(&mut message, "jobs", Some("delayed"), 1500);
        assert_eq!(destination, Destination::exchange("delayed", "jobs"));
        assert_eq!(message.property(properties::DELAY).and_then(|v| v.as_i64()), Some(1500));

        let destination = route(&mut message, "jobs", None, 1500);
        assert_eq!(destination, Destination::queue("jobs"));
        assert!(message.property(properties::DELAY).is_none());
    }

    #[tokio::test]
    async fn push_raw_sets_headers() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = Queue::new(broker.clone(), "rabbitmq", "jobs");

        let id = queue
            .push_raw(r#"{"job":"x"}"#, PushOptions::builder().priority(-4).build())
            .await
            .unwrap();

        let messages = broker.messages("jobs");
        let message = &messages[0];
        assert_eq!(message.message_id(), Some(id.as_str()));
        assert!(id.starts_with(JOB_ID_PREFIX));
        assert_eq!(message.priority(), Some(0));
        assert!(message.is_persistent());
        assert_eq!(message.headers().content_type.as_deref(), Some("application/json"));
        assert!(message.headers().timestamp.is_some());
    }

    #[tokio::test]
    async fn pop_rejects_malformed_messages() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = Queue::new(broker.clone(), "rabbitmq", "jobs");
        queue.push_raw("not json", PushOptions::new()).await.unwrap();

        let err = queue.pop(None).await.unwrap_err();
        assert!(matches!(err, RabbitWorkerError::MalformedMessage { .. }));
        assert_eq!(broker.ready_count("jobs"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }
}
