//! Archive of permanently failed jobs, kept in a broker queue.
//!
//! Appending is a plain publish. Everything else has to scan: AMQP can't
//! peek at or delete an arbitrary message, so reads and deletes move every
//! archived message into a temporary queue and back again, filtering on the
//! way back.
//!
//! A scan is not atomic. If the process dies halfway through, messages may
//! be left in the temporary queue (hidden until the broker drops it) or be
//! duplicated in the archive. Two scans running at the same time against the
//! same archive queue interleave and are not supported.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use getset::Getters;
use rabbit_worker_broker::{Broker, Consumer, DeliveryMode, Destination, Message};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{RabbitWorkerError, Result};
use crate::exceptions::{ExceptionHandler, TracingExceptionHandler};
use crate::properties;
use crate::utils::{generate_id, is_generated_id, truncate_utf8, unix_timestamp};

/// Prefix of the ids given to archived jobs.
pub const FAILED_ID_PREFIX: &str = "failed-job-";
/// `app_id` header of archived messages.
pub const FAILED_APP_ID: &str = "rabbit-worker-failed-jobs";
/// Longest exception text kept on an archived message, in bytes.
pub const MAX_EXCEPTION_BYTES: usize = 10 * 1024;

/// A failed job as read back from the archive queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub")]
pub struct FailedRecord {
    id: String,
    /// Queue connection the job was consumed from
    connection: Option<String>,
    queue: Option<String>,
    /// Raw body of the failed job
    payload: String,
    exception: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

impl FailedRecord {
    fn from_message(message: &Message) -> Self {
        let text = |name: &str| {
            message
                .property(name)
                .map(|value| value.to_string())
        };

        FailedRecord {
            id: message.message_id().unwrap_or_default().to_string(),
            connection: text(properties::CONNECTION_NAME),
            queue: text(properties::QUEUE_NAME),
            payload: String::from_utf8_lossy(message.body()).into_owned(),
            exception: text(properties::EXCEPTION),
            failed_at: message
                .property(properties::FAILED_AT)
                .and_then(|value| value.as_i64())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}

/// Moves every ready message of one queue to another.
struct Move<'a> {
    broker: &'a Arc<dyn Broker>,
    from: Consumer,
    to: Destination,
    exception_handler: &'a dyn ExceptionHandler,
}

impl Move<'_> {
    /// Publishes each message `keep` accepts to the destination and acks it
    /// once published; messages `keep` refuses are acked and dropped.
    ///
    /// A failed publish is reported and the message stays unacked until the
    /// pass is over, then goes back to its queue. Returns how many did.
    async fn run(&self, mut keep: impl FnMut(&Message) -> bool) -> Result<usize> {
        let mut held = Vec::new();

        while let Some(delivery) = self.from.receive_no_wait().await? {
            if !keep(delivery.message()) {
                self.from.acknowledge(&delivery).await?;
                continue;
            }

            match self.broker.publish(&self.to, delivery.message().clone()).await {
                Ok(()) => self.from.acknowledge(&delivery).await?,
                Err(source) => {
                    self.exception_handler
                        .report(&RabbitWorkerError::TransientPublishFailure {
                            message_id: delivery
                                .message()
                                .message_id()
                                .unwrap_or("<none>")
                                .to_string(),
                            destination: self.to.name().to_string(),
                            source,
                        });
                    held.push(delivery);
                }
            }
        }

        for delivery in &held {
            self.from.reject(delivery, true).await?;
        }
        Ok(held.len())
    }
}

/// Failed job provider storing its records in a dedicated broker queue.
#[derive(Clone)]
pub struct FailedJobStore {
    broker: Arc<dyn Broker>,
    queue: String,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl std::fmt::Debug for FailedJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedJobStore")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl FailedJobStore {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        FailedJobStore {
            broker,
            queue: queue.into(),
            exception_handler: Arc::new(TracingExceptionHandler),
        }
    }

    /// Where publish failures met during a scan are reported.
    pub fn with_exception_handler(mut self, exception_handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = exception_handler;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Archives a failed job and returns the id it was given.
    pub async fn log(
        &self,
        connection_name: &str,
        queue_name: &str,
        payload: &[u8],
        exception: &str,
    ) -> Result<String> {
        let timestamp = unix_timestamp();
        let id = generate_id(FAILED_ID_PREFIX, payload);

        let mut message = Message::new(payload);
        message.set_property(properties::FAILED_AT, timestamp);
        message.set_property(properties::CONNECTION_NAME, connection_name);
        message.set_property(properties::QUEUE_NAME, queue_name);
        message.set_property(
            properties::EXCEPTION,
            truncate_utf8(exception, MAX_EXCEPTION_BYTES),
        );
        message.set_app_id(FAILED_APP_ID);
        message.set_timestamp(timestamp);
        message.set_content_type("application/json");
        message.set_delivery_mode(DeliveryMode::Persistent);
        message.set_message_id(id.clone());

        self.broker
            .publish(&Destination::queue(&self.queue), message)
            .await?;

        debug!(failed_id = id.as_str(), queue = queue_name, "Archived failed job");
        Ok(id)
    }

    /// Broker reported number of archived jobs.
    ///
    /// The broker updates this number asynchronously: right after a burst of
    /// writes it may lag behind, wait a little before relying on it.
    pub async fn count(&self) -> Result<u32> {
        Ok(self.broker.declare_queue(&self.queue).await?)
    }

    /// Every archived job, oldest first.
    pub async fn all(&self) -> Result<Vec<FailedRecord>> {
        let (records, _) = self.scan(|_| true).await?;
        Ok(records)
    }

    /// The first archived job with `id`. Ids that could not have been issued
    /// by [`FailedJobStore::log`] are not looked up at all.
    pub async fn find(&self, id: &str) -> Result<Option<FailedRecord>> {
        if !is_generated_id(FAILED_ID_PREFIX, id) {
            return Ok(None);
        }
        Ok(self.all().await?.into_iter().find(|record| record.id == id))
    }

    /// Removes every archived job with `id`, returns whether there was one.
    pub async fn forget(&self, id: &str) -> Result<bool> {
        if !is_generated_id(FAILED_ID_PREFIX, id) {
            return Ok(false);
        }
        let (_, removed) = self
            .scan(|message| message.message_id() != Some(id))
            .await?;
        Ok(removed > 0)
    }

    /// Drops every archived job.
    pub async fn flush(&self) -> Result<()> {
        Ok(self.broker.purge_queue(&self.queue).await?)
    }

    /// Moves the archive into a temporary queue, then back, keeping only the
    /// messages `keep` accepts. Returns the kept records in archive order and
    /// the number of dropped messages.
    async fn scan(
        &self,
        mut keep: impl FnMut(&Message) -> bool,
    ) -> Result<(Vec<FailedRecord>, usize)> {
        let temporary = self.broker.create_temporary_queue().await?;

        let drain = Move {
            broker: &self.broker,
            from: Consumer::new(self.broker.clone(), &self.queue),
            to: Destination::queue(&temporary),
            exception_handler: self.exception_handler.as_ref(),
        };
        let held_in_archive = drain.run(|_| true).await?;
        if held_in_archive > 0 {
            warn!(
                queue = self.queue.as_str(),
                count = held_in_archive,
                "Some failed jobs could not be moved and were left out of the scan"
            );
        }

        let restore = Move {
            broker: &self.broker,
            from: Consumer::new(self.broker.clone(), &temporary),
            to: Destination::queue(&self.queue),
            exception_handler: self.exception_handler.as_ref(),
        };
        let mut records = Vec::new();
        let mut removed = 0;
        let mut held = restore
            .run(|message| {
                if keep(message) {
                    records.push(FailedRecord::from_message(message));
                    true
                } else {
                    removed += 1;
                    false
                }
            })
            .await?;

        // Held messages were already projected, only put them back
        if held > 0 {
            held = restore.run(|_| true).await?;
        }

        if held == 0 {
            self.broker.delete_queue(&temporary).await?;
        } else {
            warn!(
                queue = self.queue.as_str(),
                temporary_queue = temporary.as_str(),
                count = held,
                "Failed jobs are stranded in the temporary queue"
            );
        }

        Ok((records, removed))
    }
}
