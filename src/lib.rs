//! Durable job queue on top of an AMQP broker.
//!
//! Jobs are JSON payloads published as persistent messages. They can carry a
//! priority, be delayed through a delayed message exchange, and keep a small
//! state across retries in the message properties. A [`Worker`] consumes one
//! queue connection at a time, runs each job with its registered
//! [`TaskHandler`], retries it with a backoff and finally archives it into a
//! [`FailedJobStore`] once it runs out of attempts. Archived jobs can be
//! listed, found, forgotten or requeued by scanning the failed queue.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rabbit_worker::{
//!     DaemonOptions, IntoTaskHandlerResult, JobContext, MemoryBroker, PushOptions, Queue,
//!     TaskHandler, WorkerOptions,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize, Serialize)]
//! struct ResizeImage { path: String }
//!
//! impl TaskHandler for ResizeImage {
//!     const IDENTIFIER: &'static str = "resize_image";
//!
//!     async fn run(self, ctx: JobContext) -> impl IntoTaskHandlerResult {
//!         println!("attempt {} for {}", ctx.attempts(), self.path);
//!         Ok::<(), String>(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Queue::new(Arc::new(MemoryBroker::new()), "rabbitmq", "images");
//! queue
//!     .push(&ResizeImage { path: "cat.png".into() }, PushOptions::default())
//!     .await?;
//!
//! let worker = WorkerOptions::default()
//!     .add_queue(queue)
//!     .define_job::<ResizeImage>()
//!     .init()?;
//! worker.daemon("rabbitmq", &[], &DaemonOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod connector;
pub mod control;
pub mod daemon_options;
pub mod delay;
pub mod errors;
pub mod exceptions;
pub mod failed;
pub mod job;
pub mod memory_probe;
pub mod payload;
pub mod properties;
pub mod push_options;
pub mod queue;
pub mod runner;
mod utils;

pub use crate::builder::{WorkerBuildError, WorkerOptions};
pub use crate::config::RabbitConfig;
pub use crate::connector::Connector;
pub use crate::control::WorkerControl;
pub use crate::daemon_options::{DaemonOptions, DaemonOptionsBuilder};
pub use crate::delay::{delay_to_millis, Delay};
pub use crate::errors::RabbitWorkerError;
pub use crate::exceptions::{caused_by_lost_connection, ExceptionHandler, TracingExceptionHandler};
pub use crate::failed::{FailedJobStore, FailedRecord};
pub use crate::job::Job;
pub use crate::memory_probe::{MemoryProbe, ProcessMemory};
pub use crate::payload::JobPayload;
pub use crate::push_options::{PushOptions, PushOptionsBuilder};
pub use crate::queue::{ConversionError, Queue};
pub use crate::runner::{FallbackDaemon, Worker, WorkerRuntimeError, WorkerState};
pub use crate::utils::normalize_priority;

pub use rabbit_worker_broker::{
    Broker, BrokerError, ConsumeOutcome, Consumer, Delivery, DeliveryMode, Destination,
    FieldValue, MemoryBroker, Message, MessageHeaders, SubscriptionConsumer,
};
#[cfg(feature = "lapin")]
pub use rabbit_worker_broker::LapinBroker;
pub use rabbit_worker_ctx::JobContext;
pub use rabbit_worker_job_state::{JobState, JobStateError};
pub use rabbit_worker_lifecycle_hooks::*;
pub use rabbit_worker_task_handler::{IntoTaskHandlerResult, TaskHandler};
