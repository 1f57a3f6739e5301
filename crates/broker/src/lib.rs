//! Broker client boundary of the job queue.
//!
//! The queue, job and worker only ever talk to a broker through the
//! [`Broker`] trait: publish, receive with or without waiting,
//! acknowledge, reject, and a handful of queue management calls. This keeps
//! topology provisioning and wire framing out of the core, and lets tests run
//! against [`MemoryBroker`] instead of a live RabbitMQ.

#[cfg(feature = "lapin")]
mod amqp;
mod broker;
mod error;
mod memory;
mod message;

pub use broker::{Broker, ConsumeOutcome, Consumer, Destination, SubscriptionConsumer};
pub use error::{BrokerError, Result};
#[cfg(feature = "lapin")]
pub use amqp::LapinBroker;
pub use memory::MemoryBroker;
pub use message::{Delivery, DeliveryMode, FieldValue, Message, MessageHeaders};
