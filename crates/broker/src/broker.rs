use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;
use crate::message::{Delivery, Message};

/// Where a message should be published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Straight into a named queue through the default exchange
    Queue(String),
    /// Through a named exchange, routed with the given key
    Exchange { name: String, routing_key: String },
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Destination::Exchange {
            name: name.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) => name,
            Destination::Exchange { name, .. } => name,
        }
    }
}

/// The primitives the job queue is built on.
///
/// Implementations are expected to be safe for sequential use from a single
/// worker task: the consumer and any producer activity triggered by a job
/// share the same client.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, destination: &Destination, message: Message) -> Result<()>;

    /// Waits for the next message of `queue`. `None` waits forever.
    async fn receive(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>>;

    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()>;

    /// Rejects a delivery. With `requeue` the message goes back to its queue,
    /// otherwise the broker drops or dead-letters it.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Declares the queue and returns the broker reported number of ready messages.
    async fn declare_queue(&self, queue: &str) -> Result<u32>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    async fn purge_queue(&self, queue: &str) -> Result<()>;

    /// Creates a server named queue that lives until deleted or until the
    /// connection goes away.
    async fn create_temporary_queue(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

/// A consumer bound to a single queue.
#[derive(Clone)]
pub struct Consumer {
    broker: Arc<dyn Broker>,
    queue: String,
    tag: Option<String>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Consumer {
            broker,
            queue: queue.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        self.broker.receive(&self.queue, timeout).await
    }

    pub async fn receive_no_wait(&self) -> Result<Option<Delivery>> {
        self.broker.receive_no_wait(&self.queue).await
    }

    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        self.broker.acknowledge(delivery).await
    }

    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.broker.reject(delivery, requeue).await
    }
}

/// How a consume cycle ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsumeOutcome<B> {
    /// The time box elapsed, or the queue was drained in no-wait mode
    TimedOut,
    /// The interrupt future resolved while waiting for a delivery
    Interrupted,
    /// The callback asked to stop
    Stopped(B),
}

/// Drives a callback over the deliveries of a subscribed consumer.
#[derive(Default)]
pub struct SubscriptionConsumer {
    consumer: Option<Consumer>,
}

impl SubscriptionConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, consumer: Consumer) {
        self.consumer = Some(consumer);
    }

    pub fn unsubscribe(&mut self) -> Option<Consumer> {
        self.consumer.take()
    }

    /// Runs one consume cycle.
    ///
    /// `timeout` bounds the whole cycle: `None` never times out and
    /// `Some(Duration::ZERO)` only drains what is ready right now. Deliveries
    /// are handed to `callback` one at a time; the cycle ends when it returns
    /// [`ControlFlow::Break`]. `interrupt` is only polled while waiting for
    /// a delivery, never while the callback runs.
    pub async fn consume<F, Fut, B, I>(
        &self,
        timeout: Option<Duration>,
        interrupt: I,
        mut callback: F,
    ) -> Result<ConsumeOutcome<B>>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = ControlFlow<B>>,
        I: Future<Output = ()>,
    {
        let Some(consumer) = &self.consumer else {
            return Ok(ConsumeOutcome::TimedOut);
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let drain_only = timeout == Some(Duration::ZERO);
        tokio::pin!(interrupt);

        loop {
            let receive = async {
                if drain_only {
                    return consumer.receive_no_wait().await;
                }
                match deadline {
                    None => consumer.receive(None).await,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(None);
                        }
                        consumer.receive(Some(deadline - now)).await
                    }
                }
            };

            let delivery = tokio::select! {
                biased;
                _ = &mut interrupt => return Ok(ConsumeOutcome::Interrupted),
                delivery = receive => delivery?,
            };

            let Some(delivery) = delivery else {
                trace!(queue = consumer.queue(), "Consume cycle ended without delivery");
                return Ok(ConsumeOutcome::TimedOut);
            };

            if let ControlFlow::Break(value) = callback(delivery).await {
                return Ok(ConsumeOutcome::Stopped(value));
            }
        }
    }
}
