use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::broker::{Broker, Destination};
use crate::error::{BrokerError, Result};
use crate::message::{Delivery, Message};

/// Property read by delayed exchanges, in milliseconds.
const DELAY_PROPERTY: &str = "x-delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Direct,
    Delayed,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
    available_at: Option<Instant>,
    redelivered: bool,
}

impl Entry {
    fn is_ready(&self, now: Instant) -> bool {
        self.available_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryQueue {
    entries: Vec<Entry>,
}

impl MemoryQueue {
    /// Highest priority first, then publication order.
    fn take_next(&mut self, now: Instant) -> Option<Entry> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_ready(now))
            .max_by(|(_, a), (_, b)| {
                let pa = a.message.priority().unwrap_or(0);
                let pb = b.message.priority().unwrap_or(0);
                pa.cmp(&pb).then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        Some(self.entries.remove(index))
    }

    fn insert(&mut self, entry: Entry) {
        let position = self.entries.partition_point(|e| e.seq < entry.seq);
        self.entries.insert(position, entry);
    }

    fn ready_count(&self, now: Instant) -> usize {
        self.entries.iter().filter(|e| e.is_ready(now)).count()
    }

    fn next_available_at(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.available_at)
            .filter(|at| *at > now)
            .min()
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    entry: Entry,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, ExchangeKind>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_seq: u64,
    published: Vec<(Destination, Message)>,
    publish_failures: HashMap<String, usize>,
    disconnected: Option<String>,
    closed: bool,
}

impl State {
    fn check_open(&self) -> Result<()> {
        if let Some(reason) = &self.disconnected {
            return Err(BrokerError::Transport(reason.clone()));
        }
        if self.closed {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: Message, available_at: Option<Instant>) {
        self.next_seq += 1;
        let entry = Entry {
            seq: self.next_seq,
            message,
            available_at,
            redelivered: false,
        };
        self.queues.entry(queue.to_string()).or_default().insert(entry);
    }

    fn pop(&mut self, queue: &str, now: Instant) -> Option<Delivery> {
        let entry = self.queues.get_mut(queue)?.take_next(now)?;
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery::new(entry.message.clone(), tag, queue)
            .with_redelivered(entry.redelivered);
        self.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                entry,
            },
        );
        Some(delivery)
    }
}

/// An in-process broker with the semantics the job queue relies on.
///
/// - ready messages are delivered by priority, then in publication order
/// - a rejected message goes back to its original position
/// - exchanges route to the queue named by the routing key, delayed
///   exchanges hold the message for its `x-delay` milliseconds first
/// - queues spring into existence on first use
///
/// It also records every publish and can simulate transport failures, which
/// makes it the broker of choice for tests.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn declare_exchange(&self, name: impl Into<String>) {
        self.lock().exchanges.insert(name.into(), ExchangeKind::Direct);
    }

    /// Declares an exchange behaving like the delayed message plugin
    /// (`x-delayed-message` with a direct delayed type).
    pub fn declare_delayed_exchange(&self, name: impl Into<String>) {
        self.lock()
            .exchanges
            .insert(name.into(), ExchangeKind::Delayed);
    }

    /// Every message published so far, in order, as it was handed to the broker.
    pub fn published(&self) -> Vec<(Destination, Message)> {
        self.lock().published.clone()
    }

    /// Messages currently stored in `queue`, delayed ones included, in
    /// publication order.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready_count(now))
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Makes the next `times` publishes to `destination` (queue or exchange
    /// name) fail with a transport error.
    pub fn fail_next_publishes(&self, destination: impl Into<String>, times: usize) {
        self.lock().publish_failures.insert(destination.into(), times);
    }

    /// Simulates a lost connection: every following operation fails.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.lock().disconnected = Some(reason.into());
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, destination: &Destination, mut message: Message) -> Result<()> {
        {
            let mut state = self.lock();
            state.check_open()?;

            if let Some(remaining) = state.publish_failures.get_mut(destination.name()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BrokerError::Transport(format!(
                        "publish to '{}' failed",
                        destination.name()
                    )));
                }
            }

            state.published.push((destination.clone(), message.clone()));

            match destination {
                Destination::Queue(queue) => {
                    message.set_routing_key(queue.clone());
                    state.enqueue(queue, message, None);
                }
                Destination::Exchange { name, routing_key } => {
                    let kind = *state.exchanges.get(name).ok_or_else(|| {
                        BrokerError::operation(name.clone(), "no exchange with this name")
                    })?;
                    let available_at = match kind {
                        ExchangeKind::Direct => None,
                        ExchangeKind::Delayed => message
                            .property(DELAY_PROPERTY)
                            .and_then(|v| v.as_i64())
                            .filter(|ms| *ms > 0)
                            .map(|ms| Instant::now() + Duration::from_millis(ms as u64)),
                    };
                    trace!(exchange = name.as_str(), routing_key = routing_key.as_str(), delayed = available_at.is_some(), "Routing message");
                    message.set_routing_key(routing_key.clone());
                    state.enqueue(routing_key, message, available_at);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_available = {
                let mut state = self.lock();
                state.check_open()?;
                let now = Instant::now();
                if let Some(delivery) = state.pop(queue, now) {
                    return Ok(Some(delivery));
                }
                if deadline.is_some_and(|d| now >= d) {
                    return Ok(None);
                }
                state
                    .queues
                    .get(queue)
                    .and_then(|q| q.next_available_at(now))
            };

            let wake_at = match (deadline, next_available) {
                (Some(d), Some(n)) => Some(d.min(n)),
                (d, n) => d.or(n),
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.lock();
        state.check_open()?;
        Ok(state.pop(queue, Instant::now()))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state
            .unacked
            .remove(delivery.delivery_tag())
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(*delivery.delivery_tag()))
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        {
            let mut state = self.lock();
            state.check_open()?;
            let Unacked { queue, mut entry } = state
                .unacked
                .remove(delivery.delivery_tag())
                .ok_or(BrokerError::UnknownDelivery(*delivery.delivery_tag()))?;

            if !requeue {
                debug!(queue = queue.as_str(), delivery_tag = delivery.delivery_tag(), "Dropping rejected message");
                return Ok(());
            }

            if let Some(target) = state.queues.get_mut(&queue) {
                entry.redelivered = true;
                entry.available_at = None;
                target.insert(entry);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<u32> {
        let mut state = self.lock();
        state.check_open()?;
        let count = state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready_count(Instant::now());
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state.queues.remove(queue);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        let now = Instant::now();
        if let Some(q) = state.queues.get_mut(queue) {
            q.entries.retain(|e| !e.is_ready(now));
        }
        Ok(())
    }

    async fn create_temporary_queue(&self) -> Result<String> {
        let mut state = self.lock();
        state.check_open()?;
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        state.queues.insert(name.clone(), MemoryQueue::default());
        Ok(name)
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str, priority: Option<u8>) -> Message {
        let mut message = Message::new(body);
        if let Some(priority) = priority {
            message.set_priority(priority);
        }
        message
    }

    fn body(delivery: &Delivery) -> String {
        String::from_utf8_lossy(delivery.message().body()).into_owned()
    }

    #[tokio::test]
    async fn delivers_by_priority_then_fifo() {
        let broker = MemoryBroker::new();
        let queue = Destination::queue("jobs");
        broker.publish(&queue, message("a", None)).await.unwrap();
        broker.publish(&queue, message("b", Some(5))).await.unwrap();
        broker.publish(&queue, message("c", None)).await.unwrap();
        broker.publish(&queue, message("d", Some(5))).await.unwrap();

        let mut order = vec![];
        while let Some(delivery) = broker.receive_no_wait("jobs").await.unwrap() {
            order.push(body(&delivery));
            broker.acknowledge(&delivery).await.unwrap();
        }
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn rejected_message_keeps_its_position() {
        let broker = MemoryBroker::new();
        let queue = Destination::queue("jobs");
        broker.publish(&queue, message("a", None)).await.unwrap();
        broker.publish(&queue, message("b", None)).await.unwrap();

        let first = broker.receive_no_wait("jobs").await.unwrap().unwrap();
        broker.reject(&first, true).await.unwrap();

        let again = broker.receive_no_wait("jobs").await.unwrap().unwrap();
        assert_eq!(body(&again), "a");
        assert!(*again.redelivered());
        assert_eq!(
            broker.acknowledge(&first).await,
            Err(BrokerError::UnknownDelivery(*first.delivery_tag()))
        );
    }

    #[tokio::test]
    async fn reject_without_requeue_drops_the_message() {
        let broker = MemoryBroker::new();
        broker
            .publish(&Destination::queue("jobs"), message("a", None))
            .await
            .unwrap();
        let delivery = broker.receive_no_wait("jobs").await.unwrap().unwrap();
        broker.reject(&delivery, false).await.unwrap();
        assert_eq!(broker.declare_queue("jobs").await.unwrap(), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_exchange_holds_messages() {
        let broker = MemoryBroker::new();
        broker.declare_delayed_exchange("delayed");
        let mut delayed = message("late", None);
        delayed.set_property(DELAY_PROPERTY, 2000);
        broker
            .publish(&Destination::exchange("delayed", "jobs"), delayed)
            .await
            .unwrap();

        assert_eq!(broker.declare_queue("jobs").await.unwrap(), 0);
        assert!(broker.receive_no_wait("jobs").await.unwrap().is_none());

        let start = Instant::now();
        let delivery = broker
            .receive("jobs", Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("delayed message should arrive");
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert_eq!(delivery.message().routing_key().as_deref(), Some("jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let broker = MemoryBroker::new();
        let start = Instant::now();
        let delivery = broker
            .receive("empty", Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert!(delivery.is_none());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn publishing_to_unknown_exchange_is_refused() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish(&Destination::exchange("nope", "jobs"), message("a", None))
            .await
            .unwrap_err();
        assert!(!err.is_transport_fault());
    }

    #[tokio::test]
    async fn simulated_failures_are_transport_faults() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes("jobs", 1);
        let queue = Destination::queue("jobs");
        let err = broker.publish(&queue, message("a", None)).await.unwrap_err();
        assert!(err.is_transport_fault());
        broker.publish(&queue, message("a", None)).await.unwrap();

        broker.disconnect("connection reset by peer");
        let err = broker.declare_queue("jobs").await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::Transport("connection reset by peer".to_string())
        );
    }

    #[tokio::test]
    async fn temporary_queues_are_unique_and_deletable() {
        let broker = MemoryBroker::new();
        let a = broker.create_temporary_queue().await.unwrap();
        let b = broker.create_temporary_queue().await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("amq.gen-"));
        broker.delete_queue(&a).await.unwrap();
        assert!(!broker.queue_exists(&a));
        assert!(broker.queue_exists(&b));
    }

    #[tokio::test]
    async fn closed_broker_refuses_operations() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        assert!(broker.is_closed());
        assert_eq!(
            broker.receive_no_wait("jobs").await.unwrap_err(),
            BrokerError::Closed
        );
    }
}
