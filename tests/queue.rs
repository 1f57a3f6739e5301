use rabbit_worker::properties;
use rabbit_worker::{
    Destination, IntoTaskHandlerResult, JobContext, PushOptions, RabbitWorkerError, TaskHandler,
};
use serde::{Deserialize, Serialize};

use crate::helpers::{TestBroker, DELAYED_EXCHANGE, JOBS_QUEUE};

mod helpers;

#[derive(Serialize, Deserialize)]
struct SendInvoice {
    invoice_id: u64,
}

impl TaskHandler for SendInvoice {
    const IDENTIFIER: &'static str = "send_invoice";

    async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {}
}

#[derive(Serialize, Deserialize)]
struct Urgent {
    id: u32,
}

impl TaskHandler for Urgent {
    const IDENTIFIER: &'static str = "urgent";

    async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {}

    fn priority(&self) -> Option<i32> {
        Some(7)
    }
}

#[tokio::test]
async fn pushed_job_pops_with_priority_and_first_attempt() {
    let test_broker = TestBroker::new();
    let id = test_broker
        .queue
        .push(
            &SendInvoice { invoice_id: 42 },
            PushOptions::builder().priority(200).build(),
        )
        .await
        .unwrap();

    let job = test_broker.queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.job_id(), id);
    assert_eq!(job.attempts(), 1);
    assert_eq!(job.message().priority(), Some(200));
    assert_eq!(job.payload().job(), "send_invoice");
    assert_eq!(job.payload().data()["invoice_id"], 42);
    assert!(job.message().is_persistent());
    job.delete().await.unwrap();

    assert!(test_broker.queue.pop(None).await.unwrap().is_none());
}

#[tokio::test]
async fn out_of_range_priorities_are_clamped() {
    let test_broker = TestBroker::new();
    for priority in [300, -5] {
        test_broker
            .queue
            .push(
                &SendInvoice { invoice_id: 1 },
                PushOptions::builder().priority(priority).build(),
            )
            .await
            .unwrap();
    }

    let priorities: Vec<_> = test_broker
        .broker
        .messages(JOBS_QUEUE)
        .iter()
        .map(|m| m.priority())
        .collect();
    assert_eq!(priorities, vec![Some(255), Some(0)]);
}

#[tokio::test]
async fn job_priority_wins_over_push_options() {
    let test_broker = TestBroker::new();
    test_broker
        .queue
        .push(&Urgent { id: 1 }, PushOptions::builder().priority(1).build())
        .await
        .unwrap();

    let job = test_broker.queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.message().priority(), Some(7));
}

#[tokio::test]
async fn later_goes_through_the_delayed_exchange() {
    let test_broker = TestBroker::with_delayed_exchange();
    test_broker
        .queue
        .later(10, &SendInvoice { invoice_id: 1 }, PushOptions::default())
        .await
        .unwrap();

    let (destination, message) = test_broker.broker.published().pop().unwrap();
    assert_eq!(destination, Destination::exchange(DELAYED_EXCHANGE, JOBS_QUEUE));
    assert_eq!(
        message.property(properties::DELAY).and_then(|v| v.as_i64()),
        Some(10_000)
    );

    // Held by the exchange, not ready yet
    assert_eq!(test_broker.queue.size(None).await.unwrap(), 0);
    assert!(test_broker.queue.pop(None).await.unwrap().is_none());
}

#[tokio::test]
async fn delay_without_exchange_is_delivered_right_away() {
    let test_broker = TestBroker::new();
    test_broker
        .queue
        .later(30, &SendInvoice { invoice_id: 1 }, PushOptions::default())
        .await
        .unwrap();

    let (destination, message) = test_broker.broker.published().pop().unwrap();
    assert_eq!(destination, Destination::queue(JOBS_QUEUE));
    assert!(message.property(properties::DELAY).is_none());
    assert_eq!(test_broker.queue.size(None).await.unwrap(), 1);
}

#[tokio::test]
async fn size_counts_ready_messages_per_queue() {
    let test_broker = TestBroker::new();
    for invoice_id in 0..3 {
        test_broker
            .queue
            .push(&SendInvoice { invoice_id }, PushOptions::default())
            .await
            .unwrap();
    }
    test_broker
        .queue
        .push(
            &SendInvoice { invoice_id: 9 },
            PushOptions::builder().queue("invoices.retry").build(),
        )
        .await
        .unwrap();

    assert_eq!(test_broker.queue.size(None).await.unwrap(), 3);
    assert_eq!(
        test_broker.queue.size(Some("invoices.retry")).await.unwrap(),
        1
    );
    assert_eq!(test_broker.queue.size(Some("unknown")).await.unwrap(), 0);

    let job = test_broker
        .queue
        .pop(Some("invoices.retry"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.queue(), "invoices.retry");
}

#[tokio::test]
async fn released_job_counts_attempts() {
    let test_broker = TestBroker::new();
    test_broker
        .queue
        .push(&SendInvoice { invoice_id: 1 }, PushOptions::default())
        .await
        .unwrap();

    for expected in 1..=3 {
        let job = test_broker.queue.pop(None).await.unwrap().unwrap();
        assert_eq!(job.attempts(), expected);
        job.release(0).await.unwrap();
    }
    assert_eq!(test_broker.broker.unacked_count(), 0);
}

#[tokio::test]
async fn popping_a_malformed_message_drops_it() {
    let test_broker = TestBroker::new();
    test_broker
        .queue
        .push_raw("{\"not\": \"a job\"}", PushOptions::default())
        .await
        .unwrap();

    let error = test_broker.queue.pop(None).await.unwrap_err();
    assert!(matches!(error, RabbitWorkerError::MalformedMessage { .. }));
    assert!(test_broker.broker.messages(JOBS_QUEUE).is_empty());
    assert_eq!(test_broker.broker.unacked_count(), 0);
}
