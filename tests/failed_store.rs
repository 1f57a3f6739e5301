use std::sync::Arc;

use rabbit_worker::{FailedJobStore, MemoryBroker, RabbitWorkerError};

use crate::helpers::{RecordingExceptionHandler, FAILED_QUEUE};

mod helpers;

async fn store_with(records: &[&str]) -> (Arc<MemoryBroker>, FailedJobStore, Vec<String>) {
    let broker = Arc::new(MemoryBroker::new());
    let store = FailedJobStore::new(broker.clone(), FAILED_QUEUE);
    let mut ids = Vec::new();
    for payload in records {
        let id = store
            .log("rabbitmq", "jobs", payload.as_bytes(), "boom")
            .await
            .unwrap();
        ids.push(id);
    }
    (broker, store, ids)
}

#[tokio::test]
async fn all_preserves_archive_order() {
    let (_, store, ids) = store_with(&["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]).await;

    let records = store.all().await.unwrap();
    let listed: Vec<_> = records.iter().map(|r| r.id().clone()).collect();
    assert_eq!(listed, ids);
    assert_eq!(records[1].payload(), "{\"b\":2}");
    assert_eq!(records[1].queue().as_deref(), Some("jobs"));
    assert_eq!(records[1].exception().as_deref(), Some("boom"));
    assert!(records[1].failed_at().is_some());

    // Scanning twice yields the same order
    let again: Vec<_> = store
        .all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id().clone())
        .collect();
    assert_eq!(again, ids);
}

#[tokio::test]
async fn find_forget_and_flush() {
    let (_, store, ids) = store_with(&["a", "b", "c"]).await;

    let found = store.find(&ids[1]).await.unwrap().unwrap();
    assert_eq!(found.payload(), "b");
    assert!(store.find("failed-job-ffffffffffffffff").await.unwrap().is_none());
    assert!(store.find("not an id").await.unwrap().is_none());

    assert!(store.forget(&ids[1]).await.unwrap());
    assert!(!store.forget(&ids[1]).await.unwrap());

    let remaining: Vec<_> = store
        .all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id().clone())
        .collect();
    assert_eq!(remaining, vec![ids[0].clone(), ids[2].clone()]);
    assert_eq!(store.count().await.unwrap(), 2);

    store.flush().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(store.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_publish_failure_is_reported_and_nothing_is_lost() {
    let (broker, store, ids) = store_with(&["a", "b", "c"]).await;
    let handler = RecordingExceptionHandler::default();
    let store = store.with_exception_handler(Arc::new(handler.clone()));

    // The first message moved back into the archive fails once
    broker.fail_next_publishes(FAILED_QUEUE, 1);
    assert!(store.forget(&ids[1]).await.unwrap());

    let errors = handler.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(&ids[0]));

    let mut remaining: Vec<_> = store
        .all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id().clone())
        .collect();
    remaining.sort();
    let mut expected = vec![ids[0].clone(), ids[2].clone()];
    expected.sort();
    assert_eq!(remaining, expected);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn broken_connection_surfaces_as_broker_error() {
    let (broker, store, _) = store_with(&["a"]).await;
    broker.disconnect("connection refused");

    let error = store.all().await.unwrap_err();
    assert!(matches!(error, RabbitWorkerError::Broker(_)));
    assert!(error.is_transport_fault());
}
