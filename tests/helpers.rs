#![allow(dead_code)]

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rabbit_worker::{
    DaemonOptions, DaemonOptionsBuilder, ExceptionHandler, FailedJobStore, MemoryBroker, Queue,
    RabbitWorkerError, WorkerOptions,
};
use tokio::sync::Mutex;
use tokio::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const CONNECTION: &str = "rabbitmq";
pub const JOBS_QUEUE: &str = "jobs";
pub const FAILED_QUEUE: &str = "failed";
pub const DELAYED_EXCHANGE: &str = "jobs.delayed";

/// A memory broker with a job queue and a failed job store on top of it.
pub struct TestBroker {
    pub broker: Arc<MemoryBroker>,
    pub queue: Queue,
    pub failed: FailedJobStore,
}

impl TestBroker {
    pub fn new() -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let queue = Queue::new(broker.clone(), CONNECTION, JOBS_QUEUE);
        let failed = FailedJobStore::new(broker.clone(), FAILED_QUEUE);
        TestBroker {
            broker,
            queue,
            failed,
        }
    }

    pub fn with_delayed_exchange() -> Self {
        let mut test_broker = Self::new();
        test_broker.broker.declare_delayed_exchange(DELAYED_EXCHANGE);
        test_broker.queue = test_broker.queue.with_delayed_exchange(DELAYED_EXCHANGE);
        test_broker
    }

    /// Worker options consuming this broker, without OS signal handling and
    /// without memory limit.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .add_queue(self.queue.clone())
            .failed_store(self.failed.clone())
            .listen_os_shutdown_signals(false)
            .memory_probe(|| None::<u64>)
    }
}

/// Drains the queue then stops, waiting only briefly between put backs.
pub fn drain_options() -> DaemonOptionsBuilder {
    DaemonOptionsBuilder::new()
        .stop_when_empty(true)
        .sleep(Duration::from_millis(5))
}

pub fn drain() -> DaemonOptions {
    drain_options().build()
}

/// Collects reported errors as strings.
#[derive(Clone, Default)]
pub struct RecordingExceptionHandler {
    pub errors: Arc<StdMutex<Vec<String>>>,
}

impl RecordingExceptionHandler {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExceptionHandler for RecordingExceptionHandler {
    fn report(&self, error: &RabbitWorkerError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}
async fn init_job_count() -> Mutex<u32> {
    Mutex::new(0)
}
impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let filter_layer = EnvFilter::try_new("debug").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
