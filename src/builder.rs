use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use rabbit_worker_lifecycle_hooks::{HookRegistry, LifecycleHooks};
use rabbit_worker_shutdown_signal::shutdown_signal;
use rabbit_worker_task_handler::{run_task_from_job_ctx, TaskHandler};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connector::Connector;
use crate::control::WorkerControl;
use crate::exceptions::{ExceptionHandler, TracingExceptionHandler};
use crate::failed::FailedJobStore;
use crate::memory_probe::{MemoryProbe, ProcessMemory};
use crate::queue::Queue;
use crate::runner::{FallbackDaemon, WorkerFn, WorkerState};
use crate::Worker;
use rabbit_worker_ctx::JobContext;

/// Configuration options for initializing a worker.
///
/// A worker needs at least one source of queues: queues added directly with
/// [`WorkerOptions::add_queue`], a [`Connector`] built from configuration, or
/// a fallback daemon for connections this crate does not consume.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rabbit_worker::{
///     IntoTaskHandlerResult, JobContext, MemoryBroker, Queue, TaskHandler, WorkerOptions,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize, Serialize)]
/// struct SendEmail { to: String }
///
/// impl TaskHandler for SendEmail {
///     const IDENTIFIER: &'static str = "send_email";
///     async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {
///         Ok::<(), String>(())
///     }
/// }
///
/// let queue = Queue::new(Arc::new(MemoryBroker::new()), "rabbitmq", "emails");
/// let worker = WorkerOptions::default()
///     .add_queue(queue)
///     .define_job::<SendEmail>()
///     .init()
///     .unwrap();
/// ```
pub struct WorkerOptions {
    /// Map of job identifiers to handler functions
    jobs: HashMap<String, WorkerFn>,

    /// Queues registered directly, by connection name
    queues: HashMap<String, Queue>,

    connector: Option<Connector>,

    failed_store: Option<FailedJobStore>,

    exception_handler: Arc<dyn ExceptionHandler>,

    control: WorkerControl,

    memory_probe: Arc<dyn MemoryProbe>,

    fallback: Option<Arc<dyn FallbackDaemon>>,

    /// Lifecycle hooks for observing worker events
    hooks: HookRegistry,

    listen_os_signals: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            jobs: HashMap::new(),
            queues: HashMap::new(),
            connector: None,
            failed_store: None,
            exception_handler: Arc::new(TracingExceptionHandler),
            control: WorkerControl::new(),
            memory_probe: Arc::new(ProcessMemory),
            fallback: None,
            hooks: HookRegistry::new(),
            listen_os_signals: true,
        }
    }
}

/// Errors that can occur when initializing a worker.
#[derive(Error, Debug)]
pub enum WorkerBuildError {
    /// Nothing tells the worker where its jobs come from
    #[error("No queue source configured - add a queue, a connector or a fallback daemon")]
    NoQueueSource,
}

impl WorkerOptions {
    /// Initializes a worker with the configured options.
    ///
    /// When no failed job store was given, the one configured on the
    /// connector is used, if any. The exception handler is shared with the
    /// failed job store so scan failures are reported the same way.
    pub fn init(self) -> Result<Worker, WorkerBuildError> {
        if self.queues.is_empty() && self.connector.is_none() && self.fallback.is_none() {
            return Err(WorkerBuildError::NoQueueSource);
        }

        let failed_store = self
            .failed_store
            .or_else(|| {
                self.connector
                    .as_ref()
                    .and_then(|connector| connector.failed_store().ok())
            })
            .map(|store| store.with_exception_handler(self.exception_handler.clone()));

        let mut random_bytes = [0u8; 9];
        rand::rng().fill_bytes(&mut random_bytes);

        let shutdown_token = CancellationToken::new();
        let (state, _) = watch::channel(WorkerState::Idle);

        let worker = Worker {
            worker_id: format!("rabbit_worker_{}", hex::encode(random_bytes)),
            jobs: self.jobs,
            queues: self.queues,
            connector: self.connector,
            failed_store,
            exception_handler: self.exception_handler,
            control: self.control,
            memory_probe: self.memory_probe,
            fallback: self.fallback,
            hooks: Arc::new(self.hooks),
            shutdown_signal: shutdown_signal(shutdown_token.clone(), self.listen_os_signals),
            shutdown_token,
            listen_os_signals: self.listen_os_signals,
            state,
        };

        Ok(worker)
    }

    /// Registers a task handler.
    ///
    /// Jobs whose payload names `T::IDENTIFIER` are deserialized as `T` and
    /// run with it. A job naming a task nobody registered fails like any
    /// other failing job.
    pub fn define_job<T: TaskHandler>(mut self) -> Self {
        let identifier = T::IDENTIFIER;

        let worker_fn =
            move |ctx: JobContext, data: Value| run_task_from_job_ctx::<T>(ctx, data).boxed();

        self.jobs.insert(identifier.to_string(), Box::new(worker_fn));
        self
    }

    /// Makes the queue consumable under its connection name, taking
    /// precedence over the connector.
    pub fn add_queue(mut self, queue: Queue) -> Self {
        self.queues.insert(queue.connection_name().clone(), queue);
        self
    }

    pub fn connector(mut self, value: Connector) -> Self {
        self.connector = Some(value);
        self
    }

    /// Where jobs go once they ran out of attempts.
    ///
    /// # Default
    /// The connector's failed job store. Without any, failed jobs are dropped
    /// with a warning.
    pub fn failed_store(mut self, value: FailedJobStore) -> Self {
        self.failed_store = Some(value);
        self
    }

    /// Receives every error the worker swallows to keep running.
    ///
    /// # Default
    /// [`TracingExceptionHandler`], logging at error level.
    pub fn exception_handler(mut self, value: impl ExceptionHandler) -> Self {
        self.exception_handler = Arc::new(value);
        self
    }

    /// Shares maintenance mode, paused queues and restart broadcasts with
    /// the rest of the application.
    pub fn control(mut self, value: WorkerControl) -> Self {
        self.control = value;
        self
    }

    /// # Default
    /// [`ProcessMemory`]
    pub fn memory_probe(mut self, value: impl MemoryProbe) -> Self {
        self.memory_probe = Arc::new(value);
        self
    }

    /// Runs the connections that are not broker backed.
    pub fn fallback_daemon(mut self, value: impl FallbackDaemon) -> Self {
        self.fallback = Some(Arc::new(value));
        self
    }

    /// Adds a lifecycle hook plugin to the worker.
    ///
    /// Multiple plugins can be registered, they run in registration order.
    ///
    /// ```
    /// use rabbit_worker::{JobFailedContext, LifecycleHooks, WorkerOptions};
    ///
    /// struct AlertOnFailure;
    ///
    /// impl LifecycleHooks for AlertOnFailure {
    ///     async fn on_job_failed(&self, ctx: JobFailedContext) {
    ///         eprintln!("job {} archived: {}", ctx.job.job_id, ctx.error);
    ///     }
    /// }
    ///
    /// let options = WorkerOptions::default().add_plugin(AlertOnFailure);
    /// ```
    pub fn add_plugin<H: LifecycleHooks>(mut self, hook: H) -> Self {
        self.hooks.register(hook);
        self
    }

    /// Whether SIGINT, SIGTERM and SIGQUIT stop the worker and SIGUSR2 and
    /// SIGCONT pause and resume it.
    ///
    /// # Default
    /// `true`. Turn it off in tests and when embedding the worker in a
    /// process that handles signals itself; [`Worker::request_shutdown`]
    /// keeps working.
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_signals = value;
        self
    }
}
