use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use getset::Getters;
use rabbit_worker_broker::{
    BrokerError, ConsumeOutcome, Consumer, Delivery, SubscriptionConsumer,
};
use rabbit_worker_ctx::JobContext;
use rabbit_worker_lifecycle_hooks::{
    HookRegistry, JobExceptionContext, JobFailedContext, JobInfo, JobProcessedContext,
    JobProcessingContext, JobReleasedContext, WorkerStartContext, WorkerStopReason,
    WorkerStoppingContext,
};
use rabbit_worker_shutdown_signal::{control_signals, ControlSignal, ShutdownSignal};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::builder::WorkerOptions;
use crate::connector::Connector;
use crate::control::WorkerControl;
use crate::daemon_options::DaemonOptions;
use crate::errors::RabbitWorkerError;
use crate::exceptions::{caused_by_lost_connection, ExceptionHandler};
use crate::failed::FailedJobStore;
use crate::job::Job;
use crate::memory_probe::MemoryProbe;
use crate::queue::{ConversionError, Queue};

/// Type alias for task handler functions.
///
/// Takes the job context and the `data` of the payload, resolves to the
/// error message when the task fails.
pub type WorkerFn = Box<
    dyn Fn(JobContext, Value) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// Runs queue connections this crate does not consume itself.
#[async_trait]
pub trait FallbackDaemon: Send + Sync + 'static {
    async fn daemon(
        &self,
        connection_name: &str,
        queues: &[&str],
        options: &DaemonOptions,
    ) -> Result<WorkerStopReason, WorkerRuntimeError>;
}

/// Where a worker stands, observable through [`Worker::subscribe_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Subscribing,
    Dispatching,
    Stopping,
    Stopped,
}

/// Consumes queue connections and runs their jobs, one at a time.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier for this worker instance
    pub(crate) worker_id: String,
    /// Map of task identifiers to their handler functions
    #[getset(skip)]
    pub(crate) jobs: HashMap<String, WorkerFn>,
    /// Queues registered directly, by connection name
    #[getset(skip)]
    pub(crate) queues: HashMap<String, Queue>,
    pub(crate) connector: Option<Connector>,
    /// Where jobs go once they ran out of attempts
    pub(crate) failed_store: Option<FailedJobStore>,
    #[getset(skip)]
    pub(crate) exception_handler: Arc<dyn ExceptionHandler>,
    pub(crate) control: WorkerControl,
    #[getset(skip)]
    pub(crate) memory_probe: Arc<dyn MemoryProbe>,
    #[getset(skip)]
    pub(crate) fallback: Option<Arc<dyn FallbackDaemon>>,
    #[getset(skip)]
    pub(crate) hooks: Arc<HookRegistry>,
    /// Resolves once a shutdown is requested
    pub(crate) shutdown_signal: ShutdownSignal,
    #[getset(skip)]
    pub(crate) shutdown_token: CancellationToken,
    /// Whether SIGUSR2/SIGCONT pause and resume the worker
    #[getset(skip)]
    pub(crate) listen_os_signals: bool,
    #[getset(skip)]
    pub(crate) state: watch::Sender<WorkerState>,
}

/// Errors that stop a daemon run.
#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    /// The queue connection could not be set up
    #[error("Failed to set up queue connection: {0}")]
    Queue(#[from] RabbitWorkerError),
    /// The broker refused to let the worker consume
    #[error("Failed to consume from the broker: {0}")]
    Consume(#[from] BrokerError),
    /// The fallback daemon failed
    #[error("Fallback daemon failed: {0}")]
    Fallback(String),
}

/// Errors that can occur during the execution of a job's task handler.
#[derive(Error, Debug)]
enum RunJobError {
    /// No task handler function was registered for the given task identifier
    #[error("Cannot find any task fn for given task identifier '{0}'")]
    FnNotFound(String),
    /// The task handler panicked during execution
    #[error("Task failed execution to complete : {0}")]
    TaskPanic(#[from] tokio::task::JoinError),
    /// The task handler returned an error string
    #[error("Task returned the following error : {0}")]
    TaskError(String),
    /// The task ran longer than allowed and was aborted
    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),
    /// The job was delivered more times than it may be attempted
    #[error("Job has been attempted too many times ({attempts} of {max_tries})")]
    MaxAttemptsExceeded { attempts: u32, max_tries: u32 },
}

impl Worker {
    /// Creates a new `WorkerOptions` builder with default settings.
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    /// Stops every running daemon once its current job is done.
    pub fn request_shutdown(&self) {
        self.shutdown_token.cancel();
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// The broker backed queue of `connection_name`, `None` when the
    /// connection should go to the fallback daemon.
    fn broker_queue(&self, connection_name: &str) -> Result<Option<Queue>, RabbitWorkerError> {
        if let Some(queue) = self.queues.get(connection_name) {
            return Ok(Some(queue.clone()));
        }
        match &self.connector {
            Some(connector) if connector.is_broker_backed(connection_name) => {
                connector.connect(connection_name).map(Some)
            }
            _ if self.fallback.is_some() => Ok(None),
            Some(connector) => connector.connect(connection_name).map(Some),
            None => Err(RabbitWorkerError::InvalidConfiguration(format!(
                "Unknown queue connection '{connection_name}'"
            ))),
        }
    }

    fn consumer_tag(&self, connection_name: &str, options: &DaemonOptions) -> Option<String> {
        let prefix = options.consumer_tag().as_deref().or_else(|| {
            self.connector
                .as_ref()
                .and_then(|c| c.consumer_tag(connection_name))
        })?;
        let mut suffix = [0u8; 4];
        rand::rng().fill_bytes(&mut suffix);
        Some(format!("{prefix}-{}", hex::encode(suffix)))
    }

    /// Consumes the queue of `connection_name` until a stop condition fires.
    ///
    /// `queues` are the queue names checked against the paused queues of
    /// [`WorkerControl`]; when empty the bound queue's name is used.
    /// Connections that are not broker backed are handed to the fallback
    /// daemon.
    pub async fn daemon(
        &self,
        connection_name: &str,
        queues: &[&str],
        options: &DaemonOptions,
    ) -> Result<WorkerStopReason, WorkerRuntimeError> {
        let Some(queue) = self.broker_queue(connection_name)? else {
            let fallback = self.fallback.as_ref().ok_or_else(|| {
                RabbitWorkerError::InvalidConfiguration(format!(
                    "Queue connection '{connection_name}' is not broker backed"
                ))
            })?;
            debug!(connection = connection_name, "Delegating to fallback daemon");
            return fallback.daemon(connection_name, queues, options).await;
        };

        let queue_names = if queues.is_empty() {
            vec![queue.queue_name().clone()]
        } else {
            queues.iter().map(|q| q.to_string()).collect()
        };
        let consumer = Consumer::new(queue.broker().clone(), queue.queue_name())
            .with_tag(self.consumer_tag(connection_name, options));

        // Keeps the shared signal polled, so OS signals are seen while a job runs
        let signal_watcher = tokio::spawn(self.shutdown_signal.clone());

        let run = DaemonRun {
            worker: self,
            queue,
            consumer,
            options,
            queue_names,
            started: Instant::now(),
            restart_epoch: self.control.restart_epoch(),
            jobs_processed: AtomicU64::new(0),
            should_quit: AtomicBool::new(false),
            broker_fault: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            controls: Mutex::new(self.listen_os_signals.then(control_signals)),
        };

        let result = run.run().await;
        signal_watcher.abort();

        self.set_state(WorkerState::Stopping);
        if let Err(e) = run.queue.broker().close().await {
            warn!(error = ?e, "Failed to close broker connection");
        }

        let reason = match &result {
            Ok(reason) => *reason,
            Err(_) => WorkerStopReason::BrokerFault,
        };
        self.hooks
            .emit(WorkerStoppingContext {
                worker_id: self.worker_id.clone(),
                connection_name: connection_name.to_string(),
                reason,
            })
            .await;
        self.set_state(WorkerState::Stopped);

        match &result {
            Ok(reason) => info!(worker_id = self.worker_id.as_str(), connection = connection_name, reason = ?reason, "Worker stopped"),
            Err(e) => error!(worker_id = self.worker_id.as_str(), connection = connection_name, error = ?e, "Worker stopped with an error"),
        }
        result
    }
}

/// State of one daemon run.
///
/// Shared by reference with the consume callback, hence the interior
/// mutability.
struct DaemonRun<'a> {
    worker: &'a Worker,
    queue: Queue,
    consumer: Consumer,
    options: &'a DaemonOptions,
    queue_names: Vec<String>,
    started: Instant,
    restart_epoch: u64,
    jobs_processed: AtomicU64,
    should_quit: AtomicBool,
    broker_fault: AtomicBool,
    paused: AtomicBool,
    controls: Mutex<Option<mpsc::UnboundedReceiver<ControlSignal>>>,
}

impl DaemonRun<'_> {
    async fn run(&self) -> Result<WorkerStopReason, WorkerRuntimeError> {
        let worker = self.worker;
        let connection_name = self.queue.connection_name().as_str();

        worker
            .hooks
            .emit(WorkerStartContext {
                worker_id: worker.worker_id.clone(),
                connection_name: connection_name.to_string(),
                queue: self.queue.queue_name().clone(),
                consumer_tag: self.consumer.tag().map(str::to_string),
            })
            .await;
        info!(
            worker_id = worker.worker_id.as_str(),
            connection = connection_name,
            queue = self.queue.queue_name().as_str(),
            "Worker started"
        );

        let mut subscription = SubscriptionConsumer::new();
        subscription.subscribe(self.consumer.clone());
        let timeout = self.options.consume_timeout(*self.queue.time_to_run());

        let reason = loop {
            worker.set_state(WorkerState::Subscribing);
            let outcome = subscription
                .consume(timeout, worker.shutdown_signal.clone(), |delivery| {
                    self.handle(delivery)
                })
                .await;

            match outcome {
                Ok(ConsumeOutcome::Stopped(reason)) => break reason,
                Ok(ConsumeOutcome::Interrupted) => break WorkerStopReason::Quit,
                Ok(ConsumeOutcome::TimedOut) => {
                    if let Some(reason) = self.need_to_stop(false) {
                        break reason;
                    }
                    if !self.queue.should_resume() {
                        break WorkerStopReason::ConsumeTimeout;
                    }
                    trace!(connection = connection_name, "Resuming consumption");
                }
                Err(e) if e.is_transport_fault() => {
                    self.report(&RabbitWorkerError::Broker(e));
                    break WorkerStopReason::BrokerFault;
                }
                Err(e) => {
                    subscription.unsubscribe();
                    return Err(e.into());
                }
            }
        };

        subscription.unsubscribe();
        Ok(reason)
    }

    fn drain_control_signals(&self) {
        let mut controls = self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(receiver) = controls.as_mut() else {
            return;
        };
        while let Ok(signal) = receiver.try_recv() {
            let paused = signal == ControlSignal::Pause;
            info!(paused, "Worker received a control signal");
            self.paused.store(paused, Ordering::SeqCst);
        }
    }

    /// Whether jobs may run right now.
    fn should_run(&self) -> bool {
        let control = &self.worker.control;
        if control.is_down_for_maintenance() && !*self.options.force() {
            return false;
        }
        if self.paused.load(Ordering::SeqCst) {
            return false;
        }
        let connection_name = self.queue.connection_name();
        !self
            .queue_names
            .iter()
            .any(|queue| control.is_paused(connection_name, queue))
    }

    /// Checks the stop conditions, in order of precedence.
    fn need_to_stop(&self, job_seen: bool) -> Option<WorkerStopReason> {
        if self.broker_fault.load(Ordering::SeqCst) {
            return Some(WorkerStopReason::BrokerFault);
        }
        if self.should_quit.load(Ordering::SeqCst) || self.worker.shutdown_token.is_cancelled() {
            return Some(WorkerStopReason::Quit);
        }
        let memory_limit = *self.options.memory();
        if memory_limit > 0
            && self
                .worker
                .memory_probe
                .resident_megabytes()
                .is_some_and(|used| used >= memory_limit)
        {
            return Some(WorkerStopReason::MemoryExceeded);
        }
        if self.worker.control.restart_epoch() != self.restart_epoch {
            return Some(WorkerStopReason::Restart);
        }
        if *self.options.stop_when_empty() && !job_seen {
            return Some(WorkerStopReason::QueueEmpty);
        }
        if self
            .options
            .max_jobs()
            .is_some_and(|max| self.jobs_processed.load(Ordering::SeqCst) >= max)
        {
            return Some(WorkerStopReason::MaxJobs);
        }
        if self
            .options
            .max_time()
            .is_some_and(|max| self.started.elapsed() >= max)
        {
            return Some(WorkerStopReason::MaxTime);
        }
        None
    }

    fn report(&self, error: &RabbitWorkerError) {
        self.worker.exception_handler.report(error);
        self.stop_if_lost_connection(error);
    }

    fn stop_if_lost_connection(&self, error: &RabbitWorkerError) {
        if error.is_transport_fault() {
            error!(error = %error, "Broker connection failed, stopping worker");
            self.broker_fault.store(true, Ordering::SeqCst);
        } else if caused_by_lost_connection(error) {
            warn!(error = %error, "Lost connection detected, stopping worker");
            self.should_quit.store(true, Ordering::SeqCst);
        }
    }

    /// Sleeps, waking early when a shutdown is requested.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {},
            _ = self.worker.shutdown_token.cancelled() => {},
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) {
        if let Err(e) = self.consumer.reject(delivery, requeue).await {
            self.report(&RabbitWorkerError::Broker(e));
        }
    }

    /// Handles one delivery of the consume cycle.
    async fn handle(&self, delivery: Delivery) -> ControlFlow<WorkerStopReason> {
        self.drain_control_signals();

        if self.broker_fault.load(Ordering::SeqCst) || self.should_quit.load(Ordering::SeqCst) {
            self.reject(&delivery, true).await;
            return ControlFlow::Break(self.need_to_stop(true).unwrap_or(WorkerStopReason::Quit));
        }

        if !self.should_run() {
            trace!(queue = delivery.queue().as_str(), "Worker should not run, putting message back");
            self.reject(&delivery, true).await;
            self.pause(*self.options.sleep()).await;
            // Nothing ran, so a draining worker is done
            return match self.need_to_stop(false) {
                Some(reason) => ControlFlow::Break(reason),
                None => ControlFlow::Continue(()),
            };
        }

        match self.queue.convert_delivery(delivery) {
            Ok(job) => {
                self.worker.set_state(WorkerState::Dispatching);
                self.process(job).await;
                self.jobs_processed.fetch_add(1, Ordering::SeqCst);
                if let Some(rest) = self.options.rest() {
                    self.pause(*rest).await;
                }
                self.worker.set_state(WorkerState::Subscribing);
            }
            Err(ConversionError { delivery, source }) => {
                self.reject(&delivery, false).await;
                self.report(&source);
                self.pause(*self.options.sleep()).await;
            }
        }

        match self.need_to_stop(true) {
            Some(reason) => ControlFlow::Break(reason),
            None => ControlFlow::Continue(()),
        }
    }

    fn job_info(&self, job: &Job) -> JobInfo {
        JobInfo {
            worker_id: self.worker.worker_id.clone(),
            connection_name: job.connection_name().to_string(),
            queue: job.queue().to_string(),
            job_id: job.job_id().to_string(),
            attempts: job.attempts(),
        }
    }

    async fn process(&self, mut job: Job) {
        let info = self.job_info(&job);
        let max_tries = job.payload().max_tries().unwrap_or(*self.options.max_tries());

        self.worker
            .hooks
            .emit(JobProcessingContext { job: info.clone() })
            .await;

        if max_tries > 0 && job.attempts() > max_tries {
            let error = RunJobError::MaxAttemptsExceeded {
                attempts: job.attempts(),
                max_tries,
            };
            self.fail_job(job, info, error).await;
            return;
        }

        let start = Instant::now();
        match self.run_job(&mut job).await {
            Ok(release) => {
                let duration = start.elapsed();
                info!(
                    task_identifier = job.payload().job().as_str(),
                    job_id = job.job_id(),
                    duration = duration.as_millis(),
                    "Completed task with success"
                );
                self.complete_job(job, info.clone(), release).await;
                self.worker
                    .hooks
                    .emit(JobProcessedContext {
                        job: info,
                        duration,
                    })
                    .await;
            }
            Err(e) => {
                let will_retry = max_tries == 0 || job.attempts() < max_tries;
                let error_str = e.to_string();

                self.worker
                    .hooks
                    .emit(JobExceptionContext {
                        job: info.clone(),
                        error: error_str.clone(),
                        will_retry,
                    })
                    .await;
                self.report(&RabbitWorkerError::Job {
                    job_id: info.job_id.clone(),
                    message: error_str,
                });

                if will_retry {
                    warn!(
                        error = ?e,
                        task_identifier = job.payload().job().as_str(),
                        job_id = job.job_id(),
                        attempts = job.attempts(),
                        "Failed task"
                    );
                    let delay = job
                        .payload()
                        .backoff_delay()
                        .unwrap_or(*self.options.backoff());
                    self.release_job(job, info, delay).await;
                } else {
                    self.fail_job(job, info, e).await;
                }
            }
        }
    }

    #[tracing::instrument(
        "run_job",
        skip(self, job),
        fields(
            job_id = job.job_id(),
            queue = job.queue(),
            task_identifier = job.payload().job().as_str(),
            attempts = job.attempts(),
        )
    )]
    async fn run_job(&self, job: &mut Job) -> Result<Option<Duration>, RunJobError> {
        let task_fn = self
            .worker
            .jobs
            .get(job.payload().job())
            .ok_or_else(|| RunJobError::FnNotFound(job.payload().job().clone()))?;

        let state = job.state().clone();
        let ctx = JobContext::new(
            job.job_id(),
            job.queue(),
            job.connection_name(),
            job.attempts(),
            self.worker.worker_id.clone(),
            state,
        );
        let task_fut = task_fn(ctx.clone(), job.payload().data().clone());

        let job_task = tokio::spawn(task_fut.instrument(Span::current()));
        let abort_handle = job_task.abort_handle();

        let timeout = job
            .payload()
            .timeout_duration()
            .or_else(|| self.options.job_timeout());
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, job_task).await {
                Ok(result) => result,
                Err(_) => {
                    abort_handle.abort();
                    warn!(job_id = job.job_id(), timeout = ?timeout, "Job timed out and was aborted");
                    job.set_state(ctx.state_snapshot().await);
                    return Err(RunJobError::TimedOut(timeout));
                }
            },
            None => job_task.await,
        };

        job.set_state(ctx.state_snapshot().await);
        match result {
            Err(e) => Err(RunJobError::TaskPanic(e)),
            Ok(Err(e)) => Err(RunJobError::TaskError(e)),
            Ok(Ok(())) => Ok(ctx.release_requested()),
        }
    }

    async fn complete_job(&self, job: Job, info: JobInfo, release: Option<Duration>) {
        match release {
            Some(delay) => self.release_job(job, info, delay).await,
            None => {
                if let Err(e) = job.delete().await {
                    error!(job_id = info.job_id.as_str(), error = ?e, "Failed to delete job");
                    self.report(&e);
                }
            }
        }
    }

    async fn release_job(&self, job: Job, info: JobInfo, delay: Duration) {
        match job.release(delay).await {
            Ok(()) => {
                self.worker
                    .hooks
                    .emit(JobReleasedContext { job: info, delay })
                    .await;
            }
            Err(e) => {
                error!(job_id = info.job_id.as_str(), error = ?e, "Failed to release job");
                self.report(&e);
            }
        }
    }

    /// Archives the job into the failed job store, then deletes it. If it
    /// can't be archived it goes back to its queue instead.
    async fn fail_job(&self, job: Job, info: JobInfo, e: RunJobError) {
        let error_str = e.to_string();
        error!(
            error = ?e,
            task_identifier = job.payload().job().as_str(),
            job_id = job.job_id(),
            "Job max attempts reached"
        );

        let failed_id = match &self.worker.failed_store {
            Some(store) => {
                match store
                    .log(job.connection_name(), job.queue(), job.raw_body(), &error_str)
                    .await
                {
                    Ok(id) => Some(id),
                    Err(log_error) => {
                        error!(job_id = job.job_id(), error = ?log_error, "Failed to archive failed job, putting it back");
                        self.report(&log_error);
                        if let Err(reject_error) = job.reject(true).await {
                            self.report(&reject_error);
                        }
                        return;
                    }
                }
            }
            None => {
                warn!(job_id = job.job_id(), "No failed job store configured, dropping failed job");
                None
            }
        };

        if let Err(delete_error) = job.delete().await {
            self.report(&delete_error);
        }

        self.worker
            .hooks
            .emit(JobFailedContext {
                job: info,
                error: error_str,
                failed_id,
            })
            .await;
    }
}
