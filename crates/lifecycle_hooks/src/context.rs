use std::time::Duration;

/// Why a worker left its daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStopReason {
    /// A shutdown was requested by a signal or programmatically
    Quit,
    /// The process went over its memory ceiling
    MemoryExceeded,
    /// A restart was broadcast after the worker started
    Restart,
    /// Configured to stop once no job is available, and none was
    QueueEmpty,
    /// The configured number of jobs has been processed
    MaxJobs,
    /// The worker ran for its configured maximum time
    MaxTime,
    /// The broker connection or channel failed
    BrokerFault,
    /// A consume cycle ended and the connection is not configured to resume
    ConsumeTimeout,
}

/// Identifies the job an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub worker_id: String,
    pub connection_name: String,
    pub queue: String,
    pub job_id: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerStartContext {
    pub worker_id: String,
    pub connection_name: String,
    pub queue: String,
    pub consumer_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerStoppingContext {
    pub worker_id: String,
    pub connection_name: String,
    pub reason: WorkerStopReason,
}

#[derive(Debug, Clone)]
pub struct JobProcessingContext {
    pub job: JobInfo,
}

#[derive(Debug, Clone)]
pub struct JobProcessedContext {
    pub job: JobInfo,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct JobExceptionContext {
    pub job: JobInfo,
    pub error: String,
    pub will_retry: bool,
}

#[derive(Debug, Clone)]
pub struct JobFailedContext {
    pub job: JobInfo,
    pub error: String,
    /// Id of the record written to the failed job store, if one is configured
    pub failed_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobReleasedContext {
    pub job: JobInfo,
    pub delay: Duration,
}
