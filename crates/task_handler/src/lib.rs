use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

pub use rabbit_worker_ctx::JobContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Conversion of whatever a task returns into the worker's notion of success.
pub trait IntoTaskHandlerResult {
    fn into_task_handler_result(self) -> Result<(), String>;
}

impl IntoTaskHandlerResult for () {
    fn into_task_handler_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<D: Debug> IntoTaskHandlerResult for Result<(), D> {
    fn into_task_handler_result(self) -> Result<(), String> {
        self.map_err(|e| format!("{e:?}"))
    }
}

/// A job type the queue can carry and a worker can run.
///
/// The value itself is the job's data: it is serialized into the message
/// payload when pushed and deserialized again right before `run`.
///
/// The optional methods let a job override queue wide defaults. Returning a
/// value from [`TaskHandler::priority`] is how a job declares itself
/// prioritized; that value wins over any priority given when pushing.
pub trait TaskHandler: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name under which the task is registered and written into payloads
    const IDENTIFIER: &'static str;

    fn run(self, ctx: JobContext) -> impl Future<Output = impl IntoTaskHandlerResult> + Send;

    /// Message priority, clamped into 0..=255 when published.
    fn priority(&self) -> Option<i32> {
        None
    }

    /// Attempts allowed before the job is archived as failed. `0` retries forever.
    fn max_tries(&self) -> Option<u32> {
        None
    }

    /// Delay before a failed attempt is retried.
    fn backoff(&self) -> Option<Duration> {
        None
    }

    /// Maximum run time of one attempt.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Deserializes the payload data as `T` and runs it.
pub async fn run_task_from_job_ctx<T: TaskHandler>(
    ctx: JobContext,
    data: Value,
) -> Result<(), String> {
    let task = serde_json::from_value::<T>(data).map_err(|e| {
        format!(
            "Failed to deserialize payload of task '{}': {e}",
            T::IDENTIFIER
        )
    })?;
    task.run(ctx).await.into_task_handler_result()
}
