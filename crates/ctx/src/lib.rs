use std::sync::{Arc, OnceLock};
use std::time::Duration;

use getset::Getters;
use rabbit_worker_job_state::JobState;
use tokio::sync::{Mutex, MutexGuard};

/// Everything a task handler knows about the job it is running.
///
/// The job state is handed over explicitly: the worker puts the state
/// restored from the message in here before the handler runs and reads it
/// back once the handler returns.
#[derive(Getters, Clone, Debug)]
#[getset(get = "pub")]
pub struct JobContext {
    /// Message id of the job
    job_id: String,
    /// Logical queue the job was received from
    queue: String,
    /// Name of the queue connection the worker consumes
    connection_name: String,
    /// Delivery attempt, starting at 1
    attempts: u32,
    /// Identifier of the worker running the job
    worker_id: String,
    #[getset(skip)]
    state: Arc<Mutex<JobState>>,
    #[getset(skip)]
    release_request: Arc<OnceLock<Duration>>,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        queue: impl Into<String>,
        connection_name: impl Into<String>,
        attempts: u32,
        worker_id: impl Into<String>,
        state: JobState,
    ) -> Self {
        JobContext {
            job_id: job_id.into(),
            queue: queue.into(),
            connection_name: connection_name.into(),
            attempts,
            worker_id: worker_id.into(),
            state: Arc::new(Mutex::new(state)),
            release_request: Arc::new(OnceLock::new()),
        }
    }

    /// Locks the job state for reading or mutation.
    pub async fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().await
    }

    /// Copy of the current state.
    pub async fn state_snapshot(&self) -> JobState {
        self.state.lock().await.clone()
    }

    /// Asks the worker to release the job back to its queue after `delay`
    /// instead of deleting it once the handler succeeds.
    ///
    /// Only the first request counts; returns whether this call was it.
    pub fn release(&self, delay: Duration) -> bool {
        self.release_request.set(delay).is_ok()
    }

    pub fn release_requested(&self) -> Option<Duration> {
        self.release_request.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_state_and_release_request() {
        let ctx = JobContext::new("job-1", "jobs", "rabbitmq", 2, "worker", JobState::new());
        let clone = ctx.clone();

        clone.state().await.put("step", &"upload").unwrap();
        assert_eq!(ctx.state_snapshot().await.get_or("step", String::new()), "upload");

        assert!(clone.release(Duration::from_secs(5)));
        assert!(!ctx.release(Duration::from_secs(1)));
        assert_eq!(ctx.release_requested(), Some(Duration::from_secs(5)));
        assert_eq!(*ctx.attempts(), 2);
    }
}
