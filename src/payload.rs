use std::time::Duration;

use getset::Getters;
use rabbit_worker_task_handler::TaskHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Body of every message pushed through [`Queue::push`](crate::Queue::push).
///
/// ```json
/// {
///   "uuid": "0b5c…",
///   "displayName": "my_app::SendEmail",
///   "job": "send_email",
///   "maxTries": 3,
///   "backoff": 10,
///   "timeout": 60,
///   "data": { "to": "…" }
/// }
/// ```
///
/// `backoff` and `timeout` are in seconds and may be fractional (`0.5` is
/// 500 ms). Missing optional fields fall back to the worker options, and a
/// `timeout` of zero means no limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    uuid: String,
    display_name: String,
    /// Identifier of the task that runs the job
    job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<f64>,
    #[serde(default)]
    data: Value,
}

impl JobPayload {
    pub fn new(job: impl Into<String>, data: Value) -> Self {
        let job = job.into();
        JobPayload {
            uuid: Uuid::new_v4().to_string(),
            display_name: job.clone(),
            job,
            max_tries: None,
            backoff: None,
            timeout: None,
            data,
        }
    }

    /// Payload running `task`, carrying its per job overrides.
    pub fn from_task<T: TaskHandler>(task: &T) -> Result<Self, serde_json::Error> {
        Ok(JobPayload {
            display_name: std::any::type_name::<T>().to_string(),
            max_tries: task.max_tries(),
            backoff: task.backoff().map(|d| d.as_secs_f64()),
            timeout: task.timeout().map(|d| d.as_secs_f64()),
            ..JobPayload::new(T::IDENTIFIER, serde_json::to_value(task)?)
        })
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff.as_secs_f64());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn backoff_delay(&self) -> Option<Duration> {
        self.backoff.and_then(seconds_to_duration)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .and_then(seconds_to_duration)
            .filter(|timeout| !timeout.is_zero())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Negative, non finite and overflowing values are ignored.
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}
