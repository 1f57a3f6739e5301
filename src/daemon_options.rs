use std::time::Duration;

use derive_builder::Builder;
use getset::Getters;

/// Options of one [`Worker::daemon`](crate::Worker::daemon) run.
///
/// ```
/// use rabbit_worker::DaemonOptionsBuilder;
/// use std::time::Duration;
///
/// let options = DaemonOptionsBuilder::new()
///     .max_tries(3)
///     .backoff(Duration::from_secs(10))
///     .timeout(-1)
///     .stop_when_empty(true)
///     .build();
/// ```
#[derive(Getters, Debug, Clone, PartialEq, Eq, Builder)]
#[getset(get = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct DaemonOptions {
    /// Pause after putting a message back because the worker should not run
    /// (maintenance, paused queue) or after a malformed message.
    ///
    /// Default: 3 seconds
    sleep: Duration,

    /// Delay before a failed job is retried, unless its payload says otherwise.
    ///
    /// Default: no delay
    backoff: Duration,

    /// In seconds. Bounds each consume cycle and each job run. `0` disables
    /// both limits, `-1` bounds consume cycles by the queue's time to run and
    /// leaves jobs unbounded.
    ///
    /// Default: 60
    timeout: i64,

    /// Stop after a job once the process uses this many megabytes. `0`
    /// disables the check.
    ///
    /// Default: 128
    memory: u64,

    /// Attempts allowed before a job is archived as failed, unless its
    /// payload says otherwise. `0` retries forever.
    ///
    /// Default: 1
    max_tries: u32,

    /// Run even when the application is down for maintenance.
    force: bool,

    /// Drain what is ready, then stop instead of waiting for more.
    stop_when_empty: bool,

    /// Stop after processing this many jobs.
    max_jobs: Option<u64>,

    /// Stop once the daemon has been running this long.
    max_time: Option<Duration>,

    /// Pause after each job.
    rest: Option<Duration>,

    /// Prefix of the consumer tag, a random suffix is appended.
    #[builder(setter(into))]
    consumer_tag: Option<String>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        DaemonOptions {
            sleep: Duration::from_secs(3),
            backoff: Duration::ZERO,
            timeout: 60,
            memory: 128,
            max_tries: 1,
            force: false,
            stop_when_empty: false,
            max_jobs: None,
            max_time: None,
            rest: None,
            consumer_tag: None,
        }
    }
}

impl DaemonOptions {
    pub fn builder() -> DaemonOptionsBuilder {
        DaemonOptionsBuilder::new()
    }

    /// Time box of one consume cycle, `None` meaning unbounded.
    pub(crate) fn consume_timeout(&self, time_to_run: Duration) -> Option<Duration> {
        if self.stop_when_empty {
            return Some(Duration::ZERO);
        }
        let timeout = match u64::try_from(self.timeout) {
            Ok(seconds) => Duration::from_secs(seconds),
            Err(_) => time_to_run,
        };
        (!timeout.is_zero()).then_some(timeout)
    }

    /// Run time limit of jobs without one of their own.
    pub(crate) fn job_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }
}

impl DaemonOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> DaemonOptions {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}
