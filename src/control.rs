use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    maintenance: AtomicBool,
    paused: Mutex<HashSet<String>>,
    restart_epoch: AtomicU64,
}

/// Switches shared between the application and its workers.
///
/// Cloning is cheap and every clone observes the same switches:
///
/// - maintenance mode makes workers put every message back, unless they run
///   with `force`
/// - a paused queue (per queue connection) is treated the same way
/// - [`WorkerControl::restart`] makes every running worker stop after its
///   current job, so that a supervisor can start it again with new code
#[derive(Debug, Default, Clone)]
pub struct WorkerControl {
    inner: Arc<Inner>,
}

fn pause_key(connection_name: &str, queue: &str) -> String {
    format!("{connection_name}:{queue}")
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn paused(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_maintenance(&self, enabled: bool) {
        self.inner.maintenance.store(enabled, Ordering::SeqCst);
    }

    pub fn is_down_for_maintenance(&self) -> bool {
        self.inner.maintenance.load(Ordering::SeqCst)
    }

    pub fn pause(&self, connection_name: &str, queue: &str) {
        self.paused().insert(pause_key(connection_name, queue));
    }

    pub fn resume(&self, connection_name: &str, queue: &str) {
        self.paused().remove(&pause_key(connection_name, queue));
    }

    pub fn is_paused(&self, connection_name: &str, queue: &str) -> bool {
        self.paused().contains(&pause_key(connection_name, queue))
    }

    /// Asks every worker started before this call to stop.
    pub fn restart(&self) {
        self.inner.restart_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumped on every [`WorkerControl::restart`]. A worker records it on
    /// start and stops once it changes.
    pub fn restart_epoch(&self) -> u64 {
        self.inner.restart_epoch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_switches() {
        let control = WorkerControl::new();
        let other = control.clone();

        other.set_maintenance(true);
        assert!(control.is_down_for_maintenance());

        other.pause("rabbitmq", "emails");
        assert!(control.is_paused("rabbitmq", "emails"));
        assert!(!control.is_paused("rabbitmq", "default"));
        control.resume("rabbitmq", "emails");
        assert!(!other.is_paused("rabbitmq", "emails"));

        let epoch = control.restart_epoch();
        other.restart();
        assert_eq!(control.restart_epoch(), epoch + 1);
    }
}
