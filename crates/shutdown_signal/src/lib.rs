use std::pin::Pin;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use std::future::Future;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Signals that change what a running worker does without stopping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
}

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() {
            let (Ok(mut ctrl_c), Ok(mut ctrl_close), Ok(mut ctrl_shutdown)) =
                (ctrl_c(), ctrl_close(), ctrl_shutdown())
            else {
                warn!("Failed to attach shutdown signals (windows), only programmatic shutdown is available");
                return std::future::pending().await;
            };
            select! {
                _ = ctrl_c.recv() => (),
                _ = ctrl_close.recv() => (),
                _ = ctrl_shutdown.recv() => (),
            }
        }

        fn spawn_control_listener(_sender: mpsc::UnboundedSender<ControlSignal>) {}
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        // SIGCONT has no named constructor in tokio
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const SIGCONT: i32 = 18;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        const SIGCONT: i32 = 19;

        async fn unix_signal(signal_kind: SignalKind) {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen to unix signal");
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_signal(SignalKind::interrupt()) => (),
                _ = unix_signal(SignalKind::terminate()) => (),
                _ = unix_signal(SignalKind::quit()) => (),
            };
        }

        fn spawn_control_listener(sender: mpsc::UnboundedSender<ControlSignal>) {
            let (Ok(mut pause), Ok(mut resume)) = (
                signal(SignalKind::user_defined2()),
                signal(SignalKind::from_raw(SIGCONT)),
            ) else {
                warn!("Failed to listen to pause/resume signals");
                return;
            };

            tokio::spawn(async move {
                loop {
                    let control = select! {
                        Some(()) = pause.recv() => ControlSignal::Pause,
                        Some(()) = resume.recv() => ControlSignal::Resume,
                        else => break,
                    };
                    if sender.send(control).is_err() {
                        break;
                    }
                }
            });
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// A cloneable future resolving once shutdown is requested.
///
/// Cancelling `token` always triggers it. With `listen_os_signals` a SIGINT,
/// SIGTERM or SIGQUIT (Ctrl-C and friends on windows) triggers it too.
pub fn shutdown_signal(token: CancellationToken, listen_os_signals: bool) -> ShutdownSignal {
    async move {
        if listen_os_signals {
            select! {
                _ = raw_shutdown_signal() => {
                    info!("Shutdown signal detected. Attempting graceful shutdown...");
                    token.cancel();
                }
                _ = token.cancelled() => {
                    info!("Shutdown requested. Attempting graceful shutdown...");
                }
            }
        } else {
            token.cancelled().await;
            info!("Shutdown requested. Attempting graceful shutdown...");
        }
    }
    .boxed()
    .shared()
}

/// Listens for SIGUSR2 (pause) and SIGCONT (resume).
///
/// Must be called from within a tokio runtime. The listener stops once the
/// receiver is dropped. On windows the receiver never yields anything.
pub fn control_signals() -> mpsc::UnboundedReceiver<ControlSignal> {
    let (sender, receiver) = mpsc::unbounded_channel();
    spawn_control_listener(sender);
    receiver
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn resolves_for_every_clone_once_cancelled() {
        let token = CancellationToken::new();
        let signal = shutdown_signal(token.clone(), false);
        let other = signal.clone();

        let pending = tokio::time::timeout(Duration::from_millis(20), signal.clone()).await;
        assert!(pending.is_err());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should resolve");
        tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .expect("clone should resolve");
    }
}
