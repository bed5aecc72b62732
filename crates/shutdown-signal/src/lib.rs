use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use tokio::select;
use tokio::sync::Notify;
use tracing::info;

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() {
            let mut ctrl_c = ctrl_c().expect("Failed to attach Ctrl_C shutdown signal (windows)");
            let mut ctrl_close = ctrl_close().expect("Failed to attach Ctrl_close shutdown signal (windows)");
            let mut ctrl_shutdown = ctrl_shutdown().expect("Failed to attach Ctrl_shutdown shutdown signal (windows)");
            select! {
                _ = ctrl_c.recv() => (),
                _ = ctrl_close.recv() => (),
                _ = ctrl_shutdown.recv() => (),
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            let mut signal = signal(signal_kind).expect("Failed to listen to unix shutdown signal");
            signal.recv().await;
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => (),
                _ = unix_shutdown_signal(SignalKind::terminate()) => (),
                _ = unix_shutdown_signal(SignalKind::hangup()) => (),
            };
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

/// A cloneable future that completes when shutdown has been requested.
/// Every loop in the worker holds a clone and `select!`s against it.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Handle that triggers a [`ShutdownSignal`] programmatically.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Wakes every clone of the associated signal,
    /// including ones polled after this call.
    pub fn shutdown(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Build the signal for this handle, optionally merged with another
    /// source (typically the OS [`shutdown_signal`]).
    pub fn signal(&self, also: Option<ShutdownSignal>) -> ShutdownSignal {
        let notify = self.notify.clone();
        async move {
            match also {
                Some(other) => {
                    select! {
                        _ = notify.notified() => (),
                        _ = other => (),
                    }
                }
                None => notify.notified().await,
            }
        }
        .boxed()
        .shared()
    }
}

/// Shutdown on the usual OS termination signals.
pub fn shutdown_signal() -> ShutdownSignal {
    async {
        raw_shutdown_signal().await;
        info!("Shutdown signal detected. Attempting graceful shutdown...");
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn handle_triggers_signal() {
        let handle = ShutdownHandle::new();
        let signal = handle.signal(None);

        let mut pending = signal.clone();
        assert!(futures::poll!(&mut pending).is_pending());

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("signal should complete after shutdown()");
    }

    #[tokio::test]
    async fn signal_completes_for_late_clones() {
        let handle = ShutdownHandle::new();
        let signal = handle.signal(None);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should complete even when first polled after shutdown()");
    }
}
