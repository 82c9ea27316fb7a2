//! Cooperative stop flags and background loop handles

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Stop flag observed by loops at their checkpoints.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request shutdown. Notifies all registered waiters exactly once.
    pub fn request_shutdown(&self) {
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `false` when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutdown_requested(),
            _ = self.wait_for_shutdown() => false,
        }
    }
}

/// A spawned polling loop with its own stop flag.
pub struct BackgroundLoop {
    name: &'static str,
    stop: SharedShutdown,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    /// Spawn `body` with a fresh stop flag handed to it
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(SharedShutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = ShutdownCoordinator::shared();
        let handle = tokio::spawn(body(stop.clone()));
        info!("{} started", name);
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to stop and join it, waiting at most `timeout`
    pub async fn stop(&mut self, timeout: Duration) {
        self.stop.request_shutdown();
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("{} stopped", self.name),
            Ok(Err(e)) => warn!("{} ended abnormally: {}", self.name, e),
            Err(_) => {
                warn!("{} did not stop within {:?}, aborting", self.name, timeout);
                handle.abort();
            }
        }
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.stop.request_shutdown();
    }
}

/// Consecutive failure counter for background loops
#[derive(Debug, Clone, Copy)]
pub struct ErrorBudget {
    max_consecutive: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive: max_consecutive.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure; returns `true` once the ceiling is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.max_consecutive
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
