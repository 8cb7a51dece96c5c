use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

/// Why the gateway is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Triggered from code, e.g. tests or an embedding application
    Requested,
}

/// Coordinates shutdown of the listener and the background sweepers.
///
/// The first trigger wins; later triggers are ignored. Draining in-flight work is bounded by
/// the shutdown timeout.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            shutdown_timeout,
        }
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            return;
        }
        tracing::info!("Initiating graceful shutdown: {:?}", reason);
        *current = Some(reason);
        self.token.cancel();
    }

    /// Wait for SIGINT/SIGTERM (or a trigger from code) and start shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT (Ctrl+C)");
                self.trigger(ShutdownReason::Signal);
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM");
                self.trigger(ShutdownReason::Signal);
            }
            _ = self.token.cancelled() => {}
        }
    }

    pub async fn wait_for_shutdown_signal(&self) -> Option<ShutdownReason> {
        self.token.cancelled().await;
        self.reason()
    }

    /// Run `work` to completion or until the shutdown timeout. Returns whether it finished.
    pub async fn drain<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match timeout(self.shutdown_timeout, work).await {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(
                    "Shutdown timeout exceeded ({:?}), abandoning remaining work",
                    self.shutdown_timeout
                );
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
