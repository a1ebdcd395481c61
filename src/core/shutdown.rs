//! Shutdown coordination
//!
//! Turns process signals into cancellation of a shared token. Every lifecycle
//! operation receives a child of this token, so an interrupt moves in-flight
//! plugin operations to `Errored` and releases their processes instead of
//! leaving them half started.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Coordinates graceful shutdown across the application
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    signal_count: Arc<AtomicUsize>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            signal_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token cancelled when shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Install signal handlers that trigger shutdown.
    ///
    /// The first signal cancels the token; a second one exits immediately.
    pub fn install_signal_handlers(&self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            }

            use tokio::signal::unix::{signal, SignalKind};
            let signals = [
                SignalKind::interrupt(),
                SignalKind::terminate(),
                SignalKind::hangup(),
            ];

            for kind in signals {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    if let Ok(mut sig) = signal(kind) {
                        while sig.recv().await.is_some() {
                            coordinator.on_signal();
                        }
                    }
                });
            }
        }

        #[cfg(not(unix))]
        {
            let coordinator = self.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    coordinator.on_signal();
                }
            });
        }
    }

    fn on_signal(&self) {
        let previous = self.signal_count.fetch_add(1, Ordering::AcqRel);
        if previous >= 1 {
            log::warn!("Second interrupt received; exiting");
            std::process::exit(130);
        }
        log::info!("Interrupt received; stopping plugins");
        self.trigger_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
