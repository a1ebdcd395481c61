//! Background health supervision
//!
//! Periodically checks every started plugin. Counting and thresholds are the
//! lifecycle manager's; this task only drives the clock.

use crate::plugin::lifecycle::LifecycleManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a running health monitor
#[derive(Debug)]
pub struct HealthMonitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the monitor; `None` when `interval` is zero
    pub fn spawn(
        lifecycle: Arc<LifecycleManager>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }

        let token = parent.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        for (name, result) in lifecycle.check_all_health().await {
                            if let Err(e) = result {
                                log::debug!("Health check for '{}' failed: {}", name, e);
                            }
                        }
                    }
                }
            }
            log::debug!("Health monitor stopped");
        });

        log::debug!("Health monitor running every {:?}", interval);
        Some(Self { token, handle })
    }

    /// Stop the monitor and wait for its task to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("Health monitor task ended abnormally: {}", e);
        }
    }
}
