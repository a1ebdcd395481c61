//! Plugin Lifecycle Management
//!
//! Supervises each registered plugin through its states:
//!
//! ```text
//! Registered --init--> Initialized --start--> Started --stop--> Stopped
//!      |                    |                     |
//!      +------ failure ---> Errored <-- failure --+
//! ```
//!
//! Every transition runs under its own timeout and the caller's cancellation
//! token. Operations on one plugin are serialized by a per-plugin lock while
//! state reads go through a separate lock, so `get_plugin_state` never waits
//! for a slow plugin. Failures of one plugin never affect another.

use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::traits::Plugin;
use crate::plugin::types::{LifecycleState, PluginConfig, PluginStatus};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Timeouts and thresholds for lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub init_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub health_check_timeout: Duration,
    /// Zero disables background health checks
    pub health_check_interval: Duration,
    /// Consecutive failed checks before a plugin is marked errored
    pub unhealthy_threshold: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(3),
            health_check_interval: Duration::ZERO,
            unhealthy_threshold: 3,
        }
    }
}

/// Aggregated outcome of a bulk lifecycle operation
#[derive(Debug, Default)]
pub struct LifecycleReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, PluginError)>,
}

impl LifecycleReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn record(&mut self, name: &str, result: PluginResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(name.to_string()),
            Err(e) => self.failed.push((name.to_string(), e)),
        }
    }
}

#[derive(Debug, Clone)]
struct StatusCell {
    state: LifecycleState,
    last_error: Option<String>,
    consecutive_failures: u32,
}

struct ManagedPlugin {
    instance: Arc<dyn Plugin>,
    config: PluginConfig,
    op_lock: Mutex<()>,
    status: RwLock<StatusCell>,
}

impl ManagedPlugin {
    fn new(instance: Arc<dyn Plugin>, config: PluginConfig) -> Self {
        Self {
            instance,
            config,
            op_lock: Mutex::new(()),
            status: RwLock::new(StatusCell {
                state: LifecycleState::Registered,
                last_error: None,
                consecutive_failures: 0,
            }),
        }
    }

    async fn state(&self) -> LifecycleState {
        self.status.read().await.state
    }

    async fn set_state(&self, state: LifecycleState) {
        self.status.write().await.state = state;
    }

    async fn expect_state(
        &self,
        name: &str,
        operation: &str,
        allowed: &[LifecycleState],
    ) -> PluginResult<()> {
        let state = self.state().await;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(PluginError::InvalidState {
                plugin_name: name.to_string(),
                operation: operation.to_string(),
                state,
            })
        }
    }
}

/// Race `operation` against its deadline and the caller's cancellation
pub(crate) async fn run_timed<T, F>(
    cancel: &CancellationToken,
    plugin_name: &str,
    operation: &str,
    limit: Duration,
    future: F,
) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::Cancelled {
            plugin_name: plugin_name.to_string(),
            operation: operation.to_string(),
        }),
        outcome = tokio::time::timeout(limit, future) => match outcome {
            Ok(result) => result,
            Err(_) => Err(PluginError::Timeout {
                plugin_name: plugin_name.to_string(),
                operation: operation.to_string(),
                timeout: limit,
            }),
        },
    }
}

/// Drives registered plugins through their lifecycle
pub struct LifecycleManager {
    config: LifecycleConfig,
    plugins: RwLock<HashMap<String, Arc<ManagedPlugin>>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register an instance in the `Registered` state
    pub async fn register(&self, name: &str, instance: Arc<dyn Plugin>) -> PluginResult<()> {
        self.register_with_config(name, instance, PluginConfig::default())
            .await
    }

    /// Register an instance together with the configuration passed to it on init
    pub async fn register_with_config(
        &self,
        name: &str,
        instance: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(name) {
            return Err(PluginError::AlreadyExists {
                plugin_name: name.to_string(),
            });
        }
        plugins.insert(
            name.to_string(),
            Arc::new(ManagedPlugin::new(instance, config)),
        );
        log::debug!("Registered plugin '{}'", name);
        Ok(())
    }

    /// Replace a stopped or errored instance with a fresh one
    pub async fn reregister(
        &self,
        name: &str,
        instance: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> PluginResult<()> {
        let previous = {
            let mut plugins = self.plugins.write().await;
            if let Some(existing) = plugins.get(name) {
                let state = existing.state().await;
                if !matches!(state, LifecycleState::Errored | LifecycleState::Stopped) {
                    return Err(PluginError::InvalidState {
                        plugin_name: name.to_string(),
                        operation: "re-register".to_string(),
                        state,
                    });
                }
            }
            plugins.insert(
                name.to_string(),
                Arc::new(ManagedPlugin::new(instance, config)),
            )
        };

        if let Some(previous) = previous {
            let _guard = previous.op_lock.lock().await;
            self.release(name, &previous).await;
        }
        log::debug!("Re-registered plugin '{}'", name);
        Ok(())
    }

    /// Remove a plugin, releasing whatever it still holds
    pub async fn unregister(&self, name: &str) -> PluginResult<()> {
        let removed = self.plugins.write().await.remove(name);
        match removed {
            Some(entry) => {
                let _guard = entry.op_lock.lock().await;
                self.release(name, &entry).await;
                log::debug!("Unregistered plugin '{}'", name);
                Ok(())
            }
            None => Err(PluginError::NotFound {
                plugin_name: name.to_string(),
            }),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    /// Registered plugin names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current state of a plugin
    pub async fn get_plugin_state(&self, name: &str) -> PluginResult<LifecycleState> {
        Ok(self.entry(name).await?.state().await)
    }

    pub async fn plugin_status(&self, name: &str) -> PluginResult<PluginStatus> {
        let entry = self.entry(name).await?;
        let status = entry.status.read().await.clone();
        Ok(PluginStatus {
            name: name.to_string(),
            state: status.state,
            last_error: status.last_error,
            consecutive_failures: status.consecutive_failures,
        })
    }

    /// Status of every registered plugin, sorted by name
    pub async fn statuses(&self) -> Vec<PluginStatus> {
        let mut statuses = Vec::new();
        for name in self.names().await {
            if let Ok(status) = self.plugin_status(&name).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Configure and initialize a registered plugin
    pub async fn init_plugin(&self, cancel: &CancellationToken, name: &str) -> PluginResult<()> {
        let entry = self.entry(name).await?;
        let _guard = entry.op_lock.lock().await;
        entry
            .expect_state(name, "init", &[LifecycleState::Registered])
            .await?;

        let instance = entry.instance.clone();
        let config = entry.config.clone();
        let result = run_timed(cancel, name, "init", self.config.init_timeout, async move {
            instance.configure(&config).await?;
            instance.init().await
        })
        .await;

        match result {
            Ok(()) => {
                entry.set_state(LifecycleState::Initialized).await;
                log::debug!("Plugin '{}' initialized", name);
                Ok(())
            }
            Err(e) => Err(self.fail(name, &entry, e).await),
        }
    }

    /// Start an initialized plugin
    pub async fn start_plugin(&self, cancel: &CancellationToken, name: &str) -> PluginResult<()> {
        let entry = self.entry(name).await?;
        let _guard = entry.op_lock.lock().await;
        entry
            .expect_state(name, "start", &[LifecycleState::Initialized])
            .await?;

        let result = run_timed(
            cancel,
            name,
            "start",
            self.config.start_timeout,
            entry.instance.start(),
        )
        .await;

        match result {
            Ok(()) => {
                {
                    let mut status = entry.status.write().await;
                    status.state = LifecycleState::Started;
                    status.consecutive_failures = 0;
                }
                log::info!("Plugin '{}' started", name);
                Ok(())
            }
            Err(e) => Err(self.fail(name, &entry, e).await),
        }
    }

    /// Run one health check on a started plugin
    ///
    /// A failed check below the threshold is still returned as an error; the
    /// plugin only moves to `Errored` once the threshold is reached.
    pub async fn health_check_plugin(&self, name: &str) -> PluginResult<()> {
        let entry = self.entry(name).await?;
        let _guard = entry.op_lock.lock().await;
        entry
            .expect_state(name, "health-check", &[LifecycleState::Started])
            .await?;

        let limit = self.config.health_check_timeout;
        let result = match tokio::time::timeout(limit, entry.instance.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Timeout {
                plugin_name: name.to_string(),
                operation: "health-check".to_string(),
                timeout: limit,
            }),
        };

        let error = match result {
            Ok(()) => {
                entry.status.write().await.consecutive_failures = 0;
                return Ok(());
            }
            Err(e) => e,
        };

        let failures = {
            let mut status = entry.status.write().await;
            status.consecutive_failures += 1;
            status.last_error = Some(error.to_string());
            status.consecutive_failures
        };
        log::warn!(
            "Health check {} of {} failed for plugin '{}': {}",
            failures,
            self.config.unhealthy_threshold,
            name,
            error
        );

        if failures >= self.config.unhealthy_threshold {
            let unhealthy = PluginError::Unhealthy {
                plugin_name: name.to_string(),
                failures,
            };
            return Err(self.fail(name, &entry, unhealthy).await);
        }
        Err(error)
    }

    /// Stop a plugin and release its resources
    ///
    /// A stop that fails or times out still releases the instance and ends in
    /// `Stopped` with the error recorded. Cancellation or a failed release ends
    /// in `Errored`.
    pub async fn stop_plugin(&self, cancel: &CancellationToken, name: &str) -> PluginResult<()> {
        let entry = self.entry(name).await?;
        let _guard = entry.op_lock.lock().await;

        match entry.state().await {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Started | LifecycleState::Initialized => {}
            state => {
                return Err(PluginError::InvalidState {
                    plugin_name: name.to_string(),
                    operation: "stop".to_string(),
                    state,
                })
            }
        }

        let limit = self.config.stop_timeout;
        let stopped = match run_timed(cancel, name, "stop", limit, entry.instance.stop()).await {
            Err(e @ PluginError::Cancelled { .. }) => return Err(self.fail(name, &entry, e).await),
            other => other,
        };

        let never = CancellationToken::new();
        let released = run_timed(&never, name, "release", limit, entry.instance.release()).await;

        match (stopped, released) {
            (_, Err(e)) => {
                let mut status = entry.status.write().await;
                status.state = LifecycleState::Errored;
                status.last_error = Some(e.to_string());
                log::warn!("Plugin '{}' could not release its resources: {}", name, e);
                Err(e)
            }
            (Err(e), Ok(())) => {
                let mut status = entry.status.write().await;
                status.state = LifecycleState::Stopped;
                status.last_error = Some(e.to_string());
                log::warn!("Plugin '{}' did not stop cleanly: {}", name, e);
                Err(e)
            }
            (Ok(()), Ok(())) => {
                entry.set_state(LifecycleState::Stopped).await;
                log::info!("Plugin '{}' stopped", name);
                Ok(())
            }
        }
    }

    /// Initialize every plugin in `order`, independently
    pub async fn init_all(&self, cancel: &CancellationToken, order: &[String]) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for name in order {
            report.record(name, self.init_plugin(cancel, name).await);
        }
        report
    }

    /// Start every plugin in `order`, independently
    pub async fn start_all(&self, cancel: &CancellationToken, order: &[String]) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for name in order {
            report.record(name, self.start_plugin(cancel, name).await);
        }
        report
    }

    /// Stop plugins in reverse of `order`, then every other registered one
    ///
    /// Plugins that never started or already failed are released so no
    /// process outlives the manager.
    pub async fn stop_all(&self, cancel: &CancellationToken, order: &[String]) -> LifecycleReport {
        let mut sequence: Vec<String> = order.iter().rev().cloned().collect();
        for name in self.names().await {
            if !sequence.contains(&name) {
                sequence.push(name);
            }
        }

        let mut report = LifecycleReport::default();
        for name in &sequence {
            let Ok(entry) = self.entry(name).await else {
                continue;
            };
            let state = entry.state().await;
            if state.is_active() {
                report.record(name, self.stop_plugin(cancel, name).await);
            } else if matches!(state, LifecycleState::Registered | LifecycleState::Errored) {
                let _guard = entry.op_lock.lock().await;
                self.release(name, &entry).await;
            }
        }
        report
    }

    /// Check every started plugin concurrently
    pub async fn check_all_health(&self) -> Vec<(String, PluginResult<()>)> {
        let mut started = Vec::new();
        for name in self.names().await {
            if matches!(
                self.get_plugin_state(&name).await,
                Ok(LifecycleState::Started)
            ) {
                started.push(name);
            }
        }

        let checks = started.iter().map(|name| async move {
            (name.clone(), self.health_check_plugin(name).await)
        });
        join_all(checks).await
    }

    async fn entry(&self, name: &str) -> PluginResult<Arc<ManagedPlugin>> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound {
                plugin_name: name.to_string(),
            })
    }

    // Mark errored, record the error and free the instance
    async fn fail(&self, name: &str, entry: &ManagedPlugin, error: PluginError) -> PluginError {
        {
            let mut status = entry.status.write().await;
            status.state = LifecycleState::Errored;
            status.last_error = Some(error.to_string());
        }
        log::warn!("Plugin '{}' errored: {}", name, error);
        self.release(name, entry).await;
        error
    }

    async fn release(&self, name: &str, entry: &ManagedPlugin) {
        let never = CancellationToken::new();
        let limit = self.config.stop_timeout;
        if let Err(e) = run_timed(&never, name, "release", limit, entry.instance.release()).await {
            log::warn!("Failed to release plugin '{}': {}", name, e);
        }
    }
}
