//! Plugin Manager
//!
//! Central coordinator for discovery, loading, dependency ordering and the
//! cache of live plugins. One manager is built at start-up and shared; all of
//! its state sits behind async locks so it can be used from concurrent tasks.
//!
//! Loading, eviction and cleanup are serialized by a single load lock, so a
//! plugin is never spawned twice and never torn down while it is being
//! brought up. Cache hits for started plugins never take that lock.

use crate::core::time::{SystemTimeProvider, TimeProvider};
use crate::plugin::cache::{Lookup, TtlCache};
use crate::plugin::context::{self, ContextTarget, DetectionLimits};
use crate::plugin::discovery::{is_executable, DiscoveryConfig, PluginDiscovery};
use crate::plugin::error::{PluginError, PluginResult, ResolutionError};
use crate::plugin::health::HealthMonitor;
use crate::plugin::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::plugin::loader::{PluginLoader, ProcessLoader};
use crate::plugin::process::ProcessOptions;
use crate::plugin::registry::SharedPluginRegistry;
use crate::plugin::resolver::{Advisory, DependencyResolver};
use crate::plugin::traits::Plugin;
use crate::plugin::types::{
    CommandOutput, CommandTable, LifecycleState, PluginCommand, PluginConfig, PluginMetadata,
    PluginStatus, ProjectContext,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Everything the manager needs to know at construction
#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// Directories to search, highest precedence first
    pub search_paths: Vec<PathBuf>,
    pub excluded_plugins: Vec<String>,
    /// Executable prefix, plugins are named `<prefix>-plugin-<name>`
    pub prefix: String,
    /// Idle time after which a cached plugin is evicted; zero keeps it
    pub cache_ttl: Duration,
    pub lifecycle: LifecycleConfig,
    pub detection: DetectionLimits,
    pub process: ProcessOptions,
    /// Raw `[plugins.<name>]` tables
    pub plugin_configs: HashMap<String, PluginConfig>,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            excluded_plugins: Vec::new(),
            prefix: "devctx".to_string(),
            cache_ttl: Duration::from_secs(300),
            lifecycle: LifecycleConfig::default(),
            detection: DetectionLimits::default(),
            process: ProcessOptions::default(),
            plugin_configs: HashMap::new(),
        }
    }
}

/// A live plugin as held by the cache
#[derive(Clone)]
pub struct LoadedPlugin {
    pub name: String,
    pub path: PathBuf,
    pub metadata: PluginMetadata,
    pub instance: Arc<dyn Plugin>,
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("version", &self.metadata.version)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Outcome of a full discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Number of executables found
    pub candidates: usize,
    /// Plugins running after the pass, in start order
    pub started: Vec<String>,
    pub failures: Vec<(String, PluginError)>,
    pub advisories: Vec<Advisory>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Status of one plugin combined with its cache bookkeeping
#[derive(Debug, Clone)]
pub struct PluginOverview {
    pub status: PluginStatus,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

enum CacheState {
    Ready(LoadedPlugin),
    Pending,
    Absent,
}

/// Central plugin manager
pub struct PluginManager {
    config: PluginManagerConfig,
    discovery: PluginDiscovery,
    loader: Arc<dyn PluginLoader>,
    registry: SharedPluginRegistry,
    lifecycle: Arc<LifecycleManager>,
    cache: RwLock<TtlCache<LoadedPlugin>>,
    load_lock: Mutex<()>,
    monitor: Mutex<Option<HealthMonitor>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("search_paths", &self.config.search_paths)
            .field("prefix", &self.config.prefix)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Manager spawning real plugin processes
    pub fn new(config: PluginManagerConfig, shutdown: CancellationToken) -> PluginResult<Self> {
        let loader = Arc::new(ProcessLoader::new(config.process.clone()));
        Self::with_parts(config, loader, Arc::new(SystemTimeProvider), shutdown)
    }

    /// Manager with an explicit loader and clock
    pub fn with_parts(
        config: PluginManagerConfig,
        loader: Arc<dyn PluginLoader>,
        time: Arc<dyn TimeProvider>,
        shutdown: CancellationToken,
    ) -> PluginResult<Self> {
        let discovery = PluginDiscovery::new(DiscoveryConfig {
            search_paths: config.search_paths.clone(),
            excluded_plugins: config.excluded_plugins.clone(),
            prefix: config.prefix.clone(),
        })?;

        Ok(Self {
            discovery,
            loader,
            registry: SharedPluginRegistry::new(),
            lifecycle: Arc::new(LifecycleManager::new(config.lifecycle.clone())),
            cache: RwLock::new(TtlCache::new(config.cache_ttl, time)),
            load_lock: Mutex::new(()),
            monitor: Mutex::new(None),
            shutdown,
            config,
        })
    }

    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedPluginRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Paths of every plugin executable, without starting anything
    pub async fn discover_plugins_lazy(&self) -> Vec<PathBuf> {
        self.discovery
            .discover()
            .await
            .into_iter()
            .map(|candidate| candidate.path)
            .collect()
    }

    /// Load and register every discovered plugin without starting any
    ///
    /// Enough to build the command table; `execute` starts only the owner.
    pub async fn load_discovered(&self) -> DiscoveryReport {
        let _guard = self.load_lock.lock().await;
        self.sweep_expired().await;
        self.load_candidates().await
    }

    /// Load every discovered plugin and start them in dependency order
    ///
    /// Failures are recorded per plugin and never abort the pass.
    pub async fn discover_plugins(&self) -> DiscoveryReport {
        let _guard = self.load_lock.lock().await;
        self.sweep_expired().await;
        let mut report = self.load_candidates().await;

        let metadata = self.registered_metadata(None).await;
        let resolution = DependencyResolver::new(&metadata).resolve_partial();

        for (name, error) in resolution.failures {
            log::warn!("Skipping plugin '{}': {}", name, error);
            self.evict(&name).await;
            report.failures.push((name, error.into()));
        }
        report.advisories = resolution.plan.advisories;

        let metadata = &metadata;
        for level in &resolution.plan.levels {
            let starts = level.iter().map(|name| async move {
                let result = self.bring_up_after_dependencies(name, metadata).await;
                (name.clone(), result)
            });
            for (name, result) in join_all(starts).await {
                match result {
                    Ok(()) => report.started.push(name),
                    Err(e) => {
                        log::warn!("Plugin '{}' failed to start: {}", name, e);
                        report.failures.push((name, e));
                    }
                }
            }
        }

        self.ensure_health_monitor().await;
        log::info!(
            "Discovered {} plugin(s), {} started",
            report.candidates,
            report.started.len()
        );
        report
    }

    /// Load the plugin at `path` and register it, without starting it
    pub async fn load_plugin(&self, path: &Path) -> PluginResult<LoadedPlugin> {
        let name = self.plugin_name(path)?;
        if !is_executable(path).await {
            return Err(PluginError::LoadError {
                path: path.to_path_buf(),
                cause: "not an executable file".to_string(),
            });
        }

        let _guard = self.load_lock.lock().await;
        if self.lifecycle.contains(&name).await {
            self.evict(&name).await;
        }
        self.load_at(&name, path, None).await
    }

    /// A started plugin, loading and starting it and its dependencies on demand
    pub async fn get_plugin(&self, name: &str) -> PluginResult<LoadedPlugin> {
        if let Some(plugin) = self.started_from_cache(name).await {
            return Ok(plugin);
        }

        let _guard = self.load_lock.lock().await;
        self.sweep_expired().await;
        if let CacheState::Ready(plugin) = self.cache_state(name).await {
            return Ok(plugin);
        }

        let closure = self.load_closure(name).await?;
        let metadata = self.registered_metadata(Some(&closure)).await;

        let plan = match DependencyResolver::new(&metadata).plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.abandon(&closure).await;
                return Err(e.into());
            }
        };
        for advisory in &plan.advisories {
            log::info!("{}", advisory);
        }

        for level in &plan.levels {
            let starts = level.iter().map(|member| async move {
                (member.clone(), self.bring_up(member).await)
            });
            for (member, result) in join_all(starts).await {
                if let Err(e) = result {
                    self.abandon(&closure).await;
                    if member == name {
                        return Err(e);
                    }
                    log::warn!("Dependency '{}' of '{}' failed: {}", member, name, e);
                    return Err(ResolutionError::DependencyFailed {
                        plugin: name.to_string(),
                        dependency: member,
                    }
                    .into());
                }
            }
        }

        self.ensure_health_monitor().await;
        match self.cache_state(name).await {
            CacheState::Ready(plugin) => Ok(plugin),
            _ => Err(PluginError::NotFound {
                plugin_name: name.to_string(),
            }),
        }
    }

    /// Names of cached plugins, sorted
    pub async fn list_plugins(&self) -> Vec<String> {
        self.cache.read().await.keys()
    }

    /// Commands offered by the plugin at `path`
    ///
    /// Uses what was recorded when the plugin was loaded; an unknown plugin is
    /// spawned just long enough to ask.
    pub async fn framework_commands(&self, path: &Path) -> PluginResult<Vec<PluginCommand>> {
        let name = self.plugin_name(path)?;
        if let Some(known) = self.registry.get_plugin(&name).await {
            if known.path == path {
                return Ok(known.commands);
            }
        }

        let instance = self.loader.load(&name, path).await?;
        let commands = instance
            .as_command_provider()
            .map(|provider| provider.commands())
            .unwrap_or_default();
        if let Err(e) = instance.release().await {
            log::debug!("Failed to release '{}' after listing commands: {}", name, e);
        }
        Ok(commands)
    }

    /// Command table across all plugins loaded so far
    pub async fn default_commands(&self) -> CommandTable {
        self.registry.command_table().await
    }

    /// Run `command` on the plugin that owns it
    pub async fn execute(&self, command: &str, args: &[String]) -> PluginResult<CommandOutput> {
        let table = self.default_commands().await;
        let entry = table
            .get(command)
            .cloned()
            .ok_or_else(|| PluginError::CommandNotFound {
                command: command.to_string(),
            })?;

        let plugin = self.get_plugin(&entry.plugin).await?;
        let provider =
            plugin
                .instance
                .as_command_provider()
                .ok_or_else(|| PluginError::OperationFailed {
                    plugin_name: entry.plugin.clone(),
                    operation: "execute".to_string(),
                    cause: "plugin does not provide commands".to_string(),
                })?;

        log::debug!("Running '{}' via plugin '{}'", entry.command, entry.plugin);
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(PluginError::Cancelled {
                plugin_name: entry.plugin.clone(),
                operation: "execute".to_string(),
            }),
            output = provider.execute(&entry.command, args) => output,
        }
    }

    /// Ask every started, context-capable plugin about `project_root`
    pub async fn detect_context(&self, project_root: &Path) -> ProjectContext {
        let loaded: Vec<LoadedPlugin> = {
            let cache = self.cache.read().await;
            cache
                .keys()
                .iter()
                .filter_map(|key| cache.peek(key).map(|entry| entry.value.clone()))
                .collect()
        };

        let mut targets = Vec::new();
        for plugin in loaded {
            if plugin.instance.as_context_provider().is_none() {
                continue;
            }
            if !matches!(
                self.lifecycle.get_plugin_state(&plugin.name).await,
                Ok(LifecycleState::Started)
            ) {
                continue;
            }
            let discovery_index = self
                .registry
                .get_plugin(&plugin.name)
                .await
                .map(|p| p.discovery_index)
                .unwrap_or(usize::MAX);
            targets.push(ContextTarget {
                name: plugin.name,
                discovery_index,
                instance: plugin.instance,
            });
        }

        context::detect_context(targets, project_root, self.config.detection).await
    }

    /// Evict one plugin, stopping and releasing it
    pub async fn invalidate_cache(&self, name: &str) -> bool {
        let _guard = self.load_lock.lock().await;
        let present = self.cache.read().await.contains(name) || self.lifecycle.contains(name).await;
        if present {
            self.evict(name).await;
        }
        present
    }

    /// Evict every plugin
    pub async fn clear_cache(&self) {
        let _guard = self.load_lock.lock().await;
        self.retire_all().await;
    }

    /// Stop health supervision and terminate every plugin
    ///
    /// Safe to call repeatedly and concurrently with lookups.
    pub async fn cleanup(&self) {
        let _guard = self.load_lock.lock().await;

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.shutdown().await;
        }
        self.retire_all().await;
        log::debug!("Plugin manager cleaned up");
    }

    /// Lifecycle status of every registered plugin with cache details
    pub async fn plugin_statuses(&self) -> Vec<PluginOverview> {
        let statuses = self.lifecycle.statuses().await;
        let cache = self.cache.read().await;
        let registry = self.registry.inner().read().await;

        statuses
            .into_iter()
            .map(|status| {
                let registered = registry.get_plugin(&status.name);
                let entry = cache.peek(&status.name);
                PluginOverview {
                    version: registered.map(|p| p.metadata.version.clone()),
                    path: registered.map(|p| p.path.clone()),
                    loaded_at: entry.map(|e| e.value.loaded_at),
                    last_used: entry.map(|e| DateTime::<Utc>::from(e.last_used_at)),
                    status,
                }
            })
            .collect()
    }

    /// Plugin name encoded in an executable path
    pub fn plugin_name(&self, path: &Path) -> PluginResult<String> {
        path.file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| self.discovery.plugin_name(f))
            .ok_or_else(|| PluginError::LoadError {
                path: path.to_path_buf(),
                cause: format!(
                    "file name does not match '{}-plugin-<name>'",
                    self.config.prefix
                ),
            })
    }

    // Lock-free fast path; anything but a started plugin goes the slow way
    async fn started_from_cache(&self, name: &str) -> Option<LoadedPlugin> {
        let plugin = {
            let mut cache = self.cache.write().await;
            if !cache.contains(name) {
                return None;
            }
            let plugin = cache.get(name)?;
            if !touch_requirements(&mut cache, &plugin.metadata) {
                return None;
            }
            plugin
        };
        match self.lifecycle.get_plugin_state(name).await {
            Ok(LifecycleState::Started) => Some(plugin),
            _ => None,
        }
    }

    // Caller holds the load lock
    async fn cache_state(&self, name: &str) -> CacheState {
        let lookup = {
            let mut cache = self.cache.write().await;
            let lookup = cache.lookup(name);
            if let Lookup::Hit(plugin) = &lookup {
                touch_requirements(&mut cache, &plugin.metadata);
            }
            lookup
        };
        match lookup {
            Lookup::Hit(plugin) => match self.lifecycle.get_plugin_state(name).await {
                Ok(LifecycleState::Started) => CacheState::Ready(plugin),
                Ok(LifecycleState::Registered | LifecycleState::Initialized) => CacheState::Pending,
                _ => {
                    log::debug!("Cached plugin '{}' is no longer running", name);
                    self.evict(name).await;
                    CacheState::Absent
                }
            },
            Lookup::Expired(_) => {
                log::debug!("Cached plugin '{}' expired", name);
                self.evict(name).await;
                CacheState::Absent
            }
            Lookup::Miss => CacheState::Absent,
        }
    }

    // Caller holds the load lock
    // Caller holds the load lock
    async fn load_candidates(&self) -> DiscoveryReport {
        let candidates = self.discovery.discover().await;
        let mut report = DiscoveryReport {
            candidates: candidates.len(),
            ..DiscoveryReport::default()
        };

        let names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        let positions = self.registry.inner().write().await.reserve_order(&names);
        let positions = &positions;

        let loads = candidates.iter().map(|candidate| async move {
            let result = match self.cache_state(&candidate.name).await {
                CacheState::Ready(_) | CacheState::Pending => Ok(()),
                CacheState::Absent => self
                    .load_at(
                        &candidate.name,
                        &candidate.path,
                        positions.get(&candidate.name).copied(),
                    )
                    .await
                    .map(|_| ()),
            };
            (candidate.name.clone(), result)
        });
        for (name, result) in join_all(loads).await {
            if let Err(e) = result {
                log::warn!("Skipping plugin '{}': {}", name, e);
                report.failures.push((name, e));
            }
        }
        report
    }

    async fn load_at(
        &self,
        name: &str,
        path: &Path,
        discovery_index: Option<usize>,
    ) -> PluginResult<LoadedPlugin> {
        let instance = self.loader.load(name, path).await?;
        let metadata = instance.metadata();
        if metadata.name != name {
            log::warn!(
                "Plugin executable '{}' reports name '{}'; using '{}'",
                name,
                metadata.name,
                name
            );
        }
        let commands = instance
            .as_command_provider()
            .map(|provider| provider.commands())
            .unwrap_or_default();
        let config = self
            .config
            .plugin_configs
            .get(name)
            .cloned()
            .unwrap_or_default();

        if self.lifecycle.contains(name).await {
            self.retire(name).await;
        }
        if let Err(e) = self
            .lifecycle
            .register_with_config(name, instance.clone(), config)
            .await
        {
            if let Err(release_error) = instance.release().await {
                log::debug!("Failed to release '{}': {}", name, release_error);
            }
            return Err(e);
        }

        {
            let mut registry = self.registry.inner().write().await;
            match discovery_index {
                Some(index) => registry.upsert_at(
                    name,
                    index,
                    path.to_path_buf(),
                    metadata.clone(),
                    commands,
                ),
                None => registry.upsert_plugin(name, path.to_path_buf(), metadata.clone(), commands),
            }
        }

        let loaded = LoadedPlugin {
            name: name.to_string(),
            path: path.to_path_buf(),
            metadata,
            instance,
            loaded_at: Utc::now(),
        };
        let replaced = self.cache.write().await.put(name, loaded.clone());
        if let Some(previous) = replaced {
            if !Arc::ptr_eq(&previous.instance, &loaded.instance) {
                if let Err(e) = previous.instance.release().await {
                    log::debug!("Failed to release replaced '{}': {}", name, e);
                }
            }
        }

        log::debug!("Loaded plugin '{}' from {}", name, path.display());
        Ok(loaded)
    }

    // The plugin and everything it requires, loaded but not started
    async fn load_closure(&self, name: &str) -> PluginResult<BTreeSet<String>> {
        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);

        while let Some(next) = queue.pop_front() {
            if closure.contains(&next) {
                continue;
            }
            let metadata = match self.ensure_loaded(&next).await {
                Ok(metadata) => metadata,
                // Reported as a missing dependency by the resolver
                Err(PluginError::NotFound { .. }) if next != name => continue,
                Err(e) => {
                    self.abandon(&closure).await;
                    return Err(e);
                }
            };
            closure.insert(next);

            for dependency in metadata.dependencies {
                if !dependency.optional || self.lifecycle.contains(&dependency.name).await {
                    queue.push_back(dependency.name);
                }
            }
        }
        Ok(closure)
    }

    async fn ensure_loaded(&self, name: &str) -> PluginResult<PluginMetadata> {
        match self.cache_state(name).await {
            CacheState::Ready(plugin) => return Ok(plugin.metadata),
            CacheState::Pending => {
                if let Some(known) = self.registry.get_plugin(name).await {
                    return Ok(known.metadata);
                }
            }
            CacheState::Absent => {}
        }

        let path = self.locate(name).await?;
        Ok(self.load_at(name, &path, None).await?.metadata)
    }

    async fn locate(&self, name: &str) -> PluginResult<PathBuf> {
        if let Some(known) = self.registry.get_plugin(name).await {
            if is_executable(&known.path).await {
                return Ok(known.path);
            }
        }
        self.discovery
            .find(name)
            .await
            .ok_or_else(|| PluginError::NotFound {
                plugin_name: name.to_string(),
            })
    }

    async fn registered_metadata(
        &self,
        only: Option<&BTreeSet<String>>,
    ) -> HashMap<String, PluginMetadata> {
        let live: HashSet<String> = self.lifecycle.names().await.into_iter().collect();
        self.registry
            .inner()
            .read()
            .await
            .metadata_map()
            .into_iter()
            .filter(|(name, _)| live.contains(name))
            .filter(|(name, _)| only.map_or(true, |set| set.contains(name)))
            .collect()
    }

    async fn bring_up(&self, name: &str) -> PluginResult<()> {
        if self.lifecycle.get_plugin_state(name).await? == LifecycleState::Registered {
            self.lifecycle.init_plugin(&self.shutdown, name).await?;
        }
        if self.lifecycle.get_plugin_state(name).await? == LifecycleState::Initialized {
            self.lifecycle.start_plugin(&self.shutdown, name).await?;
        }
        match self.lifecycle.get_plugin_state(name).await? {
            LifecycleState::Started => Ok(()),
            state => Err(PluginError::InvalidState {
                plugin_name: name.to_string(),
                operation: "start".to_string(),
                state,
            }),
        }
    }

    async fn bring_up_after_dependencies(
        &self,
        name: &str,
        metadata: &HashMap<String, PluginMetadata>,
    ) -> PluginResult<()> {
        if let Some(declared) = metadata.get(name) {
            for dependency in declared.required_dependencies() {
                let state = self.lifecycle.get_plugin_state(dependency).await;
                if !matches!(state, Ok(LifecycleState::Started)) {
                    self.evict(name).await;
                    return Err(ResolutionError::DependencyFailed {
                        plugin: name.to_string(),
                        dependency: dependency.to_string(),
                    }
                    .into());
                }
            }
        }
        let result = self.bring_up(name).await;
        if result.is_err() {
            self.cache.write().await.invalidate(name);
        }
        result
    }

    // Drop members of a failed load that never reached `Started`
    async fn abandon(&self, names: &BTreeSet<String>) {
        for name in names {
            if !matches!(
                self.lifecycle.get_plugin_state(name).await,
                Ok(LifecycleState::Started)
            ) {
                self.cache.write().await.invalidate(name);
                if matches!(
                    self.lifecycle.get_plugin_state(name).await,
                    Ok(LifecycleState::Registered | LifecycleState::Initialized)
                ) {
                    self.retire(name).await;
                }
            }
        }
    }

    async fn evict(&self, name: &str) {
        self.evict_with_dependents(BTreeSet::from([name.to_string()]))
            .await;
    }

    // Evict `roots` and every live plugin that requires them, dependents first
    async fn evict_with_dependents(&self, roots: BTreeSet<String>) {
        let affected = self.dependents_of(roots.clone()).await;
        for name in affected.difference(&roots) {
            log::debug!("Evicting dependent '{}'", name);
        }
        {
            let mut cache = self.cache.write().await;
            for name in &affected {
                cache.invalidate(name);
            }
        }
        self.retire_in_reverse_order(&affected).await;
    }

    // `roots` plus their transitive required dependents among live plugins
    async fn dependents_of(&self, roots: BTreeSet<String>) -> BTreeSet<String> {
        let metadata = self.registered_metadata(None).await;
        let mut affected = roots;
        loop {
            let before = affected.len();
            for (name, declared) in &metadata {
                if !affected.contains(name)
                    && declared
                        .required_dependencies()
                        .any(|dependency| affected.contains(dependency))
                {
                    affected.insert(name.clone());
                }
            }
            if affected.len() == before {
                return affected;
            }
        }
    }

    // Stop if running, then release and unregister
    async fn retire(&self, name: &str) {
        let cancel = CancellationToken::new();
        if let Ok(state) = self.lifecycle.get_plugin_state(name).await {
            if state.is_active() {
                if let Err(e) = self.lifecycle.stop_plugin(&cancel, name).await {
                    log::debug!("Plugin '{}' did not stop cleanly: {}", name, e);
                }
            }
        }
        if let Err(e) = self.lifecycle.unregister(name).await {
            log::trace!("Nothing to unregister for '{}': {}", name, e);
        }
    }

    // Empty the cache, then stop dependents before their dependencies
    async fn retire_all(&self) {
        let drained = self.cache.write().await.clear();
        let mut names: BTreeSet<String> = drained.into_iter().map(|p| p.name).collect();
        names.extend(self.lifecycle.names().await);
        self.retire_in_reverse_order(&names).await;
    }

    async fn retire_in_reverse_order(&self, names: &BTreeSet<String>) {
        if names.is_empty() {
            return;
        }

        // Only edges inside `names` matter for the stop order
        let mut metadata = self.registered_metadata(Some(names)).await;
        for declared in metadata.values_mut() {
            declared
                .dependencies
                .retain(|dependency| names.contains(&dependency.name));
        }
        let order = DependencyResolver::new(&metadata)
            .resolve_partial()
            .plan
            .order;

        let mut sequence: Vec<String> = order.into_iter().rev().collect();
        for name in names.iter().rev() {
            if !sequence.contains(name) {
                sequence.push(name.clone());
            }
        }

        for name in &sequence {
            self.retire(name).await;
        }
        log::debug!("Retired {} plugin(s)", sequence.len());
    }

    async fn sweep_expired(&self) {
        let expired: BTreeSet<String> = self
            .cache
            .write()
            .await
            .evict_expired()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        if expired.is_empty() {
            return;
        }
        for name in &expired {
            log::debug!("Cached plugin '{}' expired", name);
        }
        self.evict_with_dependents(expired).await;
    }

    async fn ensure_health_monitor(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_none() {
            *monitor = HealthMonitor::spawn(
                self.lifecycle.clone(),
                self.config.lifecycle.health_check_interval,
                &self.shutdown,
            );
        }
    }
}

// Refresh everything `metadata` requires; false once any of it is gone
fn touch_requirements(cache: &mut TtlCache<LoadedPlugin>, metadata: &PluginMetadata) -> bool {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = metadata
        .required_dependencies()
        .map(str::to_string)
        .collect();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        match cache.touch(&name) {
            Some(dependency) => queue.extend(
                dependency
                    .metadata
                    .required_dependencies()
                    .map(str::to_string),
            ),
            None => return false,
        }
    }
    true
}
