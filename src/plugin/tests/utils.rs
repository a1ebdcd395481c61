//! Plugin Test Utilities
//!
//! Scriptable in-process plugins and a loader that hands them out, so the
//! lifecycle manager and the plugin manager can be exercised without spawning
//! processes.

use crate::core::time::MockTimeProvider;
use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::lifecycle::LifecycleConfig;
use crate::plugin::loader::PluginLoader;
use crate::plugin::manager::{PluginManager, PluginManagerConfig};
use crate::plugin::traits::{CommandProvider, ContextProvider, LegacyPlugin, Plugin};
use crate::plugin::types::{
    CommandOutput, ContextDetection, PluginCommand, PluginConfig, PluginDependency,
    PluginMetadata,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Ordered record of hook calls across every mock sharing it
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, plugin: &str, op: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", plugin, op));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls for one operation, in order, as plugin names
    pub fn plugins_for(&self, op: &str) -> Vec<String> {
        let suffix = format!(":{}", op);
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.calls().iter().filter(|c| *c == entry).count()
    }
}

/// How a mock plugin behaves; cloned into every instance a loader creates
#[derive(Debug, Clone)]
pub struct MockSpec {
    pub metadata: PluginMetadata,
    pub failing: HashSet<&'static str>,
    pub delays: HashMap<&'static str, Duration>,
    pub commands: Vec<PluginCommand>,
    pub context: Option<ContextDetection>,
}

impl MockSpec {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: PluginMetadata::new(name, "1.0.0"),
            failing: HashSet::new(),
            delays: HashMap::new(),
            commands: Vec::new(),
            context: None,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.metadata.version = version.to_string();
        self
    }

    pub fn requires(mut self, name: &str, constraint: &str) -> Self {
        self.metadata
            .dependencies
            .push(PluginDependency::required(name, constraint));
        self
    }

    pub fn optionally(mut self, name: &str, constraint: &str) -> Self {
        self.metadata
            .dependencies
            .push(PluginDependency::optional(name, constraint));
        self
    }

    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn delayed(mut self, op: &'static str, delay: Duration) -> Self {
        self.delays.insert(op, delay);
        self
    }

    pub fn command(mut self, name: &str, aliases: &[&str]) -> Self {
        let mut command = PluginCommand::new(name, &format!("run {}", name), "");
        command.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self.commands.push(command);
        self
    }

    pub fn context(mut self, framework: &str, confidence: f64) -> Self {
        self.context = Some(ContextDetection {
            framework: Some(framework.to_string()),
            confidence,
            values: Default::default(),
        });
        self
    }
}

/// In-process plugin driven by a `MockSpec`
#[derive(Debug)]
pub struct MockPlugin {
    pub spec: MockSpec,
    pub log: CallLog,
    healthy: AtomicBool,
    started: AtomicBool,
    releases: AtomicUsize,
    configured: Mutex<Option<PluginConfig>>,
}

impl MockPlugin {
    pub fn new(spec: MockSpec, log: CallLog) -> Self {
        Self {
            spec,
            log,
            healthy: AtomicBool::new(true),
            started: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
            configured: Mutex::new(None),
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(MockSpec::new(name), CallLog::new())
    }

    pub fn name(&self) -> &str {
        &self.spec.metadata.name
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Whether `start` ever completed on this instance
    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn configured_with(&self) -> Option<PluginConfig> {
        self.configured.lock().unwrap().clone()
    }

    async fn step(&self, op: &'static str) -> PluginResult<()> {
        self.log.record(self.name(), op);
        if let Some(delay) = self.spec.delays.get(op) {
            tokio::time::sleep(*delay).await;
        }
        if self.spec.failing.contains(op) {
            return Err(PluginError::OperationFailed {
                plugin_name: self.name().to_string(),
                operation: op.to_string(),
                cause: format!("mock {} failure", op),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Plugin for MockPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.spec.metadata.clone()
    }

    async fn configure(&self, config: &PluginConfig) -> PluginResult<()> {
        *self.configured.lock().unwrap() = Some(config.clone());
        self.step("configure").await
    }

    async fn init(&self) -> PluginResult<()> {
        self.step("init").await
    }

    async fn start(&self) -> PluginResult<()> {
        self.step("start").await?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        self.step("stop").await
    }

    async fn health_check(&self) -> PluginResult<()> {
        self.step("health").await?;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PluginError::OperationFailed {
                plugin_name: self.name().to_string(),
                operation: "health".to_string(),
                cause: "unhealthy".to_string(),
            })
        }
    }

    async fn release(&self) -> PluginResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.step("release").await
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        if self.spec.commands.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        self.spec.context.as_ref().map(|_| self as &dyn ContextProvider)
    }
}

#[async_trait::async_trait]
impl CommandProvider for MockPlugin {
    fn commands(&self) -> Vec<PluginCommand> {
        self.spec.commands.clone()
    }

    async fn execute(&self, command: &str, args: &[String]) -> PluginResult<CommandOutput> {
        self.step("execute").await?;
        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("{} {}", command, args.join(" ")).trim_end().to_string(),
            stderr: String::new(),
        })
    }
}

#[async_trait::async_trait]
impl ContextProvider for MockPlugin {
    async fn detect_context(&self, _project_root: &Path) -> PluginResult<ContextDetection> {
        self.step("detect").await?;
        Ok(self.spec.context.clone().unwrap_or_default())
    }
}

/// First-generation plugin with optional identity
#[derive(Debug, Default)]
pub struct MockLegacyPlugin {
    pub name: Option<String>,
    pub version: Option<String>,
    pub log: CallLog,
    pub init_config: Mutex<Option<serde_json::Map<String, serde_json::Value>>>,
}

impl MockLegacyPlugin {
    pub fn new(name: Option<&str>, version: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            version: version.map(str::to_string),
            ..Self::default()
        }
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "legacy".to_string())
    }
}

#[async_trait::async_trait]
impl LegacyPlugin for MockLegacyPlugin {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    async fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> PluginResult<()> {
        *self.init_config.lock().unwrap() = Some(config.clone());
        self.log.record(&self.label(), "init");
        Ok(())
    }

    async fn start(&self) -> PluginResult<()> {
        self.log.record(&self.label(), "start");
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        self.log.record(&self.label(), "stop");
        Ok(())
    }

    async fn health_check(&self) -> PluginResult<()> {
        self.log.record(&self.label(), "health");
        Ok(())
    }
}

/// Loader handing out fresh `MockPlugin` instances per load
#[derive(Debug, Default)]
pub struct MockLoader {
    specs: Mutex<HashMap<String, MockSpec>>,
    instances: Mutex<Vec<Arc<MockPlugin>>>,
    pub log: CallLog,
}

impl MockLoader {
    pub fn new(specs: Vec<MockSpec>) -> Self {
        let loader = Self::default();
        for spec in specs {
            loader.set(spec);
        }
        loader
    }

    /// Add or replace the spec used for future loads
    pub fn set(&self, spec: MockSpec) {
        self.specs
            .lock()
            .unwrap()
            .insert(spec.metadata.name.clone(), spec);
    }

    pub fn load_count(&self, name: &str) -> usize {
        self.instances(name).len()
    }

    pub fn instances(&self, name: &str) -> Vec<Arc<MockPlugin>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.name() == name)
            .cloned()
            .collect()
    }

    pub fn latest(&self, name: &str) -> Option<Arc<MockPlugin>> {
        self.instances(name).pop()
    }

    /// The mock behind a handle returned by the manager
    pub fn instance_of(&self, plugin: &Arc<dyn Plugin>) -> Option<Arc<MockPlugin>> {
        let target = Arc::as_ptr(plugin) as *const ();
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|p| Arc::as_ptr(p) as *const () == target)
            .cloned()
    }
}

#[async_trait::async_trait]
impl PluginLoader for MockLoader {
    async fn load(&self, name: &str, path: &Path) -> PluginResult<Arc<dyn Plugin>> {
        let spec = self.specs.lock().unwrap().get(name).cloned();
        let spec = spec.ok_or_else(|| PluginError::LoadError {
            path: path.to_path_buf(),
            cause: "no mock registered".to_string(),
        })?;
        self.log.record(name, "load");
        let plugin = Arc::new(MockPlugin::new(spec, self.log.clone()));
        self.instances.lock().unwrap().push(plugin.clone());
        Ok(plugin)
    }
}

/// Executable placeholder files named after the plugin convention
pub fn plugin_dir(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in names {
        touch_plugin(dir.path(), name);
    }
    dir
}

pub fn touch_plugin(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("devctx-plugin-{}", name));
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Lifecycle timeouts short enough for tests
pub fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        init_timeout: Duration::from_millis(200),
        start_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        health_check_timeout: Duration::from_millis(200),
        health_check_interval: Duration::ZERO,
        unhealthy_threshold: 3,
    }
}

/// Manager over `dir` backed by mocks
pub struct Harness {
    pub manager: Arc<PluginManager>,
    pub loader: Arc<MockLoader>,
    pub clock: MockTimeProvider,
    pub shutdown: CancellationToken,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(specs: Vec<MockSpec>) -> Self {
        Self::with_config(specs, |_| {})
    }

    pub fn with_config(specs: Vec<MockSpec>, adjust: impl FnOnce(&mut PluginManagerConfig)) -> Self {
        let names: Vec<String> = specs.iter().map(|s| s.metadata.name.clone()).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let dir = plugin_dir(&name_refs);

        let mut config = PluginManagerConfig {
            search_paths: vec![dir.path().to_path_buf()],
            lifecycle: fast_lifecycle(),
            ..PluginManagerConfig::default()
        };
        adjust(&mut config);

        let loader = Arc::new(MockLoader::new(specs));
        let clock = MockTimeProvider::new();
        let shutdown = CancellationToken::new();
        let manager = PluginManager::with_parts(
            config,
            loader.clone(),
            Arc::new(clock.clone()),
            shutdown.clone(),
        )
        .unwrap();

        Self {
            manager: Arc::new(manager),
            loader,
            clock,
            shutdown,
            dir,
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("devctx-plugin-{}", name))
    }
}
