//! Plugin processes
//!
//! Spawns a plugin executable, speaks the line protocol with it and turns it
//! into a `Plugin`. Responses are matched to requests by id on a background
//! reader task, so one slow request never blocks another.
//!
//! `connect` is the only place that looks at the plugin generation: first
//! generation plugins are wrapped in a `LegacyAdapter`, everything else is
//! supervised directly.

use crate::core::version::get_protocol_version;
use crate::plugin::adapter::LegacyAdapter;
use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::protocol::{
    HandshakeResult, Request, Response, CAPABILITY_COMMANDS, CAPABILITY_CONTEXT,
    METHOD_COMMANDS, METHOD_CONFIGURE, METHOD_DETECT_CONTEXT, METHOD_EXECUTE, METHOD_HANDSHAKE,
    METHOD_HEALTH, METHOD_INIT, METHOD_METADATA, METHOD_START, METHOD_STOP,
};
use crate::plugin::traits::{CommandProvider, ContextProvider, LegacyPlugin, Plugin};
use crate::plugin::types::{
    CommandOutput, ContextDetection, PluginCommand, PluginConfig, PluginMetadata,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Timeouts for talking to plugin processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Spawn plus handshake, metadata and command listing
    pub handshake_timeout: Duration,
    /// Upper bound for a single protocol request
    pub request_timeout: Duration,
    /// Upper bound for running a command
    pub execute_timeout: Duration,
    /// How long a process may take to exit after its input is closed
    pub terminate_grace: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            execute_timeout: Duration::from_secs(600),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// A running plugin executable
pub struct PluginProcess {
    name: String,
    path: PathBuf,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
    grace: Duration,
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("terminated", &self.terminated.load(Ordering::Acquire))
            .finish()
    }
}

impl PluginProcess {
    /// Spawn `path` with piped stdio
    pub fn spawn(name: &str, path: &Path, grace: Duration) -> PluginResult<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::LoadError {
                path: path.to_path_buf(),
                cause: format!("failed to start process: {}", e),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| PluginError::LoadError {
            path: path.to_path_buf(),
            cause: "process has no stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = vec![tokio::spawn(read_responses(
            name.to_string(),
            BufReader::new(stdout),
            pending.clone(),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(
                name.to_string(),
                BufReader::new(stderr),
            )));
        }

        log::debug!("Spawned plugin '{}' from {}", name, path.display());
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(tasks),
            terminated: AtomicBool::new(false),
            grace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Send one request and wait for its response
    pub async fn request(&self, method: &str, params: Value, limit: Duration) -> PluginResult<Value> {
        if self.is_terminated() {
            return Err(self.protocol_error("process has been terminated"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| self.protocol_error(&format!("cannot encode request: {}", e)))?;
        line.push('\n');

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        log::trace!("-> {} {}", self.name, line.trim_end());

        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|cause| PluginError::OperationFailed {
                    plugin_name: self.name.clone(),
                    operation: method.to_string(),
                    cause,
                }),
            Ok(Err(_)) => Err(self.protocol_error("process closed its output")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(PluginError::Timeout {
                    plugin_name: self.name.clone(),
                    operation: method.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// `request`, decoding the result
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> PluginResult<T> {
        let value = self.request(method, params, limit).await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(&format!("invalid '{}' result: {}", method, e)))
    }

    async fn write_line(&self, line: &str) -> PluginResult<()> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| self.protocol_error("process input is closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.protocol_error(&format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| self.protocol_error(&format!("flush failed: {}", e)))
    }

    /// Close input, wait briefly for a clean exit, then kill
    ///
    /// Idempotent; later calls return immediately.
    pub async fn terminate(&self) -> PluginResult<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        let result = match child {
            Some(mut child) => match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => {
                    log::debug!("Plugin '{}' exited with {}", self.name, status);
                    Ok(())
                }
                Ok(Err(e)) => Err(PluginError::Io {
                    operation: "wait".to_string(),
                    path: self.path.clone(),
                    source: e,
                }),
                Err(_) => {
                    log::debug!("Plugin '{}' did not exit in time; killing", self.name);
                    child.kill().await.map_err(|e| PluginError::Io {
                        operation: "kill".to_string(),
                        path: self.path.clone(),
                        source: e,
                    })
                }
            },
            None => Ok(()),
        };

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.pending.lock().await.clear();
        result
    }

    fn protocol_error(&self, message: &str) -> PluginError {
        PluginError::Protocol {
            plugin_name: self.name.clone(),
            message: message.to_string(),
        }
    }
}

async fn read_responses(
    name: String,
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                log::debug!("Plugin '{}' closed its output", name);
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                log::trace!("<- {} {}", name, trimmed);
                match serde_json::from_str::<Response>(trimmed) {
                    Ok(response) => match pending.lock().await.remove(&response.id) {
                        Some(sender) => {
                            let _ = sender.send(response);
                        }
                        None => log::debug!(
                            "Plugin '{}' answered unknown request {}",
                            name,
                            response.id
                        ),
                    },
                    Err(e) => log::warn!("Plugin '{}' sent an unreadable line: {}", name, e),
                }
            }
            Err(e) => {
                log::warn!("Error reading from plugin '{}': {}", name, e);
                break;
            }
        }
    }
    // Dropping the senders fails every outstanding request
    pending.lock().await.clear();
}

async fn forward_stderr(name: String, reader: BufReader<tokio::process::ChildStderr>) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[{}] {}", name, line);
    }
}

/// Protocol requests shared by both plugin generations
struct Endpoint {
    process: PluginProcess,
    options: ProcessOptions,
    commands: Vec<PluginCommand>,
    has_commands: bool,
    has_context: bool,
}

impl Endpoint {
    async fn simple(&self, method: &str, params: Value) -> PluginResult<()> {
        self.process
            .request(method, params, self.options.request_timeout)
            .await
            .map(|_| ())
    }

    fn command_provider(&self) -> Option<&dyn CommandProvider> {
        if self.has_commands {
            Some(self)
        } else {
            None
        }
    }

    fn context_provider(&self) -> Option<&dyn ContextProvider> {
        if self.has_context {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl CommandProvider for Endpoint {
    fn commands(&self) -> Vec<PluginCommand> {
        self.commands.clone()
    }

    async fn execute(&self, command: &str, args: &[String]) -> PluginResult<CommandOutput> {
        self.process
            .call(
                METHOD_EXECUTE,
                json!({"command": command, "args": args}),
                self.options.execute_timeout,
            )
            .await
    }
}

#[async_trait::async_trait]
impl ContextProvider for Endpoint {
    async fn detect_context(&self, project_root: &Path) -> PluginResult<ContextDetection> {
        self.process
            .call(
                METHOD_DETECT_CONTEXT,
                json!({"project_root": project_root}),
                self.options.request_timeout,
            )
            .await
    }
}

/// A current-generation plugin process
pub struct ProcessPlugin {
    metadata: PluginMetadata,
    endpoint: Endpoint,
}

#[async_trait::async_trait]
impl Plugin for ProcessPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    async fn configure(&self, config: &PluginConfig) -> PluginResult<()> {
        self.endpoint
            .simple(METHOD_CONFIGURE, config.to_value())
            .await
    }

    async fn init(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_INIT, Value::Null).await
    }

    async fn start(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_START, Value::Null).await
    }

    async fn stop(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_STOP, Value::Null).await
    }

    async fn health_check(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_HEALTH, Value::Null).await
    }

    async fn release(&self) -> PluginResult<()> {
        self.endpoint.process.terminate().await
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        self.endpoint.command_provider()
    }

    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        self.endpoint.context_provider()
    }
}

/// A first-generation plugin process
pub struct LegacyProcessPlugin {
    handshake: HandshakeResult,
    endpoint: Endpoint,
}

#[async_trait::async_trait]
impl LegacyPlugin for LegacyProcessPlugin {
    fn name(&self) -> Option<String> {
        self.handshake.name.clone()
    }

    fn version(&self) -> Option<String> {
        self.handshake.version.clone()
    }

    async fn init(&self, config: &serde_json::Map<String, Value>) -> PluginResult<()> {
        self.endpoint
            .simple(METHOD_INIT, Value::Object(config.clone()))
            .await
    }

    async fn start(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_START, Value::Null).await
    }

    async fn stop(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_STOP, Value::Null).await
    }

    async fn health_check(&self) -> PluginResult<()> {
        self.endpoint.simple(METHOD_HEALTH, Value::Null).await
    }

    async fn release(&self) -> PluginResult<()> {
        self.endpoint.process.terminate().await
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        self.endpoint.command_provider()
    }

    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        self.endpoint.context_provider()
    }
}

/// Spawn the plugin at `path`, handshake and wrap it as a `Plugin`
///
/// `name` is the name derived from the executable. It labels log lines and
/// errors and is the fallback identity for plugins that report none.
pub async fn connect(name: &str, path: &Path, options: &ProcessOptions) -> PluginResult<Arc<dyn Plugin>> {
    let process = PluginProcess::spawn(name, path, options.terminate_grace)?;

    match handshake(name, process, options).await {
        Ok(plugin) => Ok(plugin),
        Err((process, cause)) => {
            if let Err(e) = process.terminate().await {
                log::debug!("Failed to terminate '{}' after load error: {}", name, e);
            }
            Err(PluginError::LoadError {
                path: path.to_path_buf(),
                cause,
            })
        }
    }
}

async fn handshake(
    name: &str,
    process: PluginProcess,
    options: &ProcessOptions,
) -> Result<Arc<dyn Plugin>, (PluginProcess, String)> {
    let limit = options.handshake_timeout;

    let hello: HandshakeResult = match process
        .call(
            METHOD_HANDSHAKE,
            json!({"host_version": get_protocol_version()}),
            limit,
        )
        .await
    {
        Ok(hello) => hello,
        Err(e) => return Err((process, format!("handshake failed: {}", e))),
    };

    let generation = hello.generation();
    if generation > get_protocol_version() {
        return Err((
            process,
            format!("unsupported protocol version {}", generation),
        ));
    }

    let commands: Vec<PluginCommand> = if hello.has_capability(CAPABILITY_COMMANDS) {
        match process.call(METHOD_COMMANDS, Value::Null, limit).await {
            Ok(commands) => commands,
            Err(e) => return Err((process, format!("command listing failed: {}", e))),
        }
    } else {
        Vec::new()
    };

    let metadata: Option<PluginMetadata> = if generation >= 2 {
        match process.call(METHOD_METADATA, Value::Null, limit).await {
            Ok(metadata) => Some(metadata),
            Err(e) => return Err((process, format!("metadata request failed: {}", e))),
        }
    } else {
        None
    };

    let endpoint = Endpoint {
        process,
        options: options.clone(),
        commands,
        has_commands: hello.has_capability(CAPABILITY_COMMANDS),
        has_context: hello.has_capability(CAPABILITY_CONTEXT),
    };

    match metadata {
        Some(metadata) => {
            log::debug!("Loaded plugin '{}' {} (protocol v2)", name, metadata.version);
            Ok(Arc::new(ProcessPlugin { metadata, endpoint }))
        }
        None => {
            log::debug!("Loaded plugin '{}' (protocol v1)", name);
            let legacy = LegacyProcessPlugin {
                handshake: hello,
                endpoint,
            };
            Ok(Arc::new(LegacyAdapter::new(legacy, Some(name))))
        }
    }
}
