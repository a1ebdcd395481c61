//! Type definitions for the plugin system
//!
//! Metadata, command surface, lifecycle state and context-enrichment types
//! shared by the resolver, the lifecycle manager and the plugin manager.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use strum_macros::{Display, EnumIter};

/// Identity, version and dependencies of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
}

impl PluginMetadata {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Names of dependencies that must be present and started first
    pub fn required_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| !d.optional)
            .map(|d| d.name.as_str())
    }
}

/// Requirement one plugin places on another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    /// Caret-style constraint such as `^1.2.0`
    #[serde(default, alias = "version")]
    pub version_constraint: String,
    #[serde(default)]
    pub optional: bool,
}

impl PluginDependency {
    pub fn required(name: &str, version_constraint: &str) -> Self {
        Self {
            name: name.to_string(),
            version_constraint: version_constraint.to_string(),
            optional: false,
        }
    }

    pub fn optional(name: &str, version_constraint: &str) -> Self {
        Self {
            optional: true,
            ..Self::required(name, version_constraint)
        }
    }
}

/// Supervision phase of a plugin instance
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Registered,
    Initialized,
    Started,
    Stopped,
    Errored,
}

impl LifecycleState {
    /// True for states that hold live plugin resources
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Initialized | LifecycleState::Started)
    }
}

/// A command a plugin contributes to the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub name: String,
    /// Command line the plugin runs for this command
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl PluginCommand {
    pub fn new(name: &str, cmd: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            cmd: cmd.to_string(),
            description: description.to_string(),
            aliases: Vec::new(),
        }
    }
}

/// One row of the command table handed to the CLI dispatch layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub plugin: String,
    /// Primary name of the command, also for alias rows
    pub command: String,
    pub cmd: String,
    pub description: String,
}

/// Command name (or alias) to owning plugin
pub type CommandTable = BTreeMap<String, CommandEntry>;

/// Result of running a plugin command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// One plugin's answer to a context detection request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDetection {
    /// Framework or capability the plugin recognised, if any
    #[serde(default)]
    pub framework: Option<String>,
    /// Self-reported confidence, higher wins
    #[serde(default)]
    pub confidence: f64,
    /// Extra key/value context contributed by the plugin
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Winning detection for one framework
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkDetection {
    pub plugin: String,
    pub confidence: f64,
}

/// Merged context contributed by all context-capable plugins
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectContext {
    pub frameworks: BTreeMap<String, FrameworkDetection>,
    /// Values keyed by the plugin that produced them
    pub extensions: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    /// Plugins that errored or missed their deadline
    pub skipped: Vec<String>,
}

/// Lifecycle view of one plugin for `plugins status`
#[derive(Debug, Clone, PartialEq)]
pub struct PluginStatus {
    pub name: String,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Raw per-plugin configuration, forwarded without interpretation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig {
    values: serde_json::Map<String, serde_json::Value>,
}

impl PluginConfig {
    pub fn new(values: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Convert a `[plugins.<name>]` TOML table
    pub fn from_toml(table: &toml::Table) -> Result<Self, String> {
        match serde_json::to_value(table).map_err(|e| e.to_string())? {
            serde_json::Value::Object(values) => Ok(Self { values }),
            other => Err(format!("expected a table, found {}", other)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.values
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.values.clone())
    }
}

/// A candidate executable found by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCandidate {
    /// Short name derived from the file name
    pub name: String,
    pub path: PathBuf,
}
