//! Plugin Trait System
//!
//! The canonical `Plugin` contract every supervised instance satisfies, the
//! older `LegacyPlugin` contract v1 plugins satisfy, and the narrow
//! capability traits the manager asks for.
//!
//! # Plugin Architecture
//!
//! Plugins are separate executables. The host only ever talks to them through
//! these traits:
//!
//! - **Plugin**: identity, configuration and lifecycle hooks
//! - **CommandProvider**: contributes commands to the CLI
//! - **ContextProvider**: enriches the project context
//!
//! A plugin that does not offer a capability returns `None` from the matching
//! accessor. v1 plugins are wrapped by `LegacyAdapter` so the rest of the host
//! never needs to know which generation it is dealing with.
//!
//! All methods take `&self`; implementations keep mutable state behind their
//! own locks so an instance can be shared between the lifecycle manager and the
//! cache.

use crate::plugin::error::PluginResult;
use crate::plugin::types::{
    CommandOutput, ContextDetection, PluginCommand, PluginConfig, PluginMetadata,
};
use std::path::Path;

/// Base plugin trait that all supervised plugins implement
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Get plugin metadata
    fn metadata(&self) -> PluginMetadata;

    /// Apply the plugin's raw configuration
    ///
    /// Called once, immediately before `init`.
    async fn configure(&self, config: &PluginConfig) -> PluginResult<()>;

    /// Acquire resources
    async fn init(&self) -> PluginResult<()>;

    /// Begin serving
    async fn start(&self) -> PluginResult<()>;

    /// Stop serving; resources are released separately by `release`
    async fn stop(&self) -> PluginResult<()>;

    /// Report whether the plugin is still able to serve
    async fn health_check(&self) -> PluginResult<()>;

    /// Free everything the instance holds, including its process
    ///
    /// Must be idempotent: it is called after stop, after failures and on
    /// eviction, possibly more than once.
    async fn release(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Probe for the command capability
    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        None
    }

    /// Probe for the context-enrichment capability
    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        None
    }
}

/// Contract offered by first-generation plugins
///
/// v1 plugins report their identity loosely, take their configuration as an
/// untyped map at init time and have no separate configure step.
#[async_trait::async_trait]
pub trait LegacyPlugin: Send + Sync {
    fn name(&self) -> Option<String>;

    fn version(&self) -> Option<String>;

    async fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> PluginResult<()>;

    async fn start(&self) -> PluginResult<()>;

    async fn stop(&self) -> PluginResult<()>;

    async fn health_check(&self) -> PluginResult<()>;

    async fn release(&self) -> PluginResult<()> {
        Ok(())
    }

    fn as_command_provider(&self) -> Option<&dyn CommandProvider> {
        None
    }

    fn as_context_provider(&self) -> Option<&dyn ContextProvider> {
        None
    }
}

/// Plugins that contribute commands to the CLI
#[async_trait::async_trait]
pub trait CommandProvider: Send + Sync {
    /// Commands advertised by the plugin; never touches lifecycle state
    fn commands(&self) -> Vec<PluginCommand>;

    /// Run one of the advertised commands
    async fn execute(&self, command: &str, args: &[String]) -> PluginResult<CommandOutput>;
}

/// Plugins that add detected context for a project
#[async_trait::async_trait]
pub trait ContextProvider: Send + Sync {
    async fn detect_context(&self, project_root: &Path) -> PluginResult<ContextDetection>;
}
