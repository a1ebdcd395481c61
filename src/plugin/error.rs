//! Plugin Error Handling
//!
//! Error types for resolution, loading, protocol and lifecycle failures.
//! Resolution errors are kept in their own enum so callers can tell structural
//! (cycle), referential (missing) and compatibility (version) failures apart.

use crate::core::error_handling::ContextualError;
use crate::plugin::types::LifecycleState;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for plugin operations
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Failures produced by the dependency resolver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("cyclic dependency detected: {}", format_cycle(.members))]
    CyclicDependency { members: Vec<String> },

    #[error("plugin '{plugin}' requires missing dependency '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    #[error(
        "plugin '{plugin}' requires '{dependency}' {required}, but version {available} is available"
    )]
    VersionMismatch {
        plugin: String,
        dependency: String,
        required: String,
        available: String,
    },

    #[error("plugin '{plugin}' has an invalid version or constraint '{value}': {reason}")]
    InvalidVersion {
        plugin: String,
        value: String,
        reason: String,
    },

    #[error("plugin '{plugin}' depends on '{dependency}', which could not be resolved")]
    DependencyFailed { plugin: String, dependency: String },
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::from("<empty>"),
    }
}

/// Errors raised by the plugin runtime
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {plugin_name}")]
    NotFound { plugin_name: String },

    #[error("Plugin '{plugin_name}' is already registered")]
    AlreadyExists { plugin_name: String },

    #[error("Plugin '{plugin_name}' cannot {operation} while {state}")]
    InvalidState {
        plugin_name: String,
        operation: String,
        state: LifecycleState,
    },

    #[error("Plugin '{plugin_name}' timed out during '{operation}' after {timeout:?}")]
    Timeout {
        plugin_name: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Plugin '{plugin_name}' was cancelled during '{operation}'")]
    Cancelled {
        plugin_name: String,
        operation: String,
    },

    #[error("Plugin '{plugin_name}' failed during '{operation}': {cause}")]
    OperationFailed {
        plugin_name: String,
        operation: String,
        cause: String,
    },

    #[error("Plugin '{plugin_name}' failed {failures} consecutive health checks")]
    Unhealthy { plugin_name: String, failures: u32 },

    #[error("Failed to load plugin from '{}': {cause}", .path.display())]
    LoadError { path: PathBuf, cause: String },

    #[error("Plugin '{plugin_name}' protocol error: {message}")]
    Protocol {
        plugin_name: String,
        message: String,
    },

    #[error("IO error during {operation} on '{}'", .path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown command: '{command}'")]
    CommandNotFound { command: String },

    #[error("Dependency resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PluginError {
    /// Name of the plugin the error is about, when there is one
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            PluginError::NotFound { plugin_name }
            | PluginError::AlreadyExists { plugin_name }
            | PluginError::InvalidState { plugin_name, .. }
            | PluginError::Timeout { plugin_name, .. }
            | PluginError::Cancelled { plugin_name, .. }
            | PluginError::OperationFailed { plugin_name, .. }
            | PluginError::Unhealthy { plugin_name, .. }
            | PluginError::Protocol { plugin_name, .. } => Some(plugin_name),
            _ => None,
        }
    }

    /// Timeouts and cancellations, as opposed to errors the plugin reported
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            PluginError::Timeout { .. } | PluginError::Cancelled { .. }
        )
    }
}

impl ContextualError for PluginError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            PluginError::NotFound { .. }
                | PluginError::CommandNotFound { .. }
                | PluginError::Resolution(_)
                | PluginError::Config { .. }
                | PluginError::InvalidState { .. }
        )
    }

    fn user_message(&self) -> Option<String> {
        if self.is_user_actionable() {
            Some(self.to_string())
        } else {
            None
        }
    }
}
