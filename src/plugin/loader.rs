//! Plugin loading
//!
//! The manager turns a discovered path into a live instance through a
//! `PluginLoader`. The production loader spawns the executable; tests
//! substitute in-process plugins.

use crate::plugin::error::PluginResult;
use crate::plugin::process::{connect, ProcessOptions};
use crate::plugin::traits::Plugin;
use std::path::Path;
use std::sync::Arc;

/// Creates plugin instances from discovered executables
#[async_trait::async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, name: &str, path: &Path) -> PluginResult<Arc<dyn Plugin>>;
}

/// Loads plugins by spawning them as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessLoader {
    options: ProcessOptions,
}

impl ProcessLoader {
    pub fn new(options: ProcessOptions) -> Self {
        Self { options }
    }
}

#[async_trait::async_trait]
impl PluginLoader for ProcessLoader {
    async fn load(&self, name: &str, path: &Path) -> PluginResult<Arc<dyn Plugin>> {
        connect(name, path, &self.options).await
    }
}
