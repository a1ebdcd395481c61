//! Plugin Registry
//!
//! Thread-safe record of every plugin the manager has loaded at least once:
//! where it came from, what it declared and which commands it offers. The
//! registry outlives cache entries, so an evicted plugin can be reloaded from
//! the same path and keeps its discovery position.

use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::types::{CommandEntry, CommandTable, PluginCommand, PluginMetadata};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What the registry knows about one plugin
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredPlugin {
    pub name: String,
    pub path: PathBuf,
    pub metadata: PluginMetadata,
    pub commands: Vec<PluginCommand>,
    /// Position in discovery order; earlier plugins win ties
    pub discovery_index: usize,
}

/// Plugin registry for loaded plugin metadata
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, RegisteredPlugin>,
    next_index: usize,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin that has not been seen before
    pub fn register_plugin(
        &mut self,
        name: &str,
        path: PathBuf,
        metadata: PluginMetadata,
        commands: Vec<PluginCommand>,
    ) -> PluginResult<()> {
        if self.plugins.contains_key(name) {
            return Err(PluginError::AlreadyExists {
                plugin_name: name.to_string(),
            });
        }
        self.record(name, path, metadata, commands);
        Ok(())
    }

    /// Register or refresh a plugin, keeping its discovery position
    pub fn upsert_plugin(
        &mut self,
        name: &str,
        path: PathBuf,
        metadata: PluginMetadata,
        commands: Vec<PluginCommand>,
    ) {
        match self.plugins.get_mut(name) {
            Some(existing) => {
                existing.path = path;
                existing.metadata = metadata;
                existing.commands = commands;
            }
            None => self.record(name, path, metadata, commands),
        }
    }

    fn record(
        &mut self,
        name: &str,
        path: PathBuf,
        metadata: PluginMetadata,
        commands: Vec<PluginCommand>,
    ) {
        let discovery_index = self.next_index;
        self.next_index += 1;
        self.plugins.insert(
            name.to_string(),
            RegisteredPlugin {
                name: name.to_string(),
                path,
                metadata,
                commands,
                discovery_index,
            },
        );
    }

    /// Reserve discovery positions ahead of concurrent loading
    pub fn reserve_order(&mut self, names: &[String]) -> HashMap<String, usize> {
        names
            .iter()
            .map(|name| {
                let index = match self.plugins.get(name) {
                    Some(existing) => existing.discovery_index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        index
                    }
                };
                (name.clone(), index)
            })
            .collect()
    }

    /// Register with a position obtained from `reserve_order`
    pub fn upsert_at(
        &mut self,
        name: &str,
        discovery_index: usize,
        path: PathBuf,
        metadata: PluginMetadata,
        commands: Vec<PluginCommand>,
    ) {
        self.plugins.insert(
            name.to_string(),
            RegisteredPlugin {
                name: name.to_string(),
                path,
                metadata,
                commands,
                discovery_index,
            },
        );
    }

    pub fn get_plugin(&self, name: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(name)
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn unregister_plugin(&mut self, name: &str) -> PluginResult<RegisteredPlugin> {
        self.plugins
            .remove(name)
            .ok_or_else(|| PluginError::NotFound {
                plugin_name: name.to_string(),
            })
    }

    /// Get list of all plugin names, sorted
    pub fn get_plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Plugin names in the order they were discovered
    pub fn discovery_order(&self) -> Vec<String> {
        let mut plugins: Vec<&RegisteredPlugin> = self.plugins.values().collect();
        plugins.sort_by_key(|p| p.discovery_index);
        plugins.into_iter().map(|p| p.name.clone()).collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Declared metadata keyed by plugin name, ready for the resolver
    pub fn metadata_map(&self) -> HashMap<String, PluginMetadata> {
        self.plugins
            .iter()
            .map(|(name, plugin)| {
                let mut metadata = plugin.metadata.clone();
                metadata.name = name.clone();
                (name.clone(), metadata)
            })
            .collect()
    }

    /// Command name and alias table across every plugin
    ///
    /// Plugins are visited in discovery order; on a clash the earlier plugin
    /// keeps the name.
    pub fn command_table(&self) -> CommandTable {
        let mut table = CommandTable::new();
        for name in self.discovery_order() {
            let Some(plugin) = self.plugins.get(&name) else {
                continue;
            };
            for command in &plugin.commands {
                let entry = CommandEntry {
                    plugin: name.clone(),
                    command: command.name.clone(),
                    cmd: command.cmd.clone(),
                    description: command.description.clone(),
                };
                for key in std::iter::once(&command.name).chain(command.aliases.iter()) {
                    match table.get(key) {
                        Some(existing) if existing.plugin != name => log::warn!(
                            "Command '{}' from plugin '{}' is shadowed by plugin '{}'",
                            key,
                            name,
                            existing.plugin
                        ),
                        Some(_) => {}
                        None => {
                            table.insert(key.clone(), entry.clone());
                        }
                    }
                }
            }
        }
        table
    }

    pub fn clear(&mut self) {
        self.plugins.clear();
    }
}

/// Shared plugin registry
#[derive(Debug, Clone, Default)]
pub struct SharedPluginRegistry {
    inner: Arc<RwLock<PluginRegistry>>,
}

impl SharedPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get access to the inner registry for read/write operations
    pub fn inner(&self) -> &Arc<RwLock<PluginRegistry>> {
        &self.inner
    }

    pub async fn has_plugin(&self, name: &str) -> bool {
        self.inner.read().await.has_plugin(name)
    }

    pub async fn get_plugin_names(&self) -> Vec<String> {
        self.inner.read().await.get_plugin_names()
    }

    pub async fn get_plugin(&self, name: &str) -> Option<RegisteredPlugin> {
        self.inner.read().await.get_plugin(name).cloned()
    }

    pub async fn command_table(&self) -> CommandTable {
        self.inner.read().await.command_table()
    }

    pub async fn plugin_count(&self) -> usize {
        self.inner.read().await.plugin_count()
    }
}
