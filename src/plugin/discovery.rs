//! Plugin Discovery
//!
//! Finds plugin executables without starting them. A plugin is an executable
//! file named `<prefix>-plugin-<name>` (with `.exe` on Windows) directly
//! inside one of the search directories; anything else is ignored.
//!
//! Directories are searched in order and the first occurrence of a name wins.
//! Within one directory candidates are visited in file-name order.

use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::types::PluginCandidate;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Configuration for plugin discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Directories to search, highest precedence first
    pub search_paths: Vec<PathBuf>,
    /// Plugin names to skip
    pub excluded_plugins: Vec<String>,
    /// Executable name prefix, `devctx` gives `devctx-plugin-<name>`
    pub prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            excluded_plugins: Vec::new(),
            prefix: "devctx".to_string(),
        }
    }
}

/// Build the search path list: explicit directories, then the project-local
/// and user-global plugin directories under `base_dir`
pub fn default_search_paths(
    explicit: &[PathBuf],
    project_root: Option<&Path>,
    base_dir: &str,
) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = explicit.to_vec();

    if let Some(root) = project_root {
        paths.push(root.join(base_dir).join("plugins"));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(base_dir).join("plugins"));
    }

    let mut seen = HashSet::new();
    paths.retain(|path| seen.insert(path.clone()));
    paths
}

/// Scans search directories for plugin executables
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    config: DiscoveryConfig,
    pattern: Regex,
}

impl PluginDiscovery {
    pub fn new(config: DiscoveryConfig) -> PluginResult<Self> {
        let pattern = Regex::new(&format!(
            r"^{}-plugin-([a-z0-9][a-z0-9_-]*?)(\.exe)?$",
            regex::escape(&config.prefix)
        ))
        .map_err(|e| PluginError::Config {
            message: format!("invalid plugin prefix '{}': {}", config.prefix, e),
        })?;
        Ok(Self { config, pattern })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Plugin name encoded in `file_name`, if it follows the convention
    pub fn plugin_name(&self, file_name: &str) -> Option<String> {
        let captures = self.pattern.captures(file_name)?;
        if captures.get(2).is_some() && !cfg!(windows) {
            return None;
        }
        captures.get(1).map(|m| m.as_str().to_string())
    }

    /// Executable file name for plugin `name`
    pub fn executable_name(&self, name: &str) -> String {
        let base = format!("{}-plugin-{}", self.config.prefix, name);
        if cfg!(windows) {
            base + ".exe"
        } else {
            base
        }
    }

    /// Every plugin candidate, deduplicated by name
    pub async fn discover(&self) -> Vec<PluginCandidate> {
        let mut candidates = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for dir in &self.config.search_paths {
            for candidate in self.scan_directory(dir).await {
                if self.config.excluded_plugins.contains(&candidate.name) {
                    log::debug!("Skipping excluded plugin '{}'", candidate.name);
                    continue;
                }
                if !seen.insert(candidate.name.clone()) {
                    log::debug!(
                        "Plugin '{}' at {} is shadowed by an earlier directory",
                        candidate.name,
                        candidate.path.display()
                    );
                    continue;
                }
                candidates.push(candidate);
            }
        }

        log::debug!("Discovered {} plugin candidates", candidates.len());
        candidates
    }

    /// Path the plugin `name` would be loaded from, following search order
    pub async fn find(&self, name: &str) -> Option<PathBuf> {
        if self.config.excluded_plugins.iter().any(|n| n == name) {
            return None;
        }
        let file_name = self.executable_name(name);
        for dir in &self.config.search_paths {
            let path = dir.join(&file_name);
            if is_executable(&path).await {
                return Some(path);
            }
        }
        None
    }

    // Non-recursive; unreadable directories yield nothing
    async fn scan_directory(&self, dir: &Path) -> Vec<PluginCandidate> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Cannot read plugin directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Error while reading {}: {}", dir.display(), e);
                    break;
                }
            };

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|f| self.plugin_name(f)) else {
                continue;
            };
            let path = entry.path();
            if !is_executable(&path).await {
                log::trace!("Ignoring non-executable {}", path.display());
                continue;
            }
            candidates.push(PluginCandidate { name, path });
        }

        candidates.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        candidates
    }
}

/// Regular file with an execute bit (any file on non-unix targets)
pub async fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
