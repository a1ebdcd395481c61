//! TOML configuration file parsing and loading
//!
//! Loads the configuration file, validates its values and merges it with the
//! command line into the settings the plugin manager is built from.
//! Precedence is command line, then file, then built-in defaults.

use super::args::Args;
use crate::plugin::api::{
    default_search_paths, DetectionLimits, LifecycleConfig, PluginConfig, PluginManagerConfig,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_DIR: &str = ".devctx";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Errors while loading the configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The specified configuration file does not exist: {}", .path.display())]
    Missing { path: PathBuf },

    #[error("Error reading configuration file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error parsing configuration file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },
}

impl crate::core::error_handling::ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<String> {
        Some(self.to_string())
    }
}

/// `[lifecycle]` table; unset keys keep their defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub init_timeout_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub health_check_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub unhealthy_threshold: Option<u32>,
    pub detect_timeout_ms: Option<u64>,
    pub detect_deadline_ms: Option<u64>,
}

/// Values read from the configuration file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub plugin_dirs: Vec<PathBuf>,
    pub exclude_plugins: Vec<String>,
    pub base_dir: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_file: Option<PathBuf>,
    pub color: Option<bool>,
    pub lifecycle: LifecycleSettings,
    /// Raw `[plugins.<name>]` tables
    pub plugins: HashMap<String, PluginConfig>,
}

impl FileConfig {
    /// `<config_dir>/Devctx/devctx.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Devctx").join("devctx.toml"))
    }

    /// Load the explicit file, or the default one when it exists
    ///
    /// An explicit file must exist; a missing default file is not an error.
    pub async fn load(explicit: Option<&Path>) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::Missing {
                        path: path.to_path_buf(),
                    });
                }
                path.to_path_buf()
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(None),
            },
        };

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let table = toml::from_str::<toml::Table>(&contents).map_err(|source| {
            ConfigError::Parse {
                path: path.clone(),
                source,
            }
        })?;

        let config = Self::from_table(&table)?;
        Ok(Some((path, config)))
    }

    pub fn from_table(config: &toml::Table) -> Result<Self, ConfigError> {
        let mut file = FileConfig {
            plugin_dirs: string_array(config, "plugin-dir")?
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            exclude_plugins: string_array(config, "exclude-plugin")?,
            base_dir: string_field(config, "base-dir")?,
            cache_ttl_secs: integer_field(config, "cache-ttl-secs")?,
            log_level: string_field(config, "log-level")?,
            log_format: string_field(config, "log-format")?,
            log_file: string_field(config, "log-file")?.map(PathBuf::from),
            color: bool_field(config, "color")?,
            ..FileConfig::default()
        };

        if let Some(level) = &file.log_level {
            const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];
            if !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(invalid("log-level", format!("unknown level '{}'", level)));
            }
        }
        if let Some(format) = &file.log_format {
            if crate::core::logging::LogFormat::parse(format).is_none() {
                return Err(invalid("log-format", format!("unknown format '{}'", format)));
            }
        }

        if let Some(value) = config.get("lifecycle") {
            let table = value
                .as_table()
                .ok_or_else(|| invalid("lifecycle", "expected a table".to_string()))?;
            file.lifecycle = LifecycleSettings {
                init_timeout_ms: integer_field(table, "init-timeout-ms")?,
                start_timeout_ms: integer_field(table, "start-timeout-ms")?,
                stop_timeout_ms: integer_field(table, "stop-timeout-ms")?,
                health_check_timeout_ms: integer_field(table, "health-check-timeout-ms")?,
                health_check_interval_ms: integer_field(table, "health-check-interval-ms")?,
                unhealthy_threshold: integer_field(table, "unhealthy-threshold")?,
                detect_timeout_ms: integer_field(table, "detect-timeout-ms")?,
                detect_deadline_ms: integer_field(table, "detect-deadline-ms")?,
            };
            if file.lifecycle.unhealthy_threshold == Some(0) {
                return Err(invalid(
                    "lifecycle.unhealthy-threshold",
                    "must be at least 1".to_string(),
                ));
            }
        }

        if let Some(value) = config.get("plugins") {
            let table = value
                .as_table()
                .ok_or_else(|| invalid("plugins", "expected a table".to_string()))?;
            for (name, section) in table {
                let key = format!("plugins.{}", name);
                let section = section
                    .as_table()
                    .ok_or_else(|| invalid(&key, "expected a table".to_string()))?;
                let plugin_config =
                    PluginConfig::from_toml(section).map_err(|message| invalid(&key, message))?;
                file.plugins.insert(name.clone(), plugin_config);
            }
        }

        Ok(file)
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message,
    }
}

fn string_field(config: &toml::Table, key: &str) -> Result<Option<String>, ConfigError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(key, "expected a string".to_string())),
    }
}

fn bool_field(config: &toml::Table, key: &str) -> Result<Option<bool>, ConfigError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(key, "expected true or false".to_string())),
    }
}

fn integer_field<T: TryFrom<i64>>(
    config: &toml::Table,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => {
            let number = value
                .as_integer()
                .ok_or_else(|| invalid(key, "expected an integer".to_string()))?;
            T::try_from(number)
                .map(Some)
                .map_err(|_| invalid(key, format!("{} is out of range", number)))
        }
    }
}

/// Single string or array of strings, comma-separated entries split out
fn string_array(config: &toml::Table, key: &str) -> Result<Vec<String>, ConfigError> {
    let raw: Vec<&str> = match config.get(key) {
        None => return Ok(Vec::new()),
        Some(toml::Value::String(s)) => vec![s.as_str()],
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| invalid(key, "expected an array of strings".to_string()))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(invalid(
                key,
                "expected a string or an array of strings".to_string(),
            ))
        }
    };

    let mut values: Vec<String> = Vec::new();
    for entry in raw.iter().flat_map(|s| s.split(',')) {
        let entry = entry.trim();
        if !entry.is_empty() && !values.iter().any(|v| v == entry) {
            values.push(entry.to_string());
        }
    }
    Ok(values)
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

/// Combine command line, file and defaults into the manager configuration
pub fn manager_config(
    args: &Args,
    file: &FileConfig,
    project_root: &Path,
) -> PluginManagerConfig {
    let mut explicit = args.plugin_dirs.clone();
    explicit.extend(file.plugin_dirs.iter().cloned());

    let base_dir = file.base_dir.as_deref().unwrap_or(DEFAULT_BASE_DIR);
    let search_paths = default_search_paths(&explicit, Some(project_root), base_dir);

    let mut excluded_plugins = args.plugin_exclusions.clone();
    for name in &file.exclude_plugins {
        if !excluded_plugins.contains(name) {
            excluded_plugins.push(name.clone());
        }
    }

    let lifecycle_defaults = LifecycleConfig::default();
    let settings = &file.lifecycle;
    let lifecycle = LifecycleConfig {
        init_timeout: millis(settings.init_timeout_ms, lifecycle_defaults.init_timeout),
        start_timeout: millis(settings.start_timeout_ms, lifecycle_defaults.start_timeout),
        stop_timeout: millis(settings.stop_timeout_ms, lifecycle_defaults.stop_timeout),
        health_check_timeout: millis(
            settings.health_check_timeout_ms,
            lifecycle_defaults.health_check_timeout,
        ),
        health_check_interval: millis(
            settings.health_check_interval_ms,
            lifecycle_defaults.health_check_interval,
        ),
        unhealthy_threshold: settings
            .unhealthy_threshold
            .unwrap_or(lifecycle_defaults.unhealthy_threshold),
    };

    let detection_defaults = DetectionLimits::default();
    let detection = DetectionLimits {
        per_plugin: millis(settings.detect_timeout_ms, detection_defaults.per_plugin),
        overall: millis(settings.detect_deadline_ms, detection_defaults.overall),
    };

    let cache_ttl_secs = args
        .cache_ttl_secs
        .or(file.cache_ttl_secs)
        .unwrap_or(DEFAULT_CACHE_TTL_SECS);

    PluginManagerConfig {
        search_paths,
        excluded_plugins,
        cache_ttl: Duration::from_secs(cache_ttl_secs),
        lifecycle,
        detection,
        plugin_configs: file.plugins.clone(),
        ..PluginManagerConfig::default()
    }
}
