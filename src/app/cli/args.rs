//! Command line arguments
//!
//! Global flags override the configuration file, which overrides built-in
//! defaults. Subcommands select what to do with the discovered plugins.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "devctx")]
#[command(about = "Project-aware developer CLI extended by plugins")]
#[command(version, long_version = crate::core::version::long_version())]
#[command(after_help = " * can be specified multiple times or as a comma-separated list")]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Additional plugin directory, searched first*
    #[arg(
        short = 'p',
        long = "plugin-dir",
        value_name = "DIR",
        action = ArgAction::Append,
        value_delimiter = ',',
        global = true
    )]
    pub plugin_dirs: Vec<PathBuf>,

    /// Plugins to exclude from discovery*
    #[arg(
        long = "exclude-plugin",
        value_name = "NAMES",
        action = ArgAction::Append,
        value_delimiter = ',',
        global = true
    )]
    pub plugin_exclusions: Vec<String>,

    /// Project root used for project-local plugins and context detection
    #[arg(short = 'r', long = "project-root", value_name = "DIR", global = true)]
    pub project_root: Option<PathBuf>,

    /// Seconds an unused plugin stays loaded (0 keeps plugins loaded)
    #[arg(long = "cache-ttl-secs", value_name = "SECONDS", global = true)]
    pub cache_ttl_secs: Option<u64>,

    /// Log level
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error", "off"],
        global = true
    )]
    pub log_level: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(
        short = 'o',
        long = "log-format",
        value_name = "FORMAT",
        value_parser = ["text", "ext", "json"],
        global = true
    )]
    pub log_format: Option<String>,

    /// Force coloured output
    #[arg(long = "color", conflicts_with = "no_color", global = true)]
    pub color: bool,

    /// Disable coloured output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// More log output (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Less log output (repeatable)
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Inspect installed plugins
    Plugins {
        #[command(subcommand)]
        action: PluginsAction,
    },
    /// Show the project context detected by plugins
    Context,
    /// Run a plugin-provided command
    Run {
        /// Command name or alias
        command: String,
        /// Arguments passed to the plugin unchanged
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginsAction {
    /// List plugin executables without starting them
    List,
    /// Start every plugin and show its lifecycle status
    Status,
    /// Show the command table across all plugins
    Commands,
}

impl Args {
    /// Net verbosity: `-v` raises, `-q` lowers
    pub fn verbosity(&self) -> i8 {
        self.verbose.min(5) as i8 - self.quiet.min(5) as i8
    }

    /// `Some(true)` for `--color`, `Some(false)` for `--no-color`
    pub fn color_override(&self) -> Option<bool> {
        match (self.color, self.no_color) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// Log file, where `none` disables file logging
    pub fn log_file_path(&self) -> Option<Option<PathBuf>> {
        self.log_file.as_ref().map(|path| {
            if path.as_os_str().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(path.clone())
            }
        })
    }
}
