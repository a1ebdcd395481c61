//! Application start-up
//!
//! Parses arguments, merges the configuration file, starts logging, builds
//! the plugin manager and dispatches the subcommand. Plugins are always
//! cleaned up before the process exits, including after an interrupt.

use super::cli::args::{Args, Command, PluginsAction};
use super::cli::config::{manager_config, FileConfig};
use super::cli::display;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::{init_logging, level_for_verbosity, LogFormat};
use crate::core::shutdown::ShutdownCoordinator;
use crate::plugin::api::{Advisory, PluginManager, PluginResult};
use clap::Parser;
use colored::Colorize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Exit code for configuration and usage errors
const EXIT_CONFIG: i32 = 2;
/// Exit code after an interrupt
const EXIT_INTERRUPTED: i32 = 130;

/// Run the CLI and return the process exit code
pub async fn startup() -> i32 {
    let args = Args::parse();

    let file = match FileConfig::load(args.config_file.as_deref()).await {
        Ok(Some((_, file))) => file,
        Ok(None) => FileConfig::default(),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_CONFIG;
        }
    };

    let use_color = args
        .color_override()
        .or(file.color)
        .unwrap_or_else(|| std::io::stdout().is_terminal());
    colored::control::set_override(use_color);

    let base_level = args
        .log_level
        .as_deref()
        .or(file.log_level.as_deref())
        .unwrap_or("warn");
    let log_level = level_for_verbosity(base_level, args.verbosity());
    let log_format = args
        .log_format
        .as_deref()
        .or(file.log_format.as_deref())
        .and_then(LogFormat::parse)
        .unwrap_or_default();
    let log_file = match args.log_file_path() {
        Some(path) => path,
        None => file.log_file.clone(),
    };
    if let Err(e) = init_logging(
        Some(log_level.as_str()),
        log_format,
        log_file.as_deref(),
        use_color,
    ) {
        eprintln!("{} could not start logging: {}", "warning:".yellow(), e);
    }

    let project_root = match project_root(args.project_root.as_deref()) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return EXIT_CONFIG;
        }
    };
    log::debug!("Project root: {}", project_root.display());

    let config = manager_config(&args, &file, &project_root);
    log::debug!("Plugin search paths: {:?}", config.search_paths);

    let coordinator = ShutdownCoordinator::new();
    coordinator.install_signal_handlers();

    let manager = match PluginManager::new(config, coordinator.token()) {
        Ok(manager) => manager,
        Err(e) => {
            log_error_with_context(&e, "Plugin manager set-up");
            return EXIT_CONFIG;
        }
    };

    let outcome = dispatch(&manager, &args.command, &project_root, use_color).await;
    manager.cleanup().await;

    match outcome {
        Ok(_) if coordinator.is_shutdown_requested() => EXIT_INTERRUPTED,
        Ok(code) => code,
        Err(e) if coordinator.is_shutdown_requested() && e.is_interruption() => {
            log::info!("Interrupted: {}", e);
            EXIT_INTERRUPTED
        }
        Err(e) => {
            log_error_with_context(&e, command_context(&args.command));
            1
        }
    }
}

fn project_root(explicit: Option<&Path>) -> std::io::Result<PathBuf> {
    match explicit {
        Some(path) => std::fs::canonicalize(path),
        None => std::env::current_dir(),
    }
}

fn command_context(command: &Command) -> &'static str {
    match command {
        Command::Plugins { .. } => "Plugin inspection",
        Command::Context => "Context detection",
        Command::Run { .. } => "Command execution",
    }
}

async fn dispatch(
    manager: &PluginManager,
    command: &Command,
    project_root: &Path,
    use_color: bool,
) -> PluginResult<i32> {
    match command {
        Command::Plugins {
            action: PluginsAction::List,
        } => {
            let mut plugins = Vec::new();
            for path in manager.discover_plugins_lazy().await {
                let name = manager.plugin_name(&path)?;
                plugins.push((name, path));
            }
            if plugins.is_empty() {
                eprintln!("No plugins discovered.");
            } else {
                display::print_table(&display::plugin_list_table(&plugins), use_color);
            }
            Ok(0)
        }
        Command::Plugins {
            action: PluginsAction::Status,
        } => {
            let report = manager.discover_plugins().await;
            report_advisories(&report.advisories);
            let statuses = manager.plugin_statuses().await;
            if statuses.is_empty() {
                eprintln!("No plugins discovered.");
            } else {
                display::print_table(&display::status_table(&statuses), use_color);
            }
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Command::Plugins {
            action: PluginsAction::Commands,
        } => {
            manager.discover_plugins().await;
            let commands = manager.default_commands().await;
            if commands.is_empty() {
                eprintln!("No plugin commands available.");
            } else {
                display::print_table(&display::commands_table(&commands), use_color);
            }
            Ok(0)
        }
        Command::Context => {
            manager.discover_plugins().await;
            let context = manager.detect_context(project_root).await;
            if context.frameworks.is_empty() {
                eprintln!("No frameworks detected.");
            } else {
                display::print_table(&display::context_table(&context), use_color);
            }
            for line in display::context_values(&context) {
                println!("{}", line);
            }
            if !context.skipped.is_empty() {
                eprintln!(
                    "{} no answer from: {}",
                    "warning:".yellow(),
                    context.skipped.join(", ")
                );
            }
            Ok(0)
        }
        Command::Run { command, args } => {
            let report = manager.load_discovered().await;
            for (name, error) in &report.failures {
                log::debug!("Plugin '{}' unavailable: {}", name, error);
            }
            let output = manager.execute(command, args).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(output.exit_code)
        }
    }
}

fn report_advisories(advisories: &[Advisory]) {
    for advisory in advisories {
        log::info!("{}", advisory);
    }
}

