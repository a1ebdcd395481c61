//! CLI display utilities for formatting output
//!
//! Builders return `prettytable` tables so rendering can be checked in tests;
//! `print_table` decides whether terminal styling is applied.

use crate::plugin::api::{CommandTable, LifecycleState, PluginOverview, ProjectContext};
use chrono::{DateTime, Local, Utc};
use prettytable::{format, Cell, Row, Table};
use std::path::PathBuf;

fn table_with_titles(titles: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.set_titles(Row::new(
        titles.iter().map(|t| Cell::new(t).style_spec("bFc")).collect(),
    ));
    table
}

fn state_cell(state: LifecycleState) -> Cell {
    let spec = match state {
        LifecycleState::Started => "Fg",
        LifecycleState::Errored => "Fr",
        LifecycleState::Stopped => "Fy",
        LifecycleState::Registered | LifecycleState::Initialized => "",
    };
    Cell::new(&state.to_string()).style_spec(spec)
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Discovered executables, in search order
pub fn plugin_list_table(plugins: &[(String, PathBuf)]) -> Table {
    let mut table = table_with_titles(&["Plugin", "Path"]);
    for (name, path) in plugins {
        table.add_row(Row::new(vec![
            Cell::new(name).style_spec("Fb"),
            Cell::new(&path.display().to_string()),
        ]));
    }
    table
}

/// Lifecycle state and cache bookkeeping per plugin
pub fn status_table(plugins: &[PluginOverview]) -> Table {
    let mut table = table_with_titles(&[
        "Plugin",
        "Version",
        "State",
        "Failures",
        "Loaded",
        "Last used",
        "Last error",
    ]);
    for plugin in plugins {
        table.add_row(Row::new(vec![
            Cell::new(&plugin.status.name).style_spec("Fb"),
            Cell::new(plugin.version.as_deref().unwrap_or("-")),
            state_cell(plugin.status.state),
            Cell::new(&plugin.status.consecutive_failures.to_string()),
            Cell::new(&timestamp(plugin.loaded_at)),
            Cell::new(&timestamp(plugin.last_used)),
            Cell::new(plugin.status.last_error.as_deref().unwrap_or("")),
        ]));
    }
    table
}

/// Every command and alias with the plugin that owns it
pub fn commands_table(commands: &CommandTable) -> Table {
    let mut table = table_with_titles(&["Command", "Plugin", "Runs", "Description"]);
    for (name, entry) in commands {
        let description = if *name == entry.command {
            entry.description.clone()
        } else {
            format!("alias of '{}'", entry.command)
        };
        table.add_row(Row::new(vec![
            Cell::new(name).style_spec("Fb"),
            Cell::new(&entry.plugin),
            Cell::new(&entry.cmd),
            Cell::new(&description),
        ]));
    }
    table
}

/// Detected frameworks with the winning plugin
pub fn context_table(context: &ProjectContext) -> Table {
    let mut table = table_with_titles(&["Framework", "Plugin", "Confidence"]);
    for (framework, detection) in &context.frameworks {
        table.add_row(Row::new(vec![
            Cell::new(framework).style_spec("Fb"),
            Cell::new(&detection.plugin),
            Cell::new(&format!("{:.2}", detection.confidence)).style_spec("r"),
        ]));
    }
    table
}

/// Extra values contributed by plugins, one `plugin.key = value` per line
pub fn context_values(context: &ProjectContext) -> Vec<String> {
    context
        .extensions
        .iter()
        .flat_map(|(plugin, values)| {
            values
                .iter()
                .map(move |(key, value)| format!("{}.{} = {}", plugin, key, value))
        })
        .collect()
}

/// Print to stdout, styled only when colour is enabled
pub fn print_table(table: &Table, use_color: bool) {
    if use_color {
        table.printstd();
    } else {
        print!("{}", table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::api::{CommandEntry, FrameworkDetection, PluginStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_commands_table_marks_aliases() {
        let mut commands = CommandTable::new();
        let entry = CommandEntry {
            plugin: "node".to_string(),
            command: "test".to_string(),
            cmd: "npm test".to_string(),
            description: "Run the test suite".to_string(),
        };
        commands.insert("t".to_string(), entry.clone());
        commands.insert("test".to_string(), entry);

        let rendered = commands_table(&commands).to_string();
        assert!(rendered.contains("Run the test suite"));
        assert!(rendered.contains("alias of 'test'"));
        assert!(rendered.contains("npm test"));
    }

    #[test]
    fn test_status_table_shows_errors() {
        let overview = PluginOverview {
            status: PluginStatus {
                name: "docker".to_string(),
                state: LifecycleState::Errored,
                last_error: Some("start timed out".to_string()),
                consecutive_failures: 0,
            },
            version: Some("1.2.0".to_string()),
            path: None,
            loaded_at: None,
            last_used: None,
        };

        let rendered = status_table(&[overview]).to_string();
        assert!(rendered.contains("docker"));
        assert!(rendered.contains("errored"));
        assert!(rendered.contains("start timed out"));
    }

    #[test]
    fn test_context_rendering() {
        let mut context = ProjectContext::default();
        context.frameworks.insert(
            "node".to_string(),
            FrameworkDetection {
                plugin: "npm".to_string(),
                confidence: 0.9,
            },
        );
        let mut values = BTreeMap::new();
        values.insert("manager".to_string(), serde_json::json!("pnpm"));
        context.extensions.insert("npm".to_string(), values);

        assert!(context_table(&context).to_string().contains("0.90"));
        assert_eq!(context_values(&context), vec!["npm.manager = \"pnpm\""]);
    }
}
