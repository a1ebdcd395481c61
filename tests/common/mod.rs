//! Shell-script plugins for integration tests
//!
//! Each script answers the line protocol with canned replies and appends
//! `<name> <method>` to a shared log so tests can check call order.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ScriptPlugin {
    pub name: String,
    pub version: String,
    pub protocol: Option<u32>,
    pub dependencies: Vec<(String, String)>,
    pub commands: Vec<(String, Vec<String>)>,
    pub context: Option<(String, f64)>,
    pub fail_on: Option<String>,
    pub handshake_delay_secs: Option<u32>,
}

impl ScriptPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            protocol: Some(2),
            dependencies: Vec::new(),
            commands: Vec::new(),
            context: None,
            fail_on: None,
            handshake_delay_secs: None,
        }
    }

    /// First-generation plugin: no protocol version, no metadata request
    pub fn legacy(name: &str) -> Self {
        Self {
            protocol: None,
            ..Self::new(name)
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn protocol(mut self, protocol: u32) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn requires(mut self, name: &str, constraint: &str) -> Self {
        self.dependencies.push((name.to_string(), constraint.to_string()));
        self
    }

    pub fn command(mut self, name: &str, aliases: &[&str]) -> Self {
        self.commands.push((
            name.to_string(),
            aliases.iter().map(|a| a.to_string()).collect(),
        ));
        self
    }

    pub fn context(mut self, framework: &str, confidence: f64) -> Self {
        self.context = Some((framework.to_string(), confidence));
        self
    }

    pub fn failing(mut self, method: &str) -> Self {
        self.fail_on = Some(method.to_string());
        self
    }

    pub fn slow_handshake(mut self, secs: u32) -> Self {
        self.handshake_delay_secs = Some(secs);
        self
    }

    fn capabilities(&self) -> String {
        let mut capabilities = Vec::new();
        if !self.commands.is_empty() {
            capabilities.push("\"commands\"");
        }
        if self.context.is_some() {
            capabilities.push("\"context\"");
        }
        capabilities.join(",")
    }

    fn handshake_reply(&self) -> String {
        let version = match self.protocol {
            Some(protocol) => format!("\"protocol_version\":{},", protocol),
            None => String::new(),
        };
        format!(
            "{{{}\"name\":\"{}\",\"version\":\"{}\",\"capabilities\":[{}]}}",
            version,
            self.name,
            self.version,
            self.capabilities()
        )
    }

    fn metadata_reply(&self) -> String {
        let dependencies: Vec<String> = self
            .dependencies
            .iter()
            .map(|(name, constraint)| {
                format!("{{\"name\":\"{}\",\"version\":\"{}\"}}", name, constraint)
            })
            .collect();
        format!(
            "{{\"name\":\"{}\",\"version\":\"{}\",\"description\":\"{} plugin\",\"dependencies\":[{}]}}",
            self.name,
            self.version,
            self.name,
            dependencies.join(",")
        )
    }

    fn commands_reply(&self) -> String {
        let commands: Vec<String> = self
            .commands
            .iter()
            .map(|(name, aliases)| {
                let aliases: Vec<String> = aliases.iter().map(|a| format!("\"{}\"", a)).collect();
                format!(
                    "{{\"name\":\"{}\",\"cmd\":\"{} {}\",\"description\":\"Run {}\",\"aliases\":[{}]}}",
                    name,
                    self.name,
                    name,
                    name,
                    aliases.join(",")
                )
            })
            .collect();
        format!("[{}]", commands.join(","))
    }

    fn context_reply(&self) -> String {
        match &self.context {
            Some((framework, confidence)) => format!(
                "{{\"framework\":\"{}\",\"confidence\":{},\"values\":{{\"detected_by\":\"{}\"}}}}",
                framework, confidence, self.name
            ),
            None => "{}".to_string(),
        }
    }

    /// Shell source for this plugin
    pub fn script(&self, log: &Path) -> String {
        let delay = self
            .handshake_delay_secs
            .map(|secs| format!("sleep {}; ", secs))
            .unwrap_or_default();
        let fail_on = self.fail_on.as_deref().unwrap_or("");

        format!(
            r#"#!/bin/sh
LOG='{log}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{{"id":\([0-9]*\).*/\1/p')
  method=$(printf '%s' "$line" | sed -n 's/^{{"id":[0-9]*,"method":"\([a-z_]*\)".*/\1/p')
  printf '%s %s\n' '{name}' "$method" >> "$LOG"
  if [ "$method" = '{fail_on}' ]; then
    printf '{{"id":%s,"error":{{"message":"%s refused"}}}}\n' "$id" "$method"
    continue
  fi
  case "$method" in
    handshake) {delay}result='{handshake}' ;;
    metadata) result='{metadata}' ;;
    commands) result='{commands}' ;;
    detect_context) result='{context}' ;;
    configure|init) printf '%s %s\n' '{name}' "$line" >> "$LOG"; result='null' ;;
    execute)
      command=$(printf '%s' "$line" | sed -n 's/.*"command":"\([^"]*\)".*/\1/p')
      code=0
      if [ "$command" = 'fail' ]; then code=3; fi
      result="{{\"exit_code\":$code,\"stdout\":\"{name} ran $command\",\"stderr\":\"\"}}" ;;
    *) result='null' ;;
  esac
  printf '{{"id":%s,"result":%s}}\n' "$id" "$result"
done
"#,
            log = log.display(),
            name = self.name,
            fail_on = fail_on,
            delay = delay,
            handshake = self.handshake_reply(),
            metadata = self.metadata_reply(),
            commands = self.commands_reply(),
            context = self.context_reply(),
        )
    }

    /// Write the plugin into `dir` as an executable following the naming convention
    pub fn install(&self, dir: &Path, log: &Path) -> PathBuf {
        let path = dir.join(format!("devctx-plugin-{}", self.name));
        std::fs::write(&path, self.script(log)).unwrap();
        make_executable(&path);
        path
    }
}

pub fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Lines of the shared call log
pub fn read_log(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Index of the first line equal to `entry`
pub fn position(lines: &[String], entry: &str) -> Option<usize> {
    lines.iter().position(|l| l == entry)
}
