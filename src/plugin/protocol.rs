//! Plugin process protocol
//!
//! Newline-delimited JSON exchanged over a plugin's stdin and stdout. Each
//! request carries a numeric id that the matching response echoes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_HANDSHAKE: &str = "handshake";
pub const METHOD_METADATA: &str = "metadata";
pub const METHOD_COMMANDS: &str = "commands";
pub const METHOD_CONFIGURE: &str = "configure";
pub const METHOD_INIT: &str = "init";
pub const METHOD_START: &str = "start";
pub const METHOD_STOP: &str = "stop";
pub const METHOD_HEALTH: &str = "health";
pub const METHOD_EXECUTE: &str = "execute";
pub const METHOD_DETECT_CONTEXT: &str = "detect_context";

pub const CAPABILITY_COMMANDS: &str = "commands";
pub const CAPABILITY_CONTEXT: &str = "context";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
}

impl Response {
    /// The result, or the plugin-reported error message
    pub fn into_result(self) -> Result<Value, String> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.message),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Reply to the `handshake` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResult {
    /// Absent for first-generation plugins
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HandshakeResult {
    pub fn generation(&self) -> u32 {
        self.protocol_version.unwrap_or(1)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
