use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the harness sends during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Protocol version offered in `initialize`.
    #[serde(default = "d_protocol_version")]
    pub protocol_version: String,
    /// `clientInfo.name` sent in `initialize`.
    #[serde(default = "d_client_name")]
    pub client_name: String,
    /// `clientInfo.version` sent in `initialize`.
    #[serde(default = "d_client_version")]
    pub client_version: String,
    /// `capabilities` object sent in `initialize`.
    #[serde(default = "d_empty_object")]
    pub capabilities: Value,
    /// Send `notifications/initialized` after a successful handshake.
    #[serde(default = "d_true")]
    pub send_initialized: bool,
    /// Tool invocations, run in order after discovery.
    #[serde(default)]
    pub calls: Vec<ToolCallConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: d_protocol_version(),
            client_name: d_client_name(),
            client_version: d_client_version(),
            capabilities: d_empty_object(),
            send_initialized: true,
            calls: Vec::new(),
        }
    }
}

/// A single `tools/call` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallConfig {
    /// Tool name as advertised by `tools/list`.
    pub name: String,
    /// Arguments object passed verbatim.
    #[serde(default = "d_empty_object")]
    pub arguments: Value,
    /// Optional label for logs and output (defaults to the tool name).
    #[serde(default)]
    pub label: Option<String>,
}

fn d_protocol_version() -> String {
    "2024-11-05".into()
}
fn d_client_name() -> String {
    "mcp-harness".into()
}
fn d_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn d_empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
fn d_true() -> bool {
    true
}
