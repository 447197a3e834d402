//! Request dispatch for the reference peer.

use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// What the serving loop should do with one input line.
#[derive(Debug, PartialEq)]
pub enum Reply {
    /// Write this response line.
    Send(Value),
    /// Notification, or a stalled method: write nothing.
    Silent,
    /// Exit without answering.
    Crash,
}

#[derive(Debug, Default, Clone)]
pub struct Behavior {
    /// Render response ids as JSON floats (`1.0`).
    pub float_ids: bool,
    /// Exit as soon as a request for this method arrives.
    pub crash_on: Option<String>,
    /// Never answer requests for this method.
    pub stall_on: Option<String>,
}

impl Behavior {
    pub fn handle(&self, line: &str) -> Reply {
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                return Reply::Send(self.error(&json!(0), PARSE_ERROR, format!("Parse error: {e}")));
            }
        };

        let method = request["method"].as_str().unwrap_or_default();
        let Some(id) = request.get("id").cloned() else {
            tracing::debug!(method, "notification");
            return Reply::Silent;
        };

        if self.crash_on.as_deref() == Some(method) {
            tracing::warn!(method, "crashing as instructed");
            return Reply::Crash;
        }
        if self.stall_on.as_deref() == Some(method) {
            tracing::warn!(method, "stalling as instructed");
            return Reply::Silent;
        }

        tracing::debug!(method, %id, "request");
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        Reply::Send(match method {
            "initialize" => self.result(&id, initialize_result()),
            "tools/list" => self.result(&id, json!({ "tools": tool_defs() })),
            "tools/call" => match call_tool(&params) {
                Ok(result) => self.result(&id, result),
                Err((code, message)) => self.error(&id, code, message),
            },
            "ping" => self.result(&id, json!({ "status": "ok" })),
            other => self.error(&id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        })
    }

    fn result(&self, id: &Value, result: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": self.render_id(id), "result": result })
    }

    fn error(&self, id: &Value, code: i64, message: String) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.render_id(id),
            "error": { "code": code, "message": message }
        })
    }

    fn render_id(&self, id: &Value) -> Value {
        match id.as_u64() {
            Some(n) if self.float_ids => json!(n as f64),
            _ => id.clone(),
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": { "name": "mh-reference-peer", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": {} }
    })
}

fn tool_defs() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the arguments as text",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "execute_query",
            "description": "Execute a SQL query",
            "inputSchema": {
                "type": "object",
                "properties": { "sql": { "type": "string" } },
                "required": ["sql"]
            }
        }
    ])
}

fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params["name"].as_str().unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    match name {
        "echo" => Ok(json!({
            "content": [{ "type": "text", "text": arguments.to_string() }]
        })),
        "execute_query" => Err((
            INTERNAL_ERROR,
            "Error executing tool: no database attached".into(),
        )),
        other => Err((INVALID_PARAMS, format!("Unknown tool: {other}"))),
    }
}
