//! Session pipeline: the ordered list of exchanges a harness run performs.
//!
//! A [`Plan`] is a list of [`Step`]s. Each step names its method and params
//! and an action saying what to do with the result. Running a plan assigns
//! ids sequentially, records every outcome, and stops on the first
//! transport error. Peer-reported errors are recorded and the plan goes on.
//!
//! [`run_supervised`] wraps a plan in the peer's lifecycle: start, run
//! (raced against an interrupt), and always shut down.

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use mh_domain::config::{PeerConfig, SessionConfig};

use crate::process::{PeerProcess, Teardown};
use crate::protocol::{
    self, InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, McpToolDef,
    Response, ToolCallParams, ToolCallResult, ToolsListResult,
};
use crate::transport::{RpcChannel, RpcError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a step does with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// `initialize`: log server info and negotiated version.
    Handshake,
    /// `notifications/initialized`: sent as a notification, nothing read.
    Initialized,
    /// `tools/list`: decode and record tool descriptors.
    ListTools,
    /// `tools/call`: decode content for logging.
    CallTool,
    /// `ping`: liveness.
    Ping,
    /// Anything else: result kept as-is.
    Raw,
}

/// One exchange (or notification) in a plan.
#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub method: String,
    pub params: Option<Value>,
    pub action: StepAction,
}

impl Step {
    pub fn handshake(session: &SessionConfig) -> Self {
        let params = serde_json::to_value(protocol::initialize_params(session)).ok();
        Self {
            label: "initialize".into(),
            method: "initialize".into(),
            params,
            action: StepAction::Handshake,
        }
    }

    pub fn initialized() -> Self {
        Self {
            label: "initialized".into(),
            method: "notifications/initialized".into(),
            params: None,
            action: StepAction::Initialized,
        }
    }

    pub fn list_tools() -> Self {
        Self {
            label: "tools/list".into(),
            method: "tools/list".into(),
            params: None,
            action: StepAction::ListTools,
        }
    }

    pub fn call_tool(name: impl Into<String>, arguments: Value, label: Option<String>) -> Self {
        let name = name.into();
        let params = ToolCallParams {
            name: name.clone(),
            arguments,
        };
        Self {
            label: label.unwrap_or_else(|| format!("tools/call {name}")),
            method: "tools/call".into(),
            params: serde_json::to_value(params).ok(),
            action: StepAction::CallTool,
        }
    }

    pub fn ping() -> Self {
        Self {
            label: "ping".into(),
            method: "ping".into(),
            params: None,
            action: StepAction::Ping,
        }
    }

    pub fn raw(label: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            label: label.into(),
            method: method.into(),
            params,
            action: StepAction::Raw,
        }
    }

    fn is_notification(&self) -> bool {
        self.action == StepAction::Initialized
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Result { result: Value },
    PeerError { error: JsonRpcError },
    Notified,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub label: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Everything a completed plan produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub steps: Vec<StepReport>,
    /// Tools from the last successful `tools/list`.
    pub tools: Vec<McpToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<InitializeResult>,
}

impl SessionReport {
    /// Number of steps the peer answered with an error.
    pub fn peer_errors(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::PeerError { .. }))
            .count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An ordered list of steps.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// The standard session: handshake, optional `initialized`
    /// notification, discovery, each configured tool call, ping.
    pub fn from_config(session: &SessionConfig) -> Self {
        let mut steps = vec![Step::handshake(session)];
        if session.send_initialized {
            steps.push(Step::initialized());
        }
        steps.push(Step::list_tools());
        for call in &session.calls {
            steps.push(Step::call_tool(
                call.name.clone(),
                call.arguments.clone(),
                call.label.clone(),
            ));
        }
        steps.push(Step::ping());
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step over `channel`. Ids start at 1 and skip notifications.
    pub async fn run<R, W>(&self, channel: &mut RpcChannel<R, W>) -> Result<SessionReport, RpcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut report = SessionReport::default();
        let mut next_id = 1u64;

        for step in &self.steps {
            if step.is_notification() {
                let mut notification = JsonRpcNotification::new(step.method.clone());
                notification.params = step.params.clone();
                channel.notify(&notification).await?;
                report.steps.push(StepReport {
                    label: step.label.clone(),
                    method: step.method.clone(),
                    id: None,
                    outcome: StepOutcome::Notified,
                });
                continue;
            }

            let id = next_id;
            next_id += 1;

            tracing::info!(id, step = %step.label, method = %step.method, "running step");
            let request = JsonRpcRequest::new(id, step.method.clone(), step.params.clone());
            let response = channel.exchange(&request).await?;

            let outcome = match response {
                Response::Success { result, .. } => {
                    observe(step, &result, &mut report);
                    StepOutcome::Result { result }
                }
                Response::Failure { error, .. } => {
                    tracing::warn!(
                        id,
                        step = %step.label,
                        code = error.code,
                        message = %error.message,
                        "peer returned an error"
                    );
                    StepOutcome::PeerError { error }
                }
            };

            report.steps.push(StepReport {
                label: step.label.clone(),
                method: step.method.clone(),
                id: Some(id),
                outcome,
            });
        }

        Ok(report)
    }
}

/// Apply a step's action to a successful result.
fn observe(step: &Step, result: &Value, report: &mut SessionReport) {
    match step.action {
        StepAction::Handshake => {
            match serde_json::from_value::<InitializeResult>(result.clone()) {
                Ok(init) => {
                    let server = init.server_info.as_ref();
                    tracing::info!(
                        server = server.map(|s| s.name.as_str()).unwrap_or("unknown"),
                        version = server.map(|s| s.version.as_str()).unwrap_or("unknown"),
                        protocol_version = init.protocol_version.as_deref().unwrap_or("unspecified"),
                        "handshake complete"
                    );
                    report.server = Some(init);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse initialize result");
                }
            }
        }
        StepAction::ListTools => match serde_json::from_value::<ToolsListResult>(result.clone()) {
            Ok(list) => {
                tracing::info!(tool_count = list.tools.len(), "tools discovered");
                for tool in &list.tools {
                    tracing::info!(tool = %tool.name, description = %tool.description, "tool");
                }
                report.tools = list.tools;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse tools/list result");
            }
        },
        StepAction::CallTool => match serde_json::from_value::<ToolCallResult>(result.clone()) {
            Ok(call) if call.is_error => {
                tracing::warn!(step = %step.label, "tool reported an error");
            }
            Ok(call) => {
                tracing::info!(step = %step.label, items = call.content.len(), "tool call succeeded");
            }
            Err(e) => {
                tracing::debug!(step = %step.label, error = %e, "tool result is not MCP content");
            }
        },
        StepAction::Ping => tracing::info!("peer is alive"),
        StepAction::Initialized | StepAction::Raw => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervised run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a supervised session did not complete.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("session interrupted")]
    Interrupted,
}

/// Result of [`run_supervised`]. `teardown` is `None` only when the peer
/// never started.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Result<SessionReport, SessionError>,
    pub teardown: Option<Teardown>,
}

/// Start the peer, run `plan`, and shut the peer down on every path.
///
/// If `interrupt` completes first the in-flight exchange is abandoned and
/// the result is [`SessionError::Interrupted`].
pub async fn run_supervised<F>(peer_config: &PeerConfig, plan: &Plan, interrupt: F) -> SessionOutcome
where
    F: Future<Output = ()>,
{
    let mut peer = match PeerProcess::start(peer_config) {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!(error = %e, "failed to start peer");
            return SessionOutcome {
                result: Err(e.into()),
                teardown: None,
            };
        }
    };

    let pid = peer.pid();
    let result = tokio::select! {
        result = drive(&mut peer, plan) => result.map_err(SessionError::from),
        () = interrupt => {
            tracing::warn!(pid = ?pid, "interrupted, tearing down peer");
            Err(SessionError::Interrupted)
        }
    };

    if let Err(SessionError::Rpc(e)) = &result {
        tracing::error!(
            pid = ?pid,
            method = e.method().unwrap_or("-"),
            error = %e,
            "session failed"
        );
    }

    let teardown = peer.shutdown().await;
    SessionOutcome {
        result,
        teardown: Some(teardown),
    }
}

async fn drive(peer: &mut PeerProcess, plan: &Plan) -> Result<SessionReport, RpcError> {
    let channel = peer.channel("initialize")?;
    plan.run(channel).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{duplex_channel, PeerEnd};
    use mh_domain::config::ToolCallConfig;

    fn session_with_calls() -> SessionConfig {
        SessionConfig {
            client_name: "test-client".into(),
            client_version: "1.0.0".into(),
            calls: vec![
                ToolCallConfig {
                    name: "list_tables".into(),
                    arguments: json!({}),
                    label: None,
                },
                ToolCallConfig {
                    name: "execute_query".into(),
                    arguments: json!({ "sql": "SELECT 1 as test_value, 'Hello MCP' as message" }),
                    label: Some("query".into()),
                },
            ],
            ..SessionConfig::default()
        }
    }

    /// A scripted MCP peer: answers by method, records every line it reads.
    async fn mcp_peer(mut peer: PeerEnd) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Some(msg) = peer.next_request_opt().await {
            seen.push(msg.clone());
            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let body = match msg["method"].as_str().unwrap() {
                "initialize" => json!({ "result": {
                    "protocolVersion": "2024-11-05",
                    "serverInfo": { "name": "scripted", "version": "0.0.1" },
                    "capabilities": { "tools": {} }
                }}),
                "tools/list" => json!({ "result": { "tools": [
                    { "name": "list_tables", "description": "List all tables" },
                    { "name": "execute_query", "description": "Execute a SQL query" }
                ]}}),
                "tools/call" if msg["params"]["name"] == "list_tables" => json!({ "result": {
                    "content": [{ "type": "text", "text": "users\norders" }]
                }}),
                "tools/call" => json!({ "error": {
                    "code": -32603, "message": "Error executing tool: no database"
                }}),
                "ping" => json!({ "result": { "status": "ok" } }),
                _ => json!({ "error": { "code": -32601, "message": "Method not found" } }),
            };
            let mut resp = body.as_object().unwrap().clone();
            resp.insert("jsonrpc".into(), json!("2.0"));
            resp.insert("id".into(), id);
            peer.send_line(&Value::Object(resp).to_string()).await;
        }
        seen
    }

    #[test]
    fn standard_plan_order() {
        let plan = Plan::from_config(&session_with_calls());
        let methods: Vec<_> = plan.steps().iter().map(|s| s.method.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "initialize",
                "notifications/initialized",
                "tools/list",
                "tools/call",
                "tools/call",
                "ping"
            ]
        );
        assert_eq!(plan.steps()[3].label, "tools/call list_tables");
        assert_eq!(plan.steps()[4].label, "query");
    }

    #[test]
    fn initialized_notification_can_be_disabled() {
        let session = SessionConfig {
            send_initialized: false,
            ..SessionConfig::default()
        };
        let plan = Plan::from_config(&session);
        assert!(plan
            .steps()
            .iter()
            .all(|s| s.action != StepAction::Initialized));
    }

    #[test]
    fn call_tool_params_shape() {
        let step = Step::call_tool("execute_query", json!({ "sql": "SELECT 1" }), None);
        assert_eq!(
            step.params.unwrap(),
            json!({ "name": "execute_query", "arguments": { "sql": "SELECT 1" } })
        );
    }

    #[tokio::test]
    async fn standard_plan_against_scripted_peer() {
        let (mut channel, peer) = duplex_channel(None);
        let peer_task = tokio::spawn(mcp_peer(peer));

        let plan = Plan::from_config(&session_with_calls());
        let report = plan.run(&mut channel).await.unwrap();
        channel.close().await.unwrap();
        let seen = peer_task.await.unwrap();

        // Ids are 1..=5 and the notification has none.
        let ids: Vec<_> = report.steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![Some(1), None, Some(2), Some(3), Some(4), Some(5)]);
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0]["params"]["clientInfo"]["name"], "test-client");
        assert!(seen[1].get("id").is_none());
        assert_eq!(seen[4]["id"], 4);
        assert_eq!(seen[4]["params"]["name"], "execute_query");

        assert_eq!(report.server.as_ref().unwrap().server_info.as_ref().unwrap().name, "scripted");
        let names: Vec<_> = report.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["list_tables", "execute_query"]);
        assert!(report.tools.iter().all(|t| !t.description.is_empty()));

        // The failed query did not stop the session.
        assert_eq!(report.peer_errors(), 1);
        assert!(matches!(
            &report.steps[4].outcome,
            StepOutcome::PeerError { error } if error.code == -32603
        ));
        assert_eq!(
            report.steps[5].outcome,
            StepOutcome::Result {
                result: json!({ "status": "ok" })
            }
        );
    }

    #[tokio::test]
    async fn transport_error_stops_the_plan() {
        let (mut channel, mut peer) = duplex_channel(None);
        tokio::spawn(async move {
            let req = peer.next_request().await;
            peer.send_line(&json!({ "jsonrpc": "2.0", "id": req["id"], "result": {} }).to_string())
                .await;
            // Read tools/list, then go away.
            peer.next_request().await;
        });

        let plan = Plan::new(vec![
            Step::raw("first", "initialize", None),
            Step::list_tools(),
            Step::ping(),
        ]);
        let err = plan.run(&mut channel).await.unwrap_err();
        assert!(
            matches!(&err, RpcError::PeerClosed { method } if method == "tools/list"),
            "{err:?}"
        );
    }

    #[test]
    fn report_serializes_outcome_tag() {
        let report = StepReport {
            label: "ping".into(),
            method: "ping".into(),
            id: Some(5),
            outcome: StepOutcome::Result {
                result: json!({ "status": "ok" }),
            },
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "label": "ping",
                "method": "ping",
                "id": 5,
                "outcome": "result",
                "result": { "status": "ok" }
            })
        );
    }
}
