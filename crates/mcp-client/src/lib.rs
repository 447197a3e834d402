//! `mh-mcp-client`: a half-duplex MCP client for driving a stdio peer.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types, with responses decoded into a
//!   `Success | Failure` sum type.
//! - [`RpcChannel`], which writes one request line and reads one response
//!   line per exchange over any async reader/writer pair.
//! - [`PeerProcess`], which spawns the peer, owns its pipes and guarantees
//!   teardown (close stdin, terminate, kill).
//! - [`Plan`] and [`run_supervised`] for running an ordered list of steps
//!   inside the peer's lifecycle.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mh_mcp_client::{run_supervised, Plan};
//!
//! let config: mh_domain::config::Config = /* from TOML */;
//! let plan = Plan::from_config(&config.session);
//! let outcome = run_supervised(&config.peer, &plan, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await;
//!
//! for tool in &outcome.result?.tools {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//! ```

pub mod process;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience.
pub use mh_domain::config::{Config, PeerConfig, SessionConfig, ToolCallConfig};
pub use process::{PeerProcess, Teardown, Termination};
pub use protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, McpToolDef, Response};
pub use session::{
    run_supervised, Plan, SessionError, SessionOutcome, SessionReport, Step, StepAction,
    StepOutcome, StepReport,
};
pub use transport::{RpcChannel, RpcError};
