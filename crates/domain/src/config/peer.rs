use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer process
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How to launch the peer and how long to wait on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Executable to spawn (e.g. `"java"`).
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// File that must exist before the peer is launched (e.g. the server
    /// jar). Checked up front so a missing build is reported clearly
    /// instead of as an obscure child-process failure.
    #[serde(default)]
    pub artifact: Option<PathBuf>,

    /// Working directory for the peer. Inherits the harness's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Variables always set on the peer's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Variables set on the peer's environment only when the harness's
    /// own environment does not already define them.
    #[serde(default)]
    pub env_defaults: HashMap<String, String>,

    /// Read timeout per response line in milliseconds. `0` waits forever.
    #[serde(default = "d_30000")]
    pub read_timeout_ms: u64,

    /// How long to wait for the peer to exit after stdin is closed and
    /// termination is requested, before it is killed.
    #[serde(default = "d_5000")]
    pub shutdown_grace_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            artifact: None,
            working_dir: None,
            env: HashMap::new(),
            env_defaults: HashMap::new(),
            read_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl PeerConfig {
    /// Per-line read timeout, or `None` when reads may block indefinitely.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The command line as a single display string, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Environment to apply on top of the inherited one, resolved against
    /// the current process environment.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        self.resolved_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`resolved_env`](Self::resolved_env) but with an explicit
    /// lookup for the harness-side environment.
    ///
    /// A default is applied only when `lookup` has no value for the key;
    /// entries in `env` always win.
    pub fn resolved_env_with<F>(&self, lookup: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = BTreeMap::new();
        for (key, default) in &self.env_defaults {
            let value = lookup(key).unwrap_or_else(|| default.clone());
            resolved.insert(key.clone(), value);
        }
        for (key, value) in &self.env {
            resolved.insert(key.clone(), value.clone());
        }
        resolved
    }
}

fn d_30000() -> u64 {
    30_000
}

fn d_5000() -> u64 {
    5_000
}
