pub mod config;
pub mod run;

use clap::{Args, Parser, Subcommand};

use mh_domain::config::Config;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MH_CONFIG";

/// Drive a stdio MCP server through a scripted session.
#[derive(Debug, Parser)]
#[command(name = "mcp-harness", version, about)]
pub struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch the peer and run the session (default when no subcommand is given).
    Run(RunArgs),
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Per-response read timeout in milliseconds (overrides `peer.read_timeout_ms`).
    #[arg(long, conflicts_with = "no_timeout")]
    pub timeout_ms: Option<u64>,

    /// Wait indefinitely for each response.
    #[arg(long)]
    pub no_timeout: bool,

    /// Print the session report as JSON instead of text.
    #[arg(long)]
    pub json: bool,

    /// Peer command line, replacing `peer.command` and `peer.args`.
    #[arg(last = true, value_name = "PEER")]
    pub peer: Vec<String>,
}

impl RunArgs {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some((command, args)) = self.peer.split_first() {
            config.peer.command = command.clone();
            config.peer.args = args.to_vec();
            // The configured artifact belongs to the configured command.
            config.peer.artifact = None;
        }
        if let Some(ms) = self.timeout_ms {
            config.peer.read_timeout_ms = ms;
        }
        if self.no_timeout {
            config.peer.read_timeout_ms = 0;
        }
    }
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `MH_CONFIG` (or
/// `harness.toml` by default). Returns the parsed [`Config`] and the
/// path that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "harness.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

/// Parse the config at `config_path`; a missing file yields defaults.
pub fn load_config_from(config_path: &str) -> anyhow::Result<Config> {
    if !std::path::Path::new(config_path).exists() {
        tracing::debug!(config_path, "config file not found, using defaults");
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["mcp-harness"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.log_json);
    }

    #[test]
    fn run_with_peer_override() {
        let cli = Cli::try_parse_from([
            "mcp-harness",
            "run",
            "--timeout-ms",
            "1500",
            "--",
            "java",
            "-jar",
            "server.jar",
        ])
        .unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.timeout_ms, Some(1500));
        assert_eq!(args.peer, vec!["java", "-jar", "server.jar"]);

        let mut config = Config::default();
        config.peer.artifact = Some("old.jar".into());
        args.apply(&mut config);
        assert_eq!(config.peer.command, "java");
        assert_eq!(config.peer.args, vec!["-jar", "server.jar"]);
        assert_eq!(config.peer.read_timeout_ms, 1500);
        assert!(config.peer.artifact.is_none());
    }

    #[test]
    fn no_timeout_disables_reads_bound() {
        let cli = Cli::try_parse_from(["mcp-harness", "run", "--no-timeout"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.peer.read_timeout(), None);
    }

    #[test]
    fn timeout_flags_conflict() {
        let err = Cli::try_parse_from(["mcp-harness", "run", "--no-timeout", "--timeout-ms", "5"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn config_subcommands_parse() {
        let cli = Cli::try_parse_from(["mcp-harness", "--log-json", "config", "validate"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Validate))
        ));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert!(config.peer.command.is_empty());
    }

    #[test]
    fn config_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[peer]
command = "java"
args = ["-jar", "target/mysql-mcp-server-1.0.0.jar"]

[[session.calls]]
name = "list_tables"
"#
        )
        .unwrap();
        let config = load_config_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.peer.command, "java");
        assert_eq!(config.session.calls[0].name, "list_tables");
    }

    #[test]
    fn invalid_config_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[peer\ncommand = ").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().starts_with(&format!("parsing {path}")));
    }
}
