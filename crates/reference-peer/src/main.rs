//! Reference stdio MCP peer for exercising the harness.
//!
//! Reads one JSON-RPC request per line on stdin and answers on stdout:
//!
//! - `initialize`:  protocol version, server info, tools capability
//! - `tools/list`:  `echo` and `execute_query`
//! - `tools/call`:  `echo` returns its arguments; `execute_query` fails
//! - `ping`:        `{"status":"ok"}`
//!
//! Logs go to stderr. Exits on stdin EOF.
//!
//! Usage:
//!   mh-reference-peer [--float-ids] [--crash-on METHOD] [--stall-on METHOD]

mod handler;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use handler::{Behavior, Reply};

/// Exit status used when `--crash-on` fires.
const CRASH_EXIT_CODE: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "mh-reference-peer", version, about)]
struct Args {
    /// Write response ids as floats (`1.0`).
    #[arg(long)]
    float_ids: bool,

    /// Exit without answering when this method is requested.
    #[arg(long, value_name = "METHOD")]
    crash_on: Option<String>,

    /// Never answer requests for this method.
    #[arg(long, value_name = "METHOD")]
    stall_on: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let behavior = Behavior {
        float_ids: args.float_ids,
        crash_on: args.crash_on,
        stall_on: args.stall_on,
    };

    tracing::info!(?behavior, "reference peer ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match behavior.handle(line) {
            Reply::Send(response) => {
                let mut out = response.to_string();
                out.push('\n');
                stdout.write_all(out.as_bytes()).await?;
                stdout.flush().await?;
            }
            Reply::Silent => {}
            Reply::Crash => std::process::exit(CRASH_EXIT_CODE),
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}
