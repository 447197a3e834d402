use clap::Parser;
use tracing_subscriber::EnvFilter;

use mh_harness::cli::{Cli, Command, ConfigCommand, RunArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to run when no subcommand is given.
        None => run(RunArgs::default(), cli.log_json).await,
        Some(Command::Run(args)) => run(args, cli.log_json).await,
        Some(Command::Config(ConfigCommand::Validate)) => {
            init_tracing("warn", cli.log_json);
            let (config, config_path) = mh_harness::cli::load_config()?;
            if !mh_harness::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            init_tracing("warn", cli.log_json);
            let (config, _config_path) = mh_harness::cli::load_config()?;
            mh_harness::cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!("mcp-harness {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run(args: RunArgs, log_json: bool) -> anyhow::Result<()> {
    init_tracing("info", log_json);
    let (mut config, config_path) = mh_harness::cli::load_config()?;
    args.apply(&mut config);
    tracing::debug!(config_path = %config_path, "configuration loaded");

    let code = mh_harness::cli::run::run(config, args.json).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Initialize stderr-only tracing so stdout carries nothing but results.
///
/// `RUST_LOG` overrides `default_filter`.
fn init_tracing(default_filter: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
