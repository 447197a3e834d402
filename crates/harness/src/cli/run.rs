//! `mcp-harness run`: launch the peer, drive the session, tear it down.
//!
//! Results go to stdout (text or JSON); logs go to stderr. The process
//! exit code says how the session ended.

use std::io::Write;

use serde_json::json;

use mh_domain::config::Config;
use mh_mcp_client::{
    run_supervised, Plan, RpcError, SessionError, SessionOutcome, SessionReport, StepOutcome,
    Teardown, Termination,
};

/// Every step ran. Peer-reported errors still count as completed.
pub const EXIT_COMPLETED: i32 = 0;
/// Transport failure or invalid configuration.
pub const EXIT_FAILED: i32 = 1;
/// The peer could not be started (artifact missing or spawn failed).
pub const EXIT_LAUNCH: i32 = 2;
/// Interrupted by SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Run the configured session and print its report. Returns the exit code.
pub async fn run(config: Config, json_output: bool) -> anyhow::Result<i32> {
    config.ensure_valid()?;

    let plan = Plan::from_config(&config.session);
    tracing::info!(
        command = %config.peer.command_line(),
        steps = plan.steps().len(),
        "starting session"
    );

    let outcome = run_supervised(&config.peer, &plan, shutdown_signal()).await;

    if let Err(SessionError::Rpc(RpcError::ArtifactMissing { path })) = &outcome.result {
        eprintln!(
            "hint: build the peer first so that {} exists, or fix `peer.artifact`",
            path.display()
        );
    }

    let mut stdout = std::io::stdout().lock();
    if json_output {
        render_json(&outcome, &mut stdout)?;
    } else {
        render_text(&outcome, &mut stdout)?;
    }
    stdout.flush()?;

    Ok(exit_code(&outcome))
}

/// Map how the session ended to a process exit code.
pub fn exit_code(outcome: &SessionOutcome) -> i32 {
    match &outcome.result {
        Ok(_) => EXIT_COMPLETED,
        Err(SessionError::Interrupted) => EXIT_INTERRUPTED,
        Err(SessionError::Rpc(e)) if e.is_launch_failure() => EXIT_LAUNCH,
        Err(SessionError::Rpc(_)) => EXIT_FAILED,
    }
}

/// Human-readable report.
pub fn render_text(outcome: &SessionOutcome, out: &mut impl Write) -> std::io::Result<()> {
    match &outcome.result {
        Ok(report) => write_report(report, out)?,
        Err(e) => writeln!(out, "session failed: {e}")?,
    }
    if let Some(teardown) = &outcome.teardown {
        writeln!(out, "peer: {}", describe_teardown(teardown))?;
    }
    Ok(())
}

fn write_report(report: &SessionReport, out: &mut impl Write) -> std::io::Result<()> {
    if let Some(info) = report.server.as_ref().and_then(|s| s.server_info.as_ref()) {
        writeln!(out, "server: {} {}", info.name, info.version)?;
    }
    if !report.tools.is_empty() {
        writeln!(out, "tools:")?;
        for tool in &report.tools {
            writeln!(out, "  - {}: {}", tool.name, tool.description)?;
        }
    }

    for step in &report.steps {
        let id = step
            .id
            .map(|id| format!("#{id}"))
            .unwrap_or_else(|| "--".into());
        match &step.outcome {
            StepOutcome::Result { result } => {
                writeln!(out, "[{id}] {} ok", step.label)?;
                writeln!(out, "    {result}")?;
            }
            StepOutcome::PeerError { error } => {
                writeln!(out, "[{id}] {} error {}: {}", step.label, error.code, error.message)?;
            }
            StepOutcome::Notified => writeln!(out, "[{id}] {} sent", step.label)?,
        }
    }

    writeln!(
        out,
        "completed {} step(s), {} peer error(s)",
        report.steps.len(),
        report.peer_errors()
    )
}

fn describe_teardown(teardown: &Teardown) -> String {
    let how = match teardown.termination {
        Termination::AlreadyExited => "already exited",
        Termination::Graceful => "exited",
        Termination::Killed => "killed",
        Termination::Unknown => "status unknown",
    };
    match teardown.status {
        Some(status) => format!("{how} ({status})"),
        None => how.to_string(),
    }
}

/// Machine-readable report, one JSON document.
pub fn render_json(outcome: &SessionOutcome, out: &mut impl Write) -> anyhow::Result<()> {
    let (status, report, error) = match &outcome.result {
        Ok(report) => ("completed", Some(report), None),
        Err(e @ SessionError::Interrupted) => ("interrupted", None, Some(e.to_string())),
        Err(e) => ("failed", None, Some(e.to_string())),
    };

    let teardown = outcome.teardown.as_ref().map(|t| {
        json!({
            "termination": t.termination,
            "exit_code": t.exit_code(),
        })
    });

    let doc = json!({
        "status": status,
        "exit_code": exit_code(outcome),
        "report": report,
        "error": error,
        "teardown": teardown,
    });
    serde_json::to_writer_pretty(&mut *out, &doc)?;
    writeln!(out)?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}
