//! Supervisor tests against real child processes.
//!
//! These use stock unix tools as peers: `cat` echoes our request back
//! (a structurally invalid response), `true` exits immediately, and a
//! shell with SIGTERM ignored forces the kill path.

#![cfg(unix)]

use std::time::{Duration, Instant};

use mh_mcp_client::{
    run_supervised, JsonRpcRequest, PeerConfig, PeerProcess, Plan, RpcError, SessionError, Step,
    Termination,
};

fn peer(command: &str, args: &[&str]) -> PeerConfig {
    PeerConfig {
        command: command.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        read_timeout_ms: 5_000,
        shutdown_grace_ms: 2_000,
        ..PeerConfig::default()
    }
}

#[tokio::test]
async fn echoed_request_is_a_protocol_violation() {
    let mut process = PeerProcess::start(&peer("cat", &[])).unwrap();

    let err = process
        .exchange(&JsonRpcRequest::new(1, "ping", None))
        .await
        .unwrap_err();
    match err {
        RpcError::ProtocolViolation { reason, line, .. } => {
            assert!(reason.contains("neither"), "{reason}");
            assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        }
        other => panic!("expected ProtocolViolation, got {other:?}"),
    }

    let teardown = process.shutdown().await;
    assert_ne!(teardown.termination, Termination::Killed);
}

#[tokio::test]
async fn exited_peer_is_peer_closed() {
    let mut process = PeerProcess::start(&peer("true", &[])).unwrap();

    let err = process
        .exchange(&JsonRpcRequest::new(1, "initialize", None))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, RpcError::PeerClosed { method } if method == "initialize"),
        "{err:?}"
    );

    let teardown = process.shutdown().await;
    assert_eq!(teardown.exit_code(), Some(0));
}

#[tokio::test]
async fn shutdown_twice_returns_the_same_teardown() {
    let mut process = PeerProcess::start(&peer("cat", &[])).unwrap();
    assert!(process.pid().is_some());
    assert!(process.teardown().is_none());

    let first = process.shutdown().await;
    let second = process.shutdown().await;

    assert_eq!(first, second);
    assert_ne!(first.termination, Termination::Killed);
    assert_eq!(process.teardown(), Some(first));

    let err = process
        .exchange(&JsonRpcRequest::new(1, "ping", None))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Closed { .. }), "{err:?}");
}

#[tokio::test]
async fn stubborn_peer_is_killed_after_grace() {
    let config = PeerConfig {
        shutdown_grace_ms: 200,
        ..peer("sh", &["-c", "trap '' TERM; exec sleep 30"])
    };
    let mut process = PeerProcess::start(&config).unwrap();

    let started = Instant::now();
    let teardown = process.shutdown().await;

    assert_eq!(teardown.termination, Termination::Killed);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(process.shutdown().await, teardown);
}

#[tokio::test]
async fn peer_ignoring_eof_stops_on_sigterm() {
    // Never reads stdin, so only the signal can end it.
    let mut process = PeerProcess::start(&peer("sleep", &["30"])).unwrap();
    let teardown = process.shutdown().await;
    assert_eq!(teardown.termination, Termination::Graceful);
    assert_eq!(teardown.exit_code(), None);
}

#[tokio::test]
async fn env_and_defaults_reach_the_peer() {
    let mut config = peer(
        "sh",
        &[
            "-c",
            r#"read _; printf '{"jsonrpc":"2.0","id":1,"result":{"mode":"%s","fallback":"%s"}}\n' "$MH_TEST_MODE" "$MH_TEST_UNSET_DEFAULT""#,
        ],
    );
    config.env.insert("MH_TEST_MODE".into(), "pinned".into());
    config
        .env_defaults
        .insert("MH_TEST_UNSET_DEFAULT".into(), "from-default".into());

    let mut process = PeerProcess::start(&config).unwrap();
    let resp = process
        .exchange(&JsonRpcRequest::new(1, "initialize", None))
        .await
        .unwrap();
    let result = resp.into_result().unwrap();
    assert_eq!(result["mode"], "pinned");
    assert_eq!(result["fallback"], "from-default");
    process.shutdown().await;
}

#[tokio::test]
async fn supervised_run_tears_down_after_peer_closed() {
    let plan = Plan::new(vec![Step::ping()]);
    let outcome = run_supervised(&peer("true", &[]), &plan, std::future::pending()).await;

    assert!(matches!(
        outcome.result,
        Err(SessionError::Rpc(RpcError::PeerClosed { .. }))
    ));
    let teardown = outcome.teardown.expect("peer was started, so it must be torn down");
    assert_ne!(teardown.termination, Termination::Killed);
}

#[tokio::test]
async fn supervised_run_reports_launch_failure_without_teardown() {
    let plan = Plan::new(vec![Step::ping()]);
    let outcome = run_supervised(
        &peer("mh-no-such-peer-binary", &[]),
        &plan,
        std::future::pending(),
    )
    .await;

    match outcome.result {
        Err(SessionError::Rpc(e)) => assert!(e.is_launch_failure(), "{e:?}"),
        other => panic!("expected launch failure, got {other:?}"),
    }
    assert!(outcome.teardown.is_none());
}

#[tokio::test]
async fn interrupt_during_exchange_still_tears_down() {
    // `sleep` never answers; the interrupt fires while the read is pending.
    let plan = Plan::new(vec![Step::ping()]);
    let outcome = run_supervised(
        &peer("sleep", &["30"]),
        &plan,
        tokio::time::sleep(Duration::from_millis(100)),
    )
    .await;

    assert!(matches!(outcome.result, Err(SessionError::Interrupted)));
    let teardown = outcome.teardown.unwrap();
    assert_eq!(teardown.termination, Termination::Graceful);
}

#[tokio::test]
async fn chatty_non_utf8_stderr_does_not_block_or_kill_the_peer() {
    // ~96 KiB of stderr, more than a pipe buffer holds, with invalid UTF-8
    // on every line, before and after the request is read.
    let script = r#"
i=0
while [ $i -lt 2000 ]; do
  printf '\377\376 chatty peer log line padding padding padding\n' >&2
  i=$((i+1))
done
read _
printf '\377 after request\n' >&2
printf '{"jsonrpc":"2.0","id":1,"result":{"status":"ok"}}\n'
"#;
    let mut process = PeerProcess::start(&peer("sh", &["-c", script])).unwrap();

    let resp = process
        .exchange(&JsonRpcRequest::new(1, "ping", None))
        .await
        .unwrap();
    assert_eq!(resp.into_result().unwrap()["status"], "ok");

    let teardown = process.shutdown().await;
    assert_ne!(teardown.termination, Termination::Killed);
    assert_eq!(teardown.exit_code(), Some(0));
}

#[tokio::test]
async fn peer_dying_on_its_own_is_already_exited() {
    // Ignores stdin and kills itself, so neither EOF nor SIGTERM ends it.
    let mut process = PeerProcess::start(&peer("sh", &["-c", "sleep 0.2; kill -KILL $$"])).unwrap();
    let teardown = process.shutdown().await;
    assert_eq!(teardown.termination, Termination::AlreadyExited);
    assert_eq!(teardown.exit_code(), None);
}
