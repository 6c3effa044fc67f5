//! Supervisor tests against the real echo server binary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use toolbrain::mcp_client::health::{run_health_check, ProbeOutcome};
use toolbrain::mcp_client::lifecycle::content_text;
use toolbrain::mcp_client::{
    ErrorKind, HealthSettings, LifecycleTimeouts, McpError, ServerDescriptor, ServerState,
    Supervisor, SupervisorSettings,
};

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_toolbrain-echo-server");

fn echo(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, ECHO_SERVER).with_args(["--name", name])
}

fn settings(max_restart_attempts: u32) -> SupervisorSettings {
    SupervisorSettings {
        call_timeout: Duration::from_millis(500),
        lifecycle: LifecycleTimeouts {
            init: Duration::from_secs(10),
            shutdown: Duration::from_secs(2),
        },
        health: HealthSettings {
            interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(2),
            max_restart_attempts,
            restart_backoff: Duration::from_millis(10),
        },
    }
}

fn supervisor(descriptors: Vec<ServerDescriptor>) -> Supervisor {
    Supervisor::new(descriptors, settings(3)).unwrap()
}

#[tokio::test]
async fn test_start_all_namespaces_every_tool() {
    let sup = supervisor(vec![
        echo("alpha").with_args(["--tools", "ping,echo"]),
        echo("beta").with_args(["--tools", "ping"]),
    ]);

    let results = sup.start_all().await;
    assert!(results.iter().all(|r| r.is_ok()));

    let names: Vec<String> = sup
        .list_tools()
        .await
        .into_iter()
        .map(|t| t.qualified_name)
        .collect();
    assert_eq!(names, vec!["alpha_ping", "alpha_echo", "beta_ping"]);

    sup.cleanup().await;
}

#[tokio::test]
async fn test_invoke_routes_and_classifies_errors() {
    let sup = supervisor(vec![echo("echo").with_args(["--tools", "ping"])]);
    sup.start_all().await;

    let result = sup.invoke("echo_ping", json!({})).await.unwrap();
    assert_eq!(content_text(&result), "pong");

    let err = sup.invoke("echo_pong", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownTool);

    let err = sup.invoke("ghost_ping", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::ServerUnavailable { ref name } if name == "ghost"));

    sup.cleanup().await;
}

#[tokio::test]
async fn test_tool_errors_and_timeouts_do_not_break_the_server() {
    let sup = supervisor(vec![echo("echo")]);
    sup.start_all().await;

    let err = sup.invoke("echo_fail", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolExecution);
    assert!(err.to_string().contains("requested failure"));

    let err = sup
        .invoke("echo_sleep", json!({"ms": 2_000}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolExecution);

    let result = sup.invoke("echo_echo", json!({"text": "still here"})).await.unwrap();
    assert_eq!(content_text(&result), "still here");

    sup.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let sup = supervisor(vec![echo("echo")]);
    sup.start_all().await;

    let (slow, fast) = tokio::join!(
        sup.invoke("echo_sleep", json!({"ms": 200})),
        sup.invoke("echo_echo", json!({"text": "fast"})),
    );
    assert_eq!(content_text(&slow.unwrap()), "slept 200ms");
    assert_eq!(content_text(&fast.unwrap()), "fast");

    sup.cleanup().await;
}

#[tokio::test]
async fn test_failed_handshake_leaves_server_out() {
    let sup = supervisor(vec![
        echo("broken").with_args(["--fail-handshake"]),
        echo("good").with_args(["--tools", "ping"]),
    ]);

    let results = sup.start_all().await;
    let err = results[0].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Startup);
    assert!(err.to_string().contains("handshake refused"));
    assert_eq!(results[1].as_ref().unwrap(), "good");

    assert_eq!(sup.running_servers().await, vec!["good"]);
    let status = sup.status().await;
    assert_eq!(status[0].state, ServerState::Stopped);
    assert!(status[0].last_error.is_some());
    assert!(status[0].started_at.is_none());
    assert_eq!(status[1].state, ServerState::Running);
    assert_eq!(status[1].tool_count, 1);
    assert!(status[1].started_at.is_some());

    sup.cleanup().await;
}

#[tokio::test]
async fn test_missing_credentials_disable_server() {
    let sup = supervisor(vec![
        echo("db").with_required_env("__TOOLBRAIN_TEST_MISSING_SECRET__")
    ]);
    let results = sup.start_all().await;
    assert!(matches!(results[0], Err(McpError::Disabled { .. })));
    assert_eq!(sup.status().await[0].state, ServerState::Disabled);
    assert!(sup.list_tools().await.is_empty());
}

#[tokio::test]
async fn test_stop_makes_server_unavailable() {
    let sup = supervisor(vec![echo("echo")]);
    sup.start_all().await;
    assert!(sup.is_server_running("echo").await);

    sup.stop("echo").await;
    sup.stop("echo").await;

    let err = sup.invoke("echo_ping", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerUnavailable);
    assert!(sup.list_tools().await.is_empty());

    assert_eq!(sup.restart("echo").await.unwrap(), 5);
    assert!(sup.invoke("echo_ping", json!({})).await.is_ok());

    sup.cleanup().await;
}

#[tokio::test]
async fn test_health_check_restarts_then_gives_up() {
    let sup = Supervisor::new(vec![echo("echo")], settings(1)).unwrap();
    let health = sup.settings().health;
    sup.start_all().await;

    let outcomes = run_health_check(&sup, &health).await;
    assert_eq!(outcomes, vec![("echo".to_string(), ProbeOutcome::Healthy)]);

    // First crash: restarted with a fresh process.
    let first = sup.status().await[0].clone();
    let _ = sup.invoke("echo_exit", json!({})).await;
    let outcomes = run_health_check(&sup, &health).await;
    assert_eq!(outcomes[0].1, ProbeOutcome::Restarted { attempt: 1 });
    let status = &sup.status().await[0];
    assert_eq!(status.state, ServerState::Running);
    assert_eq!(status.restart_count, 1);
    assert_ne!(status.pid, first.pid);
    assert!(status.started_at > first.started_at);
    assert!(sup.invoke("echo_ping", json!({})).await.is_ok());

    // Second crash: budget spent.
    let _ = sup.invoke("echo_exit", json!({})).await;
    let outcomes = run_health_check(&sup, &health).await;
    assert_eq!(outcomes[0].1, ProbeOutcome::GaveUp { attempts: 1 });
    assert_eq!(sup.status().await[0].state, ServerState::Failed);

    // No further attempts.
    assert!(run_health_check(&sup, &health).await.is_empty());
    let err = sup.invoke("echo_ping", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerUnavailable);

    sup.cleanup().await;
}

#[tokio::test]
async fn test_hung_probe_does_not_hold_up_other_servers() {
    let mut settings = settings(3);
    settings.health.probe_timeout = Duration::from_millis(300);
    let sup = Supervisor::new(
        vec![echo("good"), echo("stuck").with_args(["--hang-list"])],
        settings,
    )
    .unwrap();
    let health = sup.settings().health;
    assert!(sup.start_all().await.iter().all(|r| r.is_ok()));

    let (stuck, good_elapsed) = tokio::join!(sup.probe("stuck", health.probe_timeout), async {
        let started = Instant::now();
        sup.probe("good", health.probe_timeout).await.unwrap();
        started.elapsed()
    });
    assert!(matches!(stuck, Err(McpError::Timeout { .. })));
    assert!(good_elapsed < health.probe_timeout);

    let started = Instant::now();
    let outcomes = run_health_check(&sup, &health).await;
    let elapsed = started.elapsed();

    assert_eq!(
        outcomes,
        vec![
            ("good".to_string(), ProbeOutcome::Healthy),
            ("stuck".to_string(), ProbeOutcome::Restarted { attempt: 1 }),
        ]
    );
    assert!(elapsed >= health.probe_timeout);
    assert!(elapsed < Duration::from_secs(5), "round took {elapsed:?}");

    let status = sup.status().await;
    assert_eq!(status[1].state, ServerState::Running);
    assert_eq!(status[1].restart_count, 1);
    assert_eq!(status[1].tool_count, 5);

    sup.cleanup().await;
}

#[tokio::test]
async fn test_initialize_once_and_cleanup() {
    let sup = Arc::new(supervisor(vec![echo("a"), echo("b")]));
    assert!(!sup.is_initialized());

    let results = sup.initialize().await;
    assert_eq!(results.len(), 2);
    assert!(sup.is_initialized());
    assert!(sup.initialize().await.is_empty());

    sup.cleanup().await;
    assert!(!sup.is_initialized());
    assert!(sup.running_servers().await.is_empty());
    assert!(sup
        .status()
        .await
        .iter()
        .all(|s| s.state == ServerState::Stopped));
}
