//! End-to-end tests for the breakpoint bridge lifecycle.
//!
//! Validates:
//! - a breakpoint publishes one descriptor whose address accepts a client
//! - `continue` releases the unit and deletes the descriptor
//! - concurrent breakpoints get distinct keys and addresses
//! - a second client is rejected while one is attached
//! - bind failures affect only the breakpoint that hit them
//! - prompt text inside source and values does not split replies

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;

use breakpoint_relay::bridge::{Bridge, BridgeSettings, BridgeState};
use breakpoint_relay::models::session::{BreakpointLocation, SessionIdentity, SESSION_KEY_PREFIX};
use breakpoint_relay::registry::SessionRegistry;
use breakpoint_relay::worker::{
    demo, SourceListing, TaskContext, TaskFuture, TaskSpec, WorkerOptions,
};
use breakpoint_relay::AppError;

use super::test_helpers::{
    fast_settings, start_worker, start_worker_with, text, wait_for_empty, wait_for_sessions,
    RawSession,
};

#[tokio::test(flavor = "multi_thread")]
async fn breakpoint_publishes_and_continue_releases() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-continue").await;
    let before = Utc::now();
    let handle = demo::submit_commands(&worker);

    let sessions = wait_for_sessions(&registry, 1).await;
    let descriptor = &sessions[0];
    assert!(descriptor.session_key.as_str().starts_with(SESSION_KEY_PREFIX));
    assert_eq!(descriptor.job_id, "job-continue");
    assert_eq!(descriptor.task_id, handle.task_id());
    assert_eq!(descriptor.location.file, "demos/commands.rs");
    assert_eq!(descriptor.location.line, 3);
    assert_eq!(descriptor.location.function, "commands");
    assert!(descriptor.address.starts_with("127.0.0.1:"));
    assert!(descriptor.created_at >= before);

    let (mut session, greeting) = RawSession::connect(&descriptor.address).await;
    let banner = text(&greeting);
    assert!(greeting.prompted);
    assert!(banner.contains("> demos/commands.rs(3)commands()"), "{banner}");
    assert!(banner.contains("-> breakpoint();"), "{banner}");

    let reply = session.command("p i").await.expect("reply");
    assert_eq!(text(&reply), "1\n");

    assert!(session.command("c").await.is_none(), "continue closes the stream");
    assert_eq!(handle.result().await.expect("result"), json!(2));
    assert!(registry.list_keys().await.expect("keys").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn inspection_commands_keep_the_unit_paused() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-inspect").await;
    let handle = demo::submit_commands(&worker);
    let sessions = wait_for_sessions(&registry, 1).await;

    let (mut session, _) = RawSession::connect(&sessions[0].address).await;

    let listing = text(&session.command("l").await.expect("reply"));
    assert!(listing.contains("   3 ->\t    breakpoint();"), "{listing}");

    let args = text(&session.command("a").await.expect("reply"));
    assert!(args.is_empty());

    let missing = text(&session.command("p nope").await.expect("reply"));
    assert_eq!(missing, "*** NameError: name 'nope' is not defined\n");

    let unknown = text(&session.command("frobnicate").await.expect("reply"));
    assert_eq!(unknown, "*** Unknown command: frobnicate\n");

    let help = text(&session.command("help").await.expect("reply"));
    assert!(help.contains("remote"));

    // Blank line repeats the previous command.
    let repeated = text(&session.command("").await.expect("reply"));
    assert_eq!(repeated, help);

    let nothing = text(&session.command("get").await.expect("reply"));
    assert_eq!(nothing, "*** no nested call to materialize\n");

    assert_eq!(registry.list_keys().await.expect("keys").len(), 1);
    assert!(session.command("q").await.is_none());
    assert_eq!(handle.result().await.expect("result"), json!(2));
    wait_for_empty(&registry).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_breakpoints_get_distinct_sessions() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-concurrent").await;
    let first = demo::submit_commands(&worker);
    let second = demo::submit_commands(&worker);

    let sessions = wait_for_sessions(&registry, 2).await;
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0].session_key, sessions[1].session_key);
    assert_ne!(sessions[0].address, sessions[1].address);
    assert_ne!(sessions[0].task_id, sessions[1].task_id);

    for descriptor in &sessions {
        let (mut session, _) = RawSession::connect(&descriptor.address).await;
        assert!(session.command("c").await.is_none());
    }
    assert_eq!(first.result().await.expect("first"), json!(2));
    assert_eq!(second.result().await.expect("second"), json!(2));
    wait_for_empty(&registry).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_client_is_rejected_while_attached() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-busy").await;
    let handle = demo::submit_commands(&worker);
    let sessions = wait_for_sessions(&registry, 1).await;
    let address = &sessions[0].address;

    let (mut first, _) = RawSession::connect(address).await;
    let (mut second, rejection) = RawSession::connect(address).await;
    assert!(rejection.is_busy(), "got {:?}", text(&rejection));
    assert!(!rejection.prompted);
    assert!(second.next_reply().await.is_none());

    // The attached client is unaffected.
    let reply = first.command("p i").await.expect("reply");
    assert_eq!(text(&reply), "1\n");
    assert!(first.command("c").await.is_none());
    assert_eq!(handle.result().await.expect("result"), json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_failure_fails_only_that_breakpoint() {
    let registry = SessionRegistry::in_memory();
    let unroutable = BridgeSettings {
        // TEST-NET-1: never assigned to a local interface.
        bind_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        ..fast_settings()
    };

    let identity = SessionIdentity {
        job_id: "job-bind".into(),
        task_id: "task-1".into(),
    };
    let location = BreakpointLocation {
        file: "f.rs".into(),
        line: 1,
        function: "f".into(),
    };
    let err = Bridge::publish(registry.clone(), unroutable.clone(), &identity, location, None)
        .await
        .err()
        .expect("bind fails");
    assert!(matches!(err, AppError::ListenerBindFailed(_)), "got {err}");
    assert!(registry.list_keys().await.expect("keys").is_empty());

    let worker = start_worker_with(&registry, unroutable, WorkerOptions::new("job-bind")).await;
    let failed = demo::submit_commands(&worker);
    let err = failed.result().await.expect_err("unit fails");
    assert!(err.to_string().contains("listener bind failed"), "got {err}");

    // The job keeps running other units.
    let healthy = start_worker(&registry, "job-bind").await;
    let untraced = healthy.submit(demo::commands_spec().untraced(), demo::commands);
    assert_eq!(untraced.result().await.expect("untraced"), json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_breakpoints_never_suspend() {
    let registry = SessionRegistry::in_memory();
    let options = WorkerOptions {
        breakpoints_enabled: false,
        ..WorkerOptions::new("job-disabled")
    };
    let worker = start_worker_with(&registry, fast_settings(), options).await;

    let handle = demo::submit_commands(&worker);
    assert_eq!(handle.result().await.expect("result"), json!(2));
    assert!(registry.list_keys().await.expect("keys").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn published_bridge_reports_state_and_terminates_idempotently() {
    let registry = SessionRegistry::in_memory();
    let identity = SessionIdentity {
        job_id: "job-direct".into(),
        task_id: "task-1".into(),
    };
    let location = BreakpointLocation {
        file: "f.rs".into(),
        line: 7,
        function: "f".into(),
    };
    let bridge = Bridge::publish(registry.clone(), fast_settings(), &identity, location, None)
        .await
        .expect("publish");
    assert_eq!(bridge.state(), BridgeState::Awaiting);
    assert!(bridge.successor().is_none());

    let fetched = registry.get(bridge.key()).await.expect("published");
    assert_eq!(&fetched, bridge.descriptor());

    // A concurrent reaper already deleted the entry.
    registry.remove(bridge.key().as_str()).await.expect("remove");
    let removed = bridge.terminate(None).await.expect("terminate");
    assert!(!removed);
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn external_visibility_advertises_node_address() {
    let registry = SessionRegistry::in_memory();
    let config = breakpoint_relay::GlobalConfig::from_toml_str(
        "debugger_external = true\nnode_ip = \"127.0.0.2\"\n",
    )
    .expect("config");
    let settings = BridgeSettings {
        backoff: super::test_helpers::fast_backoff(),
        ..config.bridge_settings().expect("settings")
    };
    let worker = start_worker_with(&registry, settings, WorkerOptions::new("job-ext")).await;
    let handle = demo::submit_commands(&worker);

    let sessions = wait_for_sessions(&registry, 1).await;
    assert!(
        sessions[0].address.starts_with("127.0.0.2:"),
        "{}",
        sessions[0].address
    );

    let (mut session, _) = RawSession::connect(&sessions[0].address).await;
    assert!(session.command("c").await.is_none());
    assert_eq!(handle.result().await.expect("result"), json!(2));
}

const PROMPT_TEXT_SOURCE: &str = "\
fn echo_prompt() -> u64 {
    let marker = \"(bdb) \";
    breakpoint();
    log(marker);
    1
}";

fn echo_prompt(ctx: TaskContext) -> TaskFuture {
    async move {
        ctx.line(2).await?;
        ctx.set_local("marker", "(bdb) ").await;
        ctx.line(3).await?;
        ctx.breakpoint().await?;
        ctx.line(4).await?;
        ctx.line(5).await?;
        Ok(json!(1))
    }
    .boxed()
}

#[tokio::test(flavor = "multi_thread")]
async fn prompt_text_in_source_does_not_split_replies() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-prompt-text").await;
    let source = SourceListing::new("demos/echo_prompt.rs", 1, PROMPT_TEXT_SOURCE);
    let handle = worker.submit(TaskSpec::new("echo_prompt", Arc::new(source)), echo_prompt);
    let sessions = wait_for_sessions(&registry, 1).await;

    let (mut session, _) = RawSession::connect(&sessions[0].address).await;
    let listing = session.command("ll").await.expect("listing");
    assert!(listing.prompted);
    let listing = text(&listing);
    assert!(listing.contains("let marker = \"(bdb) \";\n"), "{listing}");
    assert!(listing.contains("log(marker);\n"), "{listing}");
    assert!(listing.ends_with("}\n"), "{listing}");

    // The next reply belongs to the next command.
    let marker = session.command("p marker").await.expect("value");
    assert_eq!(text(&marker), "\"(bdb) \"\n");
    let missing = session.command("p nothing").await.expect("name error");
    assert_eq!(text(&missing), "*** NameError: name 'nothing' is not defined\n");

    assert!(session.command("c").await.is_none());
    assert_eq!(handle.result().await.expect("result"), json!(1));
    wait_for_empty(&registry).await;
}
