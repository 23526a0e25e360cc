//! Recursive debugging: following nested calls into their own sessions.
//!
//! Validates:
//! - `remote` hands the client over to the nested call's session
//! - a nested call that never suspends reports its result to the parent
//! - `get` materializes the nested result while the parent stays paused
//! - continuing a nested session returns the operator to the parent

use serde_json::json;

use breakpoint_relay::registry::SessionRegistry;
use breakpoint_relay::worker::demo;

use super::test_helpers::{
    run_client, start_worker, text, wait_for_empty, wait_for_sessions, RawSession,
};

#[tokio::test(flavor = "multi_thread")]
async fn factorial_chain_is_followed_depth_first() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-fact").await;
    let handle = demo::submit_factorial(&worker, 5);
    wait_for_sessions(&registry, 1).await;

    let input = format!("0\n{}get\n{}", "remote\n".repeat(5), "c\n".repeat(5));
    let transcript = run_client(&registry, &input).await;

    assert!(transcript.contains("> demos/factorial.rs(5)fact()\n-> breakpoint();\n(bdb) "));
    for n in (1..=4).rev() {
        assert!(
            transcript.contains(&format!("*** descending into fact(n={n})\n")),
            "missing descend into fact({n}) in {transcript}"
        );
    }
    assert_eq!(transcript.matches("*** successor BDB_").count(), 4);
    assert!(transcript.contains("*** nested call returned without suspending: 1\n"));
    assert!(transcript.contains("*** result: 1\n(bdb) "));
    assert_eq!(transcript.matches("*** returned to session BDB_").count(), 4);
    assert!(transcript.ends_with("No active breakpoints.\nEnter breakpoint index or press enter to refresh: "));

    assert_eq!(handle.result().await.expect("result"), json!(120));
    wait_for_empty(&registry).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn successor_is_published_under_the_announced_key() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-handoff").await;
    let handle = demo::submit_factorial(&worker, 2);
    let sessions = wait_for_sessions(&registry, 1).await;

    let (mut parent, _) = RawSession::connect(&sessions[0].address).await;
    let handoff = parent.command("remote").await.expect("handoff reply");
    let announced = handoff.successor().expect("successor announced");
    assert!(text(&handoff).starts_with("*** descending into fact(n=1)\n"));

    let nested = registry
        .list_sessions()
        .await
        .expect("list")
        .sessions
        .into_iter()
        .find(|descriptor| descriptor.session_key.as_str() == announced)
        .expect("nested session listed");
    assert_eq!(nested.location.line, 5);
    assert_ne!(nested.task_id, sessions[0].task_id);

    let (mut child, greeting) = RawSession::connect(&nested.address).await;
    assert!(text(&greeting).contains("> demos/factorial.rs(5)fact()"));
    let args = child.command("a").await.expect("args");
    assert_eq!(text(&args), "n = 1\n");
    let chain = child.command("w").await.expect("where");
    assert_eq!(
        text(&chain),
        "  demos/factorial.rs(6)fact()\n> demos/factorial.rs(5)fact()\n"
    );
    assert!(child.command("c").await.is_none());

    // The parent is still paused; its nested result is now available.
    let result = parent.command("get").await.expect("get reply");
    assert_eq!(text(&result), "*** result: 1\n");
    assert!(parent.command("c").await.is_none());

    assert_eq!(handle.result().await.expect("result"), json!(2));
    wait_for_empty(&registry).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_without_nested_call_ends_with_a_note() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-no-call").await;
    let handle = demo::submit_commands(&worker);
    let sessions = wait_for_sessions(&registry, 1).await;

    let (mut session, _) = RawSession::connect(&sessions[0].address).await;
    let closing = session.command("remote").await.expect("closing note");
    assert!(!closing.prompted);
    assert_eq!(
        text(&closing),
        "*** unit finished without issuing a nested call\n"
    );

    assert_eq!(handle.result().await.expect("result"), json!(2));
    wait_for_empty(&registry).await;
}
