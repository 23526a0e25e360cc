//! Tests for client disconnects while a unit is paused.
//!
//! Validates:
//! - under the default policy a dropped client resumes the unit and the
//!   descriptor disappears
//! - under `AwaitReattach` the descriptor survives and a new client gets
//!   the same session

use std::time::Duration;

use serde_json::json;

use breakpoint_relay::bridge::{BridgeSettings, DisconnectPolicy};
use breakpoint_relay::registry::SessionRegistry;
use breakpoint_relay::worker::{demo, WorkerOptions};

use super::test_helpers::{
    fast_settings, start_worker, start_worker_with, text, wait_for_empty, wait_for_sessions,
    RawSession, TEST_TIMEOUT,
};

#[tokio::test(flavor = "multi_thread")]
async fn dropped_client_continues_the_unit() {
    let registry = SessionRegistry::in_memory();
    let worker = start_worker(&registry, "job-drop").await;
    let handle = demo::submit_commands(&worker);
    let sessions = wait_for_sessions(&registry, 1).await;

    let (session, greeting) = RawSession::connect(&sessions[0].address).await;
    assert!(greeting.prompted);
    drop(session);

    let value = tokio::time::timeout(TEST_TIMEOUT, handle.result())
        .await
        .expect("unit resumes after disconnect")
        .expect("result");
    assert_eq!(value, json!(2));
    wait_for_empty(&registry).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn await_reattach_keeps_the_session_for_a_new_client() {
    let registry = SessionRegistry::in_memory();
    let settings = BridgeSettings {
        disconnect: DisconnectPolicy::AwaitReattach,
        ..fast_settings()
    };
    let worker = start_worker_with(&registry, settings, WorkerOptions::new("job-reattach")).await;
    let handle = demo::submit_commands(&worker);
    let sessions = wait_for_sessions(&registry, 1).await;
    let address = sessions[0].address.clone();

    let (mut first, _) = RawSession::connect(&address).await;
    let reply = first.command("p i").await.expect("reply");
    assert_eq!(text(&reply), "1\n");
    drop(first);

    // The bridge may not have noticed the disconnect yet; retry while busy.
    let (mut second, greeting) = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let (session, greeting) = RawSession::connect(&address).await;
            if !greeting.is_busy() {
                return (session, greeting);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reattached in time");

    assert!(text(&greeting).contains("> demos/commands.rs(3)commands()"));
    assert_eq!(registry.list_keys().await.expect("keys").len(), 1);

    assert!(second.command("c").await.is_none());
    assert_eq!(handle.result().await.expect("result"), json!(2));
    wait_for_empty(&registry).await;
}
