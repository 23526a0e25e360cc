//! Shared helpers for end-to-end breakpoint tests.
//!
//! Provides a fast-polling bridge configuration, a worker bound to an
//! in-process registry, and a raw protocol session for driving bridges
//! without the interactive client.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use breakpoint_relay::bridge::BridgeSettings;
use breakpoint_relay::client::{ClientSettings, DebuggerClient};
use breakpoint_relay::models::session::SessionDescriptor;
use breakpoint_relay::protocol::{Reply, ReplyCodec};
use breakpoint_relay::registry::{Backoff, SessionRegistry};
use breakpoint_relay::worker::{Worker, WorkerOptions};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fast_backoff() -> Backoff {
    Backoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
    }
}

/// Loopback bridge settings with short polling intervals.
pub fn fast_settings() -> BridgeSettings {
    BridgeSettings {
        descend_timeout: Duration::from_secs(5),
        backoff: fast_backoff(),
        ..BridgeSettings::loopback()
    }
}

pub fn fast_client_settings() -> ClientSettings {
    ClientSettings {
        follow_timeout: Duration::from_secs(5),
        backoff: fast_backoff(),
    }
}

/// Start a worker for `job_id` publishing into `registry`.
pub async fn start_worker(registry: &SessionRegistry, job_id: &str) -> Worker {
    start_worker_with(registry, fast_settings(), WorkerOptions::new(job_id)).await
}

pub async fn start_worker_with(
    registry: &SessionRegistry,
    settings: BridgeSettings,
    options: WorkerOptions,
) -> Worker {
    Worker::start(registry.clone(), settings, options)
        .await
        .expect("worker starts")
}

/// Poll until at least `count` sessions are listed.
pub async fn wait_for_sessions(registry: &SessionRegistry, count: usize) -> Vec<SessionDescriptor> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let listing = registry.list_sessions().await.expect("list");
            if listing.sessions.len() >= count {
                return listing.sessions;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions published in time")
}

/// Poll until the registry holds no sessions.
pub async fn wait_for_empty(registry: &SessionRegistry) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !registry.list_keys().await.expect("keys").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry drained in time");
}

/// Protocol-level connection to one bridge.
pub struct RawSession {
    replies: FramedRead<OwnedReadHalf, ReplyCodec>,
    writer: OwnedWriteHalf,
}

impl RawSession {
    /// Connect and return the session with its greeting.
    pub async fn connect(address: &str) -> (Self, Reply) {
        let stream = TcpStream::connect(address).await.expect("connect");
        let (reader, writer) = stream.into_split();
        let mut session = Self {
            replies: FramedRead::new(reader, ReplyCodec),
            writer,
        };
        let greeting = session.next_reply().await.expect("greeting");
        (session, greeting)
    }

    /// Send one command and return its reply; `None` once the bridge closed.
    pub async fn command(&mut self, line: &str) -> Option<Reply> {
        self.send(line).await;
        self.next_reply().await
    }

    /// Send one command without waiting for its reply.
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send command");
    }

    pub async fn next_reply(&mut self) -> Option<Reply> {
        tokio::time::timeout(TEST_TIMEOUT, self.replies.next())
            .await
            .expect("reply in time")
            .map(|reply| reply.expect("well-formed reply"))
    }
}

pub fn text(reply: &Reply) -> String {
    String::from_utf8(reply.body.clone()).expect("utf8 reply")
}

/// Drive the interactive client with scripted operator input until the
/// input runs out; returns everything the client printed.
pub async fn run_client(registry: &SessionRegistry, input: &str) -> String {
    let mut client = DebuggerClient::new(
        registry.clone(),
        fast_client_settings(),
        input.as_bytes(),
        Vec::new(),
    );
    tokio::time::timeout(TEST_TIMEOUT * 3, client.run())
        .await
        .expect("client finished in time")
        .expect("client run");
    String::from_utf8(client.into_output()).expect("utf8 transcript")
}
