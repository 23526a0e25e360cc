//! One published breakpoint session: listener, attached client, and the
//! request/response loop run on behalf of the paused unit.

use std::net::SocketAddr;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{BridgeSettings, BridgeState, DisconnectPolicy, Frame, Resume, StepKind, StopReason};
use crate::models::session::{BreakpointLocation, SessionDescriptor, SessionIdentity, SessionKey};
use crate::protocol::codec::{escape_payload, BUSY_NOTICE, SUCCESSOR_MARKER};
use crate::protocol::command::HELP_TEXT;
use crate::protocol::{Command, CommandCodec, PROMPT};
use crate::registry::SessionRegistry;
use crate::{AppError, Result};

/// The single accepted client.
struct Connection {
    peer: SocketAddr,
    commands: FramedRead<OwnedReadHalf, CommandCodec>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            commands: FramedRead::new(reader, CommandCodec::new()),
            writer,
        }
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Outcome of racing a nested call against its successor session.
enum Handoff {
    Published(Result<Option<SessionDescriptor>>),
    Returned(String),
}

/// Network endpoint for one paused unit of work.
pub struct Bridge {
    descriptor: SessionDescriptor,
    registry: SessionRegistry,
    settings: BridgeSettings,
    listener: TcpListener,
    conn: Option<Connection>,
    state: BridgeState,
    successor: Option<SessionKey>,
    last_command: Option<Command>,
    /// Command read while waiting on a nested result, handled next.
    deferred: Option<Result<String>>,
}

impl Bridge {
    /// Bind a listener and publish the session descriptor.
    ///
    /// `key` is used when the unit was entered through a descend and must
    /// publish under the key its parent announced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ListenerBindFailed` if no listener can be bound, or
    /// the registry error once publish retries are exhausted. Either error
    /// affects only this breakpoint hit.
    pub async fn publish(
        registry: SessionRegistry,
        settings: BridgeSettings,
        identity: &SessionIdentity,
        location: BreakpointLocation,
        key: Option<SessionKey>,
    ) -> Result<Self> {
        let session_key =
            key.unwrap_or_else(|| SessionKey::generate(&identity.job_id, &identity.task_id));
        let span = info_span!(
            "bridge_publish",
            session_key = %session_key,
            job_id = %identity.job_id,
            task_id = %identity.task_id,
        );

        async move {
            let listener = TcpListener::bind((settings.bind_ip, 0))
                .await
                .map_err(|err| {
                    AppError::ListenerBindFailed(format!("{}: {err}", settings.bind_ip))
                })?;
            let port = listener.local_addr()?.port();

            let descriptor = SessionDescriptor {
                session_key,
                job_id: identity.job_id.clone(),
                task_id: identity.task_id.clone(),
                address: format!("{}:{port}", settings.advertised_host),
                location,
                created_at: Utc::now(),
            };
            registry
                .publish_with_retry(&descriptor, settings.publish_attempts, settings.backoff)
                .await?;

            info!(
                address = %descriptor.address,
                location = %descriptor.location,
                "breakpoint session published"
            );
            Ok(Self {
                descriptor,
                registry,
                settings,
                listener,
                conn: None,
                state: BridgeState::Awaiting,
                successor: None,
                last_command: None,
                deferred: None,
            })
        }
        .instrument(span)
        .await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Published descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Session key of this bridge.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.descriptor.session_key
    }

    /// Successor key handed out by the most recent descend, until the
    /// handoff is resolved.
    #[must_use]
    pub fn successor(&self) -> Option<&SessionKey> {
        self.successor.as_ref()
    }

    /// Suspend the calling unit at `frame` until the client decides how it
    /// resumes.
    ///
    /// # Errors
    ///
    /// Never fails on client misbehaviour: a lost client yields
    /// [`Resume::Disconnected`] or waits for a new client, per the
    /// disconnect policy.
    pub async fn stop<F: Frame + ?Sized>(
        &mut self,
        frame: &mut F,
        reason: StopReason,
    ) -> Result<Resume> {
        let span = info_span!(
            "bridge_stop",
            session_key = %self.descriptor.session_key,
            location = %frame.location(),
        );

        async move {
            let (mut greeting, show_banner) =
                self.stop_header(frame.pending_result(), &reason).await;
            if show_banner {
                greeting.push_str(&escape_payload(&frame.banner()));
            }
            greeting.push_str(PROMPT);
            self.serve(frame, &greeting).await
        }
        .instrument(span)
        .await
    }

    async fn stop_header(
        &mut self,
        pending: Option<BoxFuture<'static, String>>,
        reason: &StopReason,
    ) -> (String, bool) {
        match reason {
            StopReason::Breakpoint | StopReason::Step => (String::new(), true),
            StopReason::PostMortem(err) => (
                format!("*** post-mortem: {}\n", escape_payload(err)),
                true,
            ),
            StopReason::Descended { successor, call } => {
                self.state = BridgeState::Recursing;
                let handoff = self.await_successor(pending, successor).await;
                self.successor = None;

                match handoff {
                    Handoff::Published(Ok(Some(nested))) => {
                        info!(successor = %nested.session_key, "handing off to nested session");
                        (
                            format!(
                                "*** descending into {}\n{SUCCESSOR_MARKER}{} at {}\n",
                                escape_payload(call),
                                nested.session_key,
                                nested.address
                            ),
                            false,
                        )
                    }
                    Handoff::Published(Ok(None)) => (
                        format!(
                            "*** nested call did not suspend within {}s\n",
                            self.settings.descend_timeout.as_secs()
                        ),
                        true,
                    ),
                    Handoff::Published(Err(err)) => {
                        warn!(%successor, %err, "cannot follow nested call");
                        let err = escape_payload(&err.to_string());
                        (format!("*** cannot follow nested call: {err}\n"), true)
                    }
                    Handoff::Returned(value) => (
                        format!(
                            "*** nested call returned without suspending: {}\n",
                            escape_payload(&value)
                        ),
                        true,
                    ),
                }
            }
        }
    }

    async fn await_successor(
        &self,
        pending: Option<BoxFuture<'static, String>>,
        successor: &SessionKey,
    ) -> Handoff {
        let wait = self.registry.wait_for(
            successor,
            self.settings.descend_timeout,
            self.settings.backoff,
        );
        match pending {
            Some(result) => tokio::select! {
                biased;
                found = wait => Handoff::Published(found),
                value = result => Handoff::Returned(value),
            },
            None => Handoff::Published(wait.await),
        }
    }

    async fn serve<F: Frame + ?Sized>(&mut self, frame: &mut F, greeting: &str) -> Result<Resume> {
        let mut pending_greeting = true;
        loop {
            if self.conn.is_none() {
                self.state = BridgeState::Awaiting;
                self.conn = Some(self.accept().await);
                pending_greeting = true;
            }
            self.state = BridgeState::Active;

            let outcome = if pending_greeting {
                pending_greeting = false;
                self.send(greeting).await.map(|()| None)
            } else {
                self.next_command(frame).await
            };

            match outcome {
                Ok(Some(resume)) => {
                    debug!(?resume, "unit resumes");
                    return Ok(resume);
                }
                Ok(None) => {}
                Err(err) => {
                    let peer = self.conn.take().map(|conn| conn.peer);
                    self.deferred = None;
                    info!(?peer, %err, "debugger client disconnected");
                    match self.settings.disconnect {
                        DisconnectPolicy::Continue => return Ok(Resume::Disconnected),
                        DisconnectPolicy::AwaitReattach => {}
                    }
                }
            }
        }
    }

    async fn accept(&self) -> Connection {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "debugger client attached");
                    return Connection::new(stream, peer);
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(text).await,
            None => Err(AppError::Io("no client attached".into())),
        }
    }

    /// Send `body` as one prompted reply. Prompt and successor text inside
    /// the body is escaped so it cannot be mistaken for framing.
    async fn reply(&mut self, body: &str) -> Result<()> {
        let mut text = escape_payload(body);
        text.push_str(PROMPT);
        self.send(&text).await
    }

    /// Wait for a nested call's result, bounded by the descend timeout, while
    /// still watching the client. A closed connection is an error so the
    /// disconnect policy applies; a command sent meanwhile is kept for the
    /// next read.
    async fn await_nested(&mut self, result: BoxFuture<'static, String>) -> Result<String> {
        let limit = self.settings.descend_timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(AppError::Io("no client attached".into()));
        };

        tokio::select! {
            value = result => Ok(format!("*** result: {value}\n")),
            () = tokio::time::sleep(limit) => {
                debug!(timeout_secs = limit.as_secs(), "nested call still running");
                Ok(format!("*** nested call still running after {}s\n", limit.as_secs()))
            }
            line = conn.commands.next() => match line {
                None => Err(AppError::Io("client closed the connection".into())),
                Some(Err(err @ AppError::Io(_))) => Err(err),
                Some(line) => {
                    self.deferred = Some(line);
                    Ok("*** nested call still running\n".to_owned())
                }
            },
        }
    }

    /// Read and handle one command. `Ok(None)` keeps the unit paused.
    async fn next_command<F: Frame + ?Sized>(&mut self, frame: &mut F) -> Result<Option<Resume>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(AppError::Io("no client attached".into()));
        };

        let line = if let Some(deferred) = self.deferred.take() {
            Some(deferred)
        } else {
            tokio::select! {
                line = conn.commands.next() => line,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => reject_busy(stream, peer),
                        Err(err) => warn!(%err, "accept failed"),
                    }
                    return Ok(None);
                }
            }
        };

        let line = match line {
            None => return Err(AppError::Io("client closed the connection".into())),
            Some(Err(AppError::Protocol(msg))) => {
                self.reply(&format!("*** {msg}\n")).await?;
                return Ok(None);
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(line)) => line,
        };

        let command = match Command::parse(&line) {
            Command::Repeat => match self.last_command.clone() {
                Some(previous) => previous,
                None => {
                    self.reply("").await?;
                    return Ok(None);
                }
            },
            command => {
                self.last_command = Some(command.clone());
                command
            }
        };
        debug!(?command, "command received");

        match command {
            Command::List
            | Command::LongList
            | Command::Where
            | Command::Args
            | Command::Print(_) => {
                let output = frame.dispatch(&command);
                self.reply(&output).await?;
                Ok(None)
            }
            Command::Next => Ok(Some(Resume::Step(StepKind::Next))),
            Command::Step => Ok(Some(Resume::Step(StepKind::Into))),
            Command::Return => Ok(Some(Resume::Step(StepKind::Out))),
            Command::Continue => Ok(Some(Resume::Continue)),
            Command::Quit => Ok(Some(Resume::Quit)),
            Command::Descend => {
                let key = SessionKey::generate(
                    &self.descriptor.job_id,
                    &format!("{}/descend", self.descriptor.task_id),
                );
                info!(successor = %key, "descend requested");
                self.successor = Some(key.clone());
                Ok(Some(Resume::Descend(key)))
            }
            Command::Get => {
                let body = match frame.pending_result() {
                    Some(result) => self.await_nested(result).await?,
                    None => "*** no nested call to materialize\n".to_owned(),
                };
                self.reply(&body).await?;
                Ok(None)
            }
            Command::Help => {
                self.reply(HELP_TEXT).await?;
                Ok(None)
            }
            Command::Unrecognized(word) => {
                self.reply(&format!("*** Unknown command: {word}\n")).await?;
                Ok(None)
            }
            Command::Repeat => {
                self.reply("").await?;
                Ok(None)
            }
        }
    }

    /// End the session: delete the registry entry, send `note`, and close the
    /// client connection. Returns whether the entry was still present.
    ///
    /// # Errors
    ///
    /// Returns the registry error once retries are exhausted. The connection
    /// is closed regardless.
    pub async fn terminate(mut self, note: Option<&str>) -> Result<bool> {
        self.state = BridgeState::Terminated;
        let removed = self.remove_entry().await;

        if let Some(mut conn) = self.conn.take() {
            if let Some(note) = note {
                if let Err(err) = conn.send(&escape_payload(note)).await {
                    debug!(peer = %conn.peer, %err, "could not deliver closing note");
                }
            }
            if let Err(err) = conn.writer.shutdown().await {
                debug!(peer = %conn.peer, %err, "shutdown failed");
            }
        }

        if let Ok(removed) = removed {
            info!(
                session_key = %self.descriptor.session_key,
                removed,
                "breakpoint session closed"
            );
        }
        removed
    }

    async fn remove_entry(&self) -> Result<bool> {
        let key = self.descriptor.session_key.as_str();
        let mut delay = self.settings.backoff.initial;
        let mut attempt = 1;
        loop {
            match self.registry.remove(key).await {
                Ok(removed) => return Ok(removed),
                Err(err) if err.is_transient() && attempt < self.settings.publish_attempts => {
                    warn!(session_key = key, attempt, %err, "registry delete failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = self.settings.backoff.next(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Refuse a second client while one is attached.
fn reject_busy(mut stream: TcpStream, peer: SocketAddr) {
    info!(%peer, "rejecting debugger client: session busy");
    tokio::spawn(async move {
        if let Err(err) = stream.write_all(BUSY_NOTICE.as_bytes()).await {
            debug!(%peer, %err, "could not deliver busy notice");
        }
        if let Err(err) = stream.shutdown().await {
            debug!(%peer, %err, "shutdown failed");
        }
    });
}
