//! Debugger client: lists sessions, lets the operator pick one, and relays
//! commands and replies verbatim.
//!
//! Nested sessions announced by a descend are followed depth-first: the
//! client keeps a stack of attached sessions and returns the operator to
//! the parent's prompt when a nested session ends.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::liveness::LivenessOracle;
use crate::models::session::{SessionDescriptor, SessionKey};
use crate::protocol::{Reply, ReplyCodec, PROMPT};
use crate::reaper::reap;
use crate::registry::{Backoff, SessionRegistry};
use crate::{AppError, Result};

/// Prompt shown under the session listing.
pub const PICK_PROMPT: &str = "Enter breakpoint index or press enter to refresh: ";

/// Client tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Bound on waiting for an announced successor session to appear.
    pub follow_timeout: Duration,
    /// Registry polling backoff.
    pub backoff: Backoff,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            follow_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

/// One attached session on the client's stack.
struct Attached {
    key: SessionKey,
    replies: FramedRead<OwnedReadHalf, ReplyCodec>,
    writer: OwnedWriteHalf,
}

/// How a pass-through session ended.
enum Detach {
    /// Every attached session ended; back to the listing.
    Listing,
    /// Operator input closed.
    InputClosed,
}

/// Interactive debugger front end over any line input and byte output.
pub struct DebuggerClient<R, W> {
    registry: SessionRegistry,
    settings: ClientSettings,
    oracle: Option<Arc<dyn LivenessOracle>>,
    input: R,
    output: W,
}

impl<R, W> DebuggerClient<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a client reading operator lines from `input`.
    pub fn new(registry: SessionRegistry, settings: ClientSettings, input: R, output: W) -> Self {
        Self {
            registry,
            settings,
            oracle: None,
            input,
            output,
        }
    }

    /// Reap dead jobs' sessions when the client starts.
    #[must_use]
    pub fn with_reaper(mut self, oracle: Arc<dyn LivenessOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Consume the client, returning its output sink.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Run the interactive loop until operator input ends.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the operator's terminal fails. Registry
    /// and session failures are reported inline and never end the loop.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(oracle) = self.oracle.clone() {
            match reap(&self.registry, oracle.as_ref()).await {
                Ok(report) if !report.removed.is_empty() => {
                    info!(removed = report.removed.len(), "stale sessions reaped at startup");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "startup reap failed"),
            }
        }

        loop {
            let sessions = match self.registry.list_sessions().await {
                Ok(listing) => listing.sessions,
                Err(err) => {
                    self.write(format!("Registry unavailable: {err}\n")).await?;
                    Vec::new()
                }
            };
            self.write(render_listing(&sessions)).await?;
            self.write(PICK_PROMPT).await?;

            let Some(choice) = self.read_line().await? else {
                return Ok(());
            };
            let choice = choice.trim();
            if choice.is_empty() {
                continue;
            }
            let Some(descriptor) = choice
                .parse::<usize>()
                .ok()
                .and_then(|index| sessions.get(index))
            else {
                self.write(format!("Invalid index: {choice}\n")).await?;
                continue;
            };

            let span = info_span!("debug_session", session_key = %descriptor.session_key);
            match self.debug_session(descriptor).instrument(span).await {
                Ok(Detach::Listing) => {}
                Ok(Detach::InputClosed) => return Ok(()),
                Err(err @ AppError::Io(_)) => return Err(err),
                Err(err @ (AppError::ConnectionRefused(_) | AppError::SessionBusy(_))) => {
                    debug!(%err, "session unavailable, refreshing");
                    self.write(format!("Could not attach: {err}\n")).await?;
                }
                Err(err) => {
                    self.write(format!("Session error: {err}\n")).await?;
                }
            }
        }
    }

    async fn debug_session(&mut self, descriptor: &SessionDescriptor) -> Result<Detach> {
        let (first, greeting) = attach(descriptor).await?;
        self.write(&greeting.body).await?;
        self.write(PROMPT).await?;
        let mut stack = vec![first];

        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(Detach::InputClosed);
            };
            let Some(top) = stack.last_mut() else {
                return Ok(Detach::Listing);
            };

            let reply = match send_line(top, &line).await {
                Ok(()) => top.replies.next().await,
                Err(err) => Some(Err(err)),
            };

            let ended = match reply {
                Some(Ok(reply)) => {
                    self.write(&reply.body).await?;
                    if reply.prompted {
                        match reply.successor() {
                            Some(successor) => {
                                if let Some(nested) = self.follow(&successor).await? {
                                    stack.push(nested);
                                }
                            }
                            None => self.write(PROMPT).await?,
                        }
                        false
                    } else {
                        true
                    }
                }
                Some(Err(err)) => {
                    debug!(%err, "session stream failed");
                    true
                }
                None => true,
            };

            if ended {
                if let Some(closed) = stack.pop() {
                    info!(session_key = %closed.key, "session ended");
                }
                match stack.last() {
                    Some(parent) => {
                        let notice = format!("*** returned to session {}\n{PROMPT}", parent.key);
                        self.write(notice).await?;
                    }
                    None => return Ok(Detach::Listing),
                }
            }
        }
    }

    /// Attach to an announced successor. Failures are reported and the
    /// operator stays on the current session.
    async fn follow(&mut self, successor: &str) -> Result<Option<Attached>> {
        let Some(key) = SessionKey::parse(successor) else {
            self.write(format!("*** malformed successor key {successor}\n{PROMPT}"))
                .await?;
            return Ok(None);
        };

        let found = self
            .registry
            .wait_for(&key, self.settings.follow_timeout, self.settings.backoff)
            .await;
        let failure = match found {
            Ok(Some(descriptor)) => match attach(&descriptor).await {
                Ok((nested, greeting)) => {
                    info!(session_key = %key, "following nested session");
                    self.write(&greeting.body).await?;
                    self.write(PROMPT).await?;
                    return Ok(Some(nested));
                }
                Err(err) => err.to_string(),
            },
            Ok(None) => format!(
                "not published within {}s",
                self.settings.follow_timeout.as_secs()
            ),
            Err(err) => err.to_string(),
        };
        self.write(format!("*** cannot follow {key}: {failure}\n{PROMPT}"))
            .await?;
        Ok(None)
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_owned()))
    }

    async fn write(&mut self, bytes: impl AsRef<[u8]>) -> Result<()> {
        self.output.write_all(bytes.as_ref()).await?;
        self.output.flush().await?;
        Ok(())
    }
}

/// Listing text with stable indices.
#[must_use]
pub fn render_listing(sessions: &[SessionDescriptor]) -> String {
    if sessions.is_empty() {
        return "No active breakpoints.\n".to_owned();
    }
    sessions
        .iter()
        .enumerate()
        .map(|(index, descriptor)| {
            format!(
                "{index}: {} | {} | job {}\n",
                descriptor.location, descriptor.address, descriptor.job_id
            )
        })
        .collect()
}

/// Connect to a session and read its greeting.
async fn attach(descriptor: &SessionDescriptor) -> Result<(Attached, Reply)> {
    let stream = TcpStream::connect(descriptor.address.as_str())
        .await
        .map_err(|err| {
            AppError::ConnectionRefused(format!("{} at {}: {err}", descriptor.session_key, descriptor.address))
        })?;
    let (reader, writer) = stream.into_split();
    let mut replies = FramedRead::new(reader, ReplyCodec);

    let greeting = match replies.next().await {
        Some(Ok(reply)) if reply.is_busy() => {
            return Err(AppError::SessionBusy(descriptor.session_key.to_string()));
        }
        Some(Ok(reply)) => reply,
        Some(Err(err)) => {
            return Err(AppError::ConnectionRefused(format!(
                "{}: {err}",
                descriptor.session_key
            )));
        }
        None => {
            return Err(AppError::ConnectionRefused(format!(
                "{} closed before greeting",
                descriptor.session_key
            )));
        }
    };

    Ok((
        Attached {
            key: descriptor.session_key.clone(),
            replies,
            writer,
        },
        greeting,
    ))
}

async fn send_line(session: &mut Attached, line: &str) -> Result<()> {
    session.writer.write_all(line.as_bytes()).await?;
    session.writer.write_all(b"\n").await?;
    session.writer.flush().await?;
    Ok(())
}
