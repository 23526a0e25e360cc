//! Framing for the remote control protocol.
//!
//! Commands travel client → bridge as `\n`-terminated UTF-8 lines
//! ([`CommandCodec`]). Replies travel bridge → client as raw bytes ending in
//! the [`PROMPT`] marker ([`ReplyCodec`]); the client knows a reply is
//! complete when the prompt arrives, or when the bridge closes the stream.
//! Payload text that looks like framing is escaped with [`ESCAPE`].

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Prompt terminating every reply.
pub const PROMPT: &str = "(bdb) ";

/// Maximum accepted command line length: 64 KiB.
pub const MAX_COMMAND_BYTES: usize = 65_536;

/// Reply line announcing a nested session the client should attach to.
pub const SUCCESSOR_MARKER: &str = "*** successor ";

/// First line sent to a connection rejected because a client is attached.
pub const BUSY_NOTICE: &str = "*** session busy: another debugger is attached\n";

/// Line codec for inbound commands.
#[derive(Debug)]
pub struct CommandCodec(LinesCodec);

impl CommandCodec {
    /// Create a codec with the [`MAX_COMMAND_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_COMMAND_BYTES))
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CommandCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_lines_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_lines_error)
    }
}

impl Encoder<String> for CommandCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_lines_error)
    }
}

fn map_lines_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
            "command too long: exceeded {MAX_COMMAND_BYTES} bytes"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Escape byte (DLE). The byte following it is payload, never framing.
pub const ESCAPE: u8 = 0x10;

/// Escape payload text so [`PROMPT`] and [`SUCCESSOR_MARKER`] occurring in
/// it cannot be read as framing. Literal escape bytes are doubled.
#[must_use]
pub fn escape_payload(text: &str) -> String {
    let escape = char::from(ESCAPE);
    let mut out = String::with_capacity(text.len());
    for (at, ch) in text.char_indices() {
        let rest = &text[at..];
        if ch == escape || rest.starts_with(PROMPT) || rest.starts_with(SUCCESSOR_MARKER) {
            out.push(escape);
        }
        out.push(ch);
    }
    out
}

/// One reply received by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply bytes with escapes removed, prompt excluded.
    pub body: Vec<u8>,
    /// Whether the prompt arrived. `false` only for the trailing bytes
    /// before the bridge closed the stream.
    pub prompted: bool,
    announced: Option<String>,
}

impl Reply {
    /// Session key announced by an unescaped successor line, if any.
    #[must_use]
    pub fn successor(&self) -> Option<String> {
        self.announced.clone()
    }

    /// Whether the reply is the busy rejection notice.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.body.starts_with(BUSY_NOTICE.as_bytes())
    }
}

/// Splits the bridge's output stream on unescaped [`PROMPT`]s.
#[derive(Debug, Default)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(take_reply(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(take_reply(src, true))
    }
}

/// Cut one reply off the front of `src`. At EOF, bytes without a prompt
/// form a final unprompted reply.
fn take_reply(src: &mut BytesMut, at_eof: bool) -> Option<Reply> {
    let prompt = PROMPT.as_bytes();
    let marker = SUCCESSOR_MARKER.as_bytes();
    let mut body = Vec::new();
    let mut announced_at = None;
    let mut pos = 0;

    while pos < src.len() {
        let rest = &src[pos..];
        if rest[0] == ESCAPE {
            match rest.get(1) {
                Some(&byte) => body.push(byte),
                None if at_eof => {}
                None => return None,
            }
            pos += 2;
            continue;
        }
        if rest.starts_with(prompt) {
            src.advance(pos + prompt.len());
            return Some(finish_reply(body, true, announced_at));
        }
        let line_start = matches!(body.last(), None | Some(b'\n'));
        if line_start && announced_at.is_none() && rest.starts_with(marker) {
            announced_at = Some(body.len() + marker.len());
        }
        body.push(rest[0]);
        pos += 1;
    }

    if !at_eof || src.is_empty() {
        return None;
    }
    src.clear();
    Some(finish_reply(body, false, announced_at))
}

fn finish_reply(body: Vec<u8>, prompted: bool, announced_at: Option<usize>) -> Reply {
    let announced = announced_at.and_then(|at| {
        String::from_utf8_lossy(body.get(at..)?)
            .split_whitespace()
            .next()
            .map(str::to_owned)
    });
    Reply {
        body,
        prompted,
        announced,
    }
}
