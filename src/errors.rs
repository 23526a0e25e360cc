//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The session directory could not be reached; retry later.
    StoreUnavailable(String),
    /// The requested session is not (or no longer) in the directory.
    SessionNotFound(String),
    /// A directory entry could not be decoded as a session descriptor.
    MalformedDescriptor(String),
    /// The breakpoint could not open its listener.
    ListenerBindFailed(String),
    /// The session endpoint refused the connection.
    ConnectionRefused(String),
    /// Another debugger is already attached to the session.
    SessionBusy(String),
    /// Remote control protocol violation.
    Protocol(String),
    /// A unit of work failed or was cancelled.
    Task(String),
    /// File-system or socket I/O failure.
    Io(String),
}

impl AppError {
    /// Whether the failure is transient and the call may be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::MalformedDescriptor(msg) => write!(f, "malformed descriptor: {msg}"),
            Self::ListenerBindFailed(msg) => write!(f, "listener bind failed: {msg}"),
            Self::ConnectionRefused(msg) => write!(f, "connection refused: {msg}"),
            Self::SessionBusy(msg) => write!(f, "session busy: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Task(msg) => write!(f, "task: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
