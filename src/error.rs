//! Error types surfaced to consumers and between the connection and the core.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Where in the pipeline an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// Transport, TLS or authentication failure, before or after readiness.
    Connection,
    /// The configured mailbox could not be opened.
    OpenMailbox,
    /// A search command failed.
    Search,
    /// A fetch command failed part way or up front.
    Fetch,
    /// A fetched message body could not be assembled.
    Parse,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStage::Connection => "connection",
            ErrorStage::OpenMailbox => "open_mailbox",
            ErrorStage::Search => "search",
            ErrorStage::Fetch => "fetch",
            ErrorStage::Parse => "parse",
        };
        f.write_str(name)
    }
}

/// Error delivered to consumers with the `error` event.
///
/// Cloneable so it can travel through channels and be kept by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} error: {message}")]
pub struct NotifierError {
    stage: ErrorStage,
    message: String,
}

impl NotifierError {
    pub fn new(stage: ErrorStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> ErrorStage {
        self.stage
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_connection(stage: ErrorStage, err: &ConnectionError) -> Self {
        Self::new(stage, err.to_string())
    }
}

/// Errors raised by a mailbox connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// TCP connect failed.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Socket failure on an established session.
    #[error("I/O error: {0}")]
    Io(String),

    /// TLS handshake or configuration failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server answered NO/BAD or sent something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection is gone; the command never reached the server.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Protocol(_))
    }
}

impl From<async_imap::error::Error> for ConnectionError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;

        match err {
            Error::Io(e) => ConnectionError::Io(e.to_string()),
            Error::ConnectionLost => ConnectionError::Closed,
            Error::No(msg) | Error::Bad(msg) => ConnectionError::Protocol(msg),
            other => ConnectionError::Protocol(other.to_string()),
        }
    }
}

/// Errors raised while assembling a raw message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("message body is empty")]
    Empty,

    #[error("message could not be parsed")]
    Unparseable,
}
