//! IMAP connection: the wire-level session behind the notifier.
//!
//! This module is split into:
//! - `mod.rs` - Command/event vocabulary, the connection handle and `Connector`
//! - `client.rs` - TCP/TLS setup, authentication, select/search/fetch
//! - `actor.rs` - Actor loop: command dispatch, IDLE and change notifications
//! - `tls.rs` - rustls connector and stream plumbing

mod actor;
mod client;
mod tls;

use tokio::sync::{mpsc, oneshot};

use crate::config::{AuthMethod, NotifierConfig};
use crate::error::ConnectionError;

use super::types::MessageFlags;

pub use actor::spawn_connection;

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // XOAUTH2 format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// What the server reported when a mailbox was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
}

/// Commands sent TO the connection
#[derive(Debug)]
pub enum ConnectionCommand {
    OpenMailbox {
        name: String,
        reply: oneshot::Sender<Result<MailboxStatus, ConnectionError>>,
    },
    /// UID SEARCH; replies with matching UIDs in ascending order
    Search {
        criteria: String,
        reply: oneshot::Sender<Result<Vec<u32>, ConnectionError>>,
    },
    /// UID FETCH full bodies; results stream through `events` and finish with
    /// `FetchEvent::End` or `FetchEvent::Error`
    Fetch {
        uids: Vec<u32>,
        mark_seen: bool,
        events: mpsc::Sender<FetchEvent>,
    },
    /// Log out and close the session
    Logout,
}

/// Events sent FROM the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected and authenticated
    Ready,
    /// New messages arrived in the open mailbox
    Mail { count: u32 },
    /// A message was expunged externally
    Expunge { seq: u32 },
    /// The open mailbox reported its UIDVALIDITY
    UidValidity(u32),
    Error(ConnectionError),
    /// Session ended by logout
    End,
    /// Socket is gone
    Close { had_error: bool },
}

/// Per-message signals of one fetch, keyed by sequence number.
///
/// Identity and body of a message may arrive in either order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Message { seq: u32 },
    Attributes {
        seq: u32,
        uid: Option<u32>,
        flags: MessageFlags,
    },
    Body { seq: u32, raw: Vec<u8> },
    Error(ConnectionError),
    End,
}

/// Handle for one connection attempt
pub struct ConnectionHandle {
    pub cmd_tx: mpsc::Sender<ConnectionCommand>,
    pub event_rx: mpsc::Receiver<ConnectionEvent>,
}

/// Builds connections for the notifier.
///
/// Each call starts a fresh connection attempt whose progress is reported
/// through the returned handle's event channel.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, config: &NotifierConfig) -> ConnectionHandle;
}

/// `Connector` that opens real IMAP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn connect(&self, config: &NotifierConfig) -> ConnectionHandle {
        spawn_connection(ImapClient::new(config.clone()))
    }
}

pub(crate) type ImapSession = async_imap::Session<tokio_util::compat::Compat<tls::ImapStream>>;

pub struct ImapClient {
    pub(crate) session: Option<ImapSession>,
    pub config: NotifierConfig,
    /// Whether the server advertised IDLE (RFC 2177)
    pub(crate) has_idle: bool,
}

impl ImapClient {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            session: None,
            config,
            has_idle: false,
        }
    }

    pub(crate) fn auth_method(&self) -> &AuthMethod {
        &self.config.auth
    }
}
