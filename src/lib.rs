//! Watch an IMAP mailbox and get each new matching message as a parsed
//! `Mail`, with its UID and flags attached.

pub mod actor;
pub mod config;
pub mod constants;
pub mod error;
pub mod mail;
pub mod notifier;

pub use config::{AuthMethod, NotifierConfig};
pub use error::{AssembleError, ConnectionError, ErrorStage, NotifierError};
pub use mail::{Mail, MessageFlags, ParsedMessage};
pub use notifier::{LifecycleState, Notifier, NotifierEvent};
