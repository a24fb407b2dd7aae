//! Crate-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable.

/// IDLE refresh interval in seconds.
/// RFC 3501 recommends re-issuing IDLE at least every 29 minutes; we use 5 minutes for reliability.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Poll interval in seconds for servers that do not support IDLE.
pub const NOOP_POLL_SECS: u64 = 60;

/// Capacity of the command channel into a connection actor.
pub const CONNECTION_COMMAND_CAPACITY: usize = 32;

/// Capacity of the event channel out of a connection actor.
pub const CONNECTION_EVENT_CAPACITY: usize = 64;

/// Capacity of the per-fetch message channel.
/// Bounds how many fetched bodies can sit in memory ahead of the parser.
pub const FETCH_EVENT_CAPACITY: usize = 32;

/// Capacity of the consumer-facing event channel.
pub const NOTIFIER_EVENT_CAPACITY: usize = 256;

/// Mailbox opened when the configuration does not name one.
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// Search criteria used when the configuration does not name any.
pub const DEFAULT_SEARCH: &str = "UNSEEN";

/// Default port for IMAP over implicit TLS.
pub const DEFAULT_IMAPS_PORT: u16 = 993;
