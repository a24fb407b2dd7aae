pub mod imap;
pub mod parser;
pub mod types;

pub use imap::{
    ConnectionCommand, ConnectionEvent, ConnectionHandle, Connector, FetchEvent, ImapClient,
    ImapConnector, MailboxStatus, spawn_connection,
};
pub use parser::{Assembler, MailParserAssembler};
pub use types::{Address, Attachment, Mail, MessageFlags, ParsedMessage, SystemFlags};
