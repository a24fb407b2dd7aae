use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

bitflags! {
    /// System flags defined by RFC 3501.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SystemFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
        const RECENT = 0b00100000;
    }
}

const SYSTEM_FLAG_NAMES: [(SystemFlags, &str); 6] = [
    (SystemFlags::SEEN, "\\Seen"),
    (SystemFlags::ANSWERED, "\\Answered"),
    (SystemFlags::FLAGGED, "\\Flagged"),
    (SystemFlags::DELETED, "\\Deleted"),
    (SystemFlags::DRAFT, "\\Draft"),
    (SystemFlags::RECENT, "\\Recent"),
];

/// Flag set of one message: system flags plus any server keywords.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    pub system: SystemFlags,
    pub keywords: BTreeSet<String>,
}

impl MessageFlags {
    /// Build from protocol flag names such as `\Seen` or `$Label1`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = MessageFlags::default();
        for name in names {
            flags.insert(name.as_ref());
        }
        flags
    }

    pub fn insert(&mut self, name: &str) {
        match SYSTEM_FLAG_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
        {
            Some((flag, _)) => self.system |= *flag,
            None => {
                self.keywords.insert(name.to_string());
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        SYSTEM_FLAG_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(flag, _)| self.system.contains(*flag))
            .unwrap_or_else(|| self.keywords.contains(name))
    }

    /// Protocol names of every flag in the set, system flags first.
    pub fn names(&self) -> Vec<String> {
        SYSTEM_FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.system.contains(*flag))
            .map(|(_, name)| name.to_string())
            .chain(self.keywords.iter().cloned())
            .collect()
    }

    pub fn is_seen(&self) -> bool {
        self.system.contains(SystemFlags::SEEN)
    }

    pub fn is_flagged(&self) -> bool {
        self.system.contains(SystemFlags::FLAGGED)
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.keywords.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl Address {
    pub fn display(&self) -> &str {
        self.name
            .as_deref()
            .or(self.address.as_deref())
            .unwrap_or("(unknown)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// A fully parsed message as produced by an `Assembler`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub date: Option<DateTime<Utc>>,
    /// Raw header fields in message order
    pub headers: Vec<(String, String)>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl ParsedMessage {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A new message delivered to the consumer: the parsed message plus the
/// identity the server reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub uid: u32,
    pub flags: MessageFlags,
    #[serde(flatten)]
    pub message: ParsedMessage,
}

impl Mail {
    pub fn subject(&self) -> &str {
        self.message.subject.as_deref().unwrap_or("(no subject)")
    }

    pub fn display_from(&self) -> &str {
        self.message
            .from
            .first()
            .map(Address::display)
            .unwrap_or("(unknown sender)")
    }
}
