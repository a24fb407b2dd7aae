//! Stitches server-reported identity onto parsed messages.
//!
//! A fetch reports each message's UID/flags and its body as separate signals
//! that may come in either order. Each message is tracked until both halves
//! are present, then released once as a `Mail`.

use std::collections::BTreeMap;

use crate::error::AssembleError;
use crate::mail::parser::Assembler;
use crate::mail::types::{Mail, MessageFlags, ParsedMessage};

/// One message between "announced by fetch" and "handed to the consumer".
#[derive(Debug, Default)]
pub struct InFlightMessage {
    uid: Option<u32>,
    flags: MessageFlags,
    parsed: Option<ParsedMessage>,
}

impl InFlightMessage {
    pub fn set_identity(&mut self, uid: Option<u32>, flags: MessageFlags) {
        // A later announcement without a UID keeps the one we have
        if uid.is_some() {
            self.uid = uid;
        }
        self.flags = flags;
    }

    pub fn set_parsed(&mut self, parsed: ParsedMessage) {
        self.parsed = Some(parsed);
    }

    pub fn is_complete(&self) -> bool {
        self.uid.is_some() && self.parsed.is_some()
    }

    /// The finished mail, if both identity and body are in.
    pub fn into_mail(self) -> Result<Mail, Self> {
        match self {
            InFlightMessage {
                uid: Some(uid),
                flags,
                parsed: Some(message),
            } => Ok(Mail {
                uid,
                flags,
                message,
            }),
            incomplete => Err(incomplete),
        }
    }
}

/// Per-fetch bookkeeping of in-flight messages, keyed by sequence number.
pub struct MessageAssembly<'a> {
    assembler: &'a dyn Assembler,
    pending: BTreeMap<u32, InFlightMessage>,
}

impl<'a> MessageAssembly<'a> {
    pub fn new(assembler: &'a dyn Assembler) -> Self {
        Self {
            assembler,
            pending: BTreeMap::new(),
        }
    }

    pub fn announce(&mut self, seq: u32) {
        self.pending.entry(seq).or_default();
    }

    pub fn identify(&mut self, seq: u32, uid: Option<u32>, flags: MessageFlags) -> Option<Mail> {
        self.pending
            .entry(seq)
            .or_default()
            .set_identity(uid, flags);
        self.release(seq)
    }

    /// Parse a body. Parse failures drop the message and are returned to the caller.
    pub fn deliver(&mut self, seq: u32, raw: &[u8]) -> Result<Option<Mail>, AssembleError> {
        match self.assembler.assemble(raw) {
            Ok(parsed) => {
                self.pending.entry(seq).or_default().set_parsed(parsed);
                Ok(self.release(seq))
            }
            Err(e) => {
                self.pending.remove(&seq);
                Err(e)
            }
        }
    }

    fn release(&mut self, seq: u32) -> Option<Mail> {
        if !self.pending.get(&seq)?.is_complete() {
            return None;
        }
        self.pending.remove(&seq)?.into_mail().ok()
    }

    /// Sequence numbers that got a parsed body but never a UID.
    pub fn finish(self) -> Vec<u32> {
        self.pending
            .into_iter()
            .filter(|(_, message)| message.parsed.is_some())
            .map(|(seq, _)| seq)
            .collect()
    }
}
