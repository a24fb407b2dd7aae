use mail_parser::{MessageParser, MimeHeaders, PartType};

use crate::error::AssembleError;

use super::types::{Address, Attachment, MessageFlags, ParsedMessage, SystemFlags};

/// Turns the raw bytes of one fetched message into a `ParsedMessage`.
///
/// Implementations know nothing about uids or flags; those are attached by the scanner.
pub trait Assembler: Send + Sync + 'static {
    fn assemble(&self, raw: &[u8]) -> Result<ParsedMessage, AssembleError>;
}

/// `Assembler` backed by `mail-parser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MailParserAssembler;

impl Assembler for MailParserAssembler {
    fn assemble(&self, raw: &[u8]) -> Result<ParsedMessage, AssembleError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(AssembleError::Empty);
        }
        parse_message(raw).ok_or(AssembleError::Unparseable)
    }
}

pub fn parse_message(raw: &[u8]) -> Option<ParsedMessage> {
    let message = MessageParser::default().parse(raw)?;

    let addresses = |addrs: Option<&mail_parser::Address>| -> Vec<Address> {
        addrs
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|addr| Address {
                        name: addr.name().map(|s| s.to_string()),
                        address: addr.address().map(|s| s.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let raw_message = message.raw_message();
    let headers = message
        .headers()
        .iter()
        .map(|header| {
            let start = header.offset_start as usize;
            let end = (header.offset_end as usize).min(raw_message.len());
            let value = raw_message.get(start..end).unwrap_or_default();
            (
                header.name().to_string(),
                String::from_utf8_lossy(value).trim().to_string(),
            )
        })
        .collect();

    let date = message
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    let in_reply_to = message
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()));

    let references: Vec<String> = message
        .references()
        .as_text_list()
        .map(|ids| ids.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    Some(ParsedMessage {
        message_id: message.message_id().map(|s| s.to_string()),
        subject: message.subject().map(|s| s.to_string()),
        from: addresses(message.from()),
        to: addresses(message.to()),
        cc: addresses(message.cc()),
        reply_to: addresses(message.reply_to()),
        date,
        headers,
        text: extract_text_body(&message),
        html: extract_html_body(&message),
        attachments: extract_attachments(&message),
        in_reply_to,
        references,
    })
}

fn extract_text_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    // Fallback: first text part that isn't explicitly something other than plain
    for part in message.parts.iter() {
        if let PartType::Text(text) = &part.body {
            let content_type = part.content_type();
            if content_type
                .map(|ct| ct.subtype() == Some("plain"))
                .unwrap_or(true)
            {
                return Some(text.to_string());
            }
        }
    }

    None
}

fn extract_html_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }

    None
}

fn extract_attachments(message: &mail_parser::Message) -> Vec<Attachment> {
    message
        .attachments()
        .map(|part| {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            Attachment {
                filename: part.attachment_name().map(|s| s.to_string()),
                content_type,
                content: part.contents().to_vec(),
            }
        })
        .collect()
}

pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> MessageFlags {
    use async_imap::types::Flag;

    let mut result = MessageFlags::default();

    for flag in flags {
        match flag {
            Flag::Seen => result.system |= SystemFlags::SEEN,
            Flag::Answered => result.system |= SystemFlags::ANSWERED,
            Flag::Flagged => result.system |= SystemFlags::FLAGGED,
            Flag::Deleted => result.system |= SystemFlags::DELETED,
            Flag::Draft => result.system |= SystemFlags::DRAFT,
            Flag::Recent => result.system |= SystemFlags::RECENT,
            Flag::Custom(name) => {
                result.keywords.insert(name.to_string());
            }
            _ => {}
        }
    }

    result
}
