//! Diagnostic hooks: what the notifier is doing, for logging or inspection.

use crate::actor::queue::ScanReport;
use crate::error::NotifierError;

use super::LifecycleState;

/// Something worth knowing about that is not a consumer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    MailboxOpened {
        mailbox: String,
        exists: u32,
    },
    /// Server reported new messages; a scan was queued
    MailNotification { count: u32 },
    /// Mail notification before the mailbox was open; not scanned
    NotificationIgnored { count: u32 },
    UidValidity(u32),
    Expunged { seq: u32 },
    ScanStarted { label: String },
    ScanFinished {
        label: String,
        result: Result<ScanReport, NotifierError>,
    },
    /// Search matched nothing
    NoNewMail { mailbox: String },
    MailFound {
        uid: u32,
        message_id: Option<String>,
    },
    /// Fetched message never got a UID and was not delivered
    MissingUid { seq: u32 },
    QueueDrained,
    ConnectionClosed { had_error: bool },
}

/// Receives diagnostics from a running notifier.
pub trait DiagnosticSink: Send + Sync + 'static {
    fn record(&self, diagnostic: Diagnostic);
}

/// Default sink: forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::StateChanged { from, to } => {
                tracing::debug!("notifier state {:?} -> {:?}", from, to);
            }
            Diagnostic::MailboxOpened { mailbox, exists } => {
                tracing::info!("opened '{}' ({} messages)", mailbox, exists);
            }
            Diagnostic::MailNotification { count } => {
                tracing::debug!("mail event: {} new", count);
            }
            Diagnostic::NotificationIgnored { count } => {
                tracing::debug!("mail event before mailbox open ignored ({} new)", count);
            }
            Diagnostic::UidValidity(value) => tracing::debug!("new uidvalidity: {}", value),
            Diagnostic::Expunged { seq } => tracing::debug!("message {} expunged", seq),
            Diagnostic::ScanStarted { label } => tracing::debug!("process queue {}", label),
            Diagnostic::ScanFinished { label, result } => match result {
                Ok(report) => tracing::debug!(
                    "finished processing {}: {} found, {} delivered",
                    label,
                    report.found,
                    report.delivered
                ),
                Err(e) => tracing::debug!("finished processing {} with error: {}", label, e),
            },
            Diagnostic::NoNewMail { mailbox } => tracing::debug!("no new mail in {}", mailbox),
            Diagnostic::MailFound { uid, message_id } => {
                tracing::debug!("found mail uid {} ({:?})", uid, message_id);
            }
            Diagnostic::MissingUid { seq } => {
                tracing::warn!("message {} arrived without a UID, not delivered", seq);
            }
            Diagnostic::QueueDrained => tracing::debug!("all items have been processed"),
            Diagnostic::ConnectionClosed { had_error } => {
                tracing::info!(
                    "connection closed: {}",
                    if had_error { "errored" } else { "normal" }
                );
            }
        }
    }
}
