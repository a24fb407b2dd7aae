//! One scan: search, fetch the matches, assemble and emit them.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::actor::queue::{ScanReport, ScanResult, ScanTask, ScanWorker};
use crate::constants::FETCH_EVENT_CAPACITY;
use crate::error::{ConnectionError, ErrorStage, NotifierError};
use crate::mail::imap::{ConnectionCommand, FetchEvent};
use crate::mail::parser::Assembler;
use crate::mail::types::Mail;

use super::assembly::MessageAssembly;
use super::diagnostics::{Diagnostic, DiagnosticSink};
use super::lifecycle::StateCell;
use super::{LifecycleState, NotifierEvent};

/// Runs scans against one connection. Owned by that session's scan queue.
pub(crate) struct Scanner {
    pub cmd_tx: mpsc::Sender<ConnectionCommand>,
    pub assembler: Arc<dyn Assembler>,
    pub criteria: String,
    pub mark_seen: bool,
    pub mailbox: String,
    pub events: mpsc::Sender<NotifierEvent>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub state: StateCell,
}

impl Scanner {
    /// Search with the configured criteria and emit every complete match.
    ///
    /// Mail events go out as messages complete; the returned error (if any)
    /// comes after them.
    pub async fn scan(&self) -> ScanResult {
        let uids = self.search().await?;
        let mut report = ScanReport {
            found: uids.len(),
            ..ScanReport::default()
        };

        if uids.is_empty() {
            self.diagnostics.record(Diagnostic::NoNewMail {
                mailbox: self.mailbox.clone(),
            });
            return Ok(report);
        }

        let (events_tx, mut fetch_rx) = mpsc::channel(FETCH_EVENT_CAPACITY);
        self.cmd_tx
            .send(ConnectionCommand::Fetch {
                uids,
                mark_seen: self.mark_seen,
                events: events_tx,
            })
            .await
            .map_err(|_| NotifierError::from_connection(ErrorStage::Fetch, &ConnectionError::Closed))?;

        let mut assembly = MessageAssembly::new(self.assembler.as_ref());

        loop {
            let Some(event) = fetch_rx.recv().await else {
                return Err(NotifierError::new(
                    ErrorStage::Fetch,
                    "connection closed during fetch",
                ));
            };

            match event {
                FetchEvent::Message { seq } => assembly.announce(seq),
                FetchEvent::Attributes { seq, uid, flags } => {
                    if let Some(mail) = assembly.identify(seq, uid, flags) {
                        self.emit(mail).await;
                        report.delivered += 1;
                    }
                }
                FetchEvent::Body { seq, raw } => match assembly.deliver(seq, &raw) {
                    Ok(Some(mail)) => {
                        self.emit(mail).await;
                        report.delivered += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.skipped += 1;
                        let err =
                            NotifierError::new(ErrorStage::Parse, format!("message {}: {}", seq, e));
                        self.events.send(NotifierEvent::Error(err)).await.ok();
                    }
                },
                FetchEvent::Error(e) => {
                    return Err(NotifierError::from_connection(ErrorStage::Fetch, &e));
                }
                FetchEvent::End => break,
            }
        }

        for seq in assembly.finish() {
            self.diagnostics.record(Diagnostic::MissingUid { seq });
            report.skipped += 1;
        }

        Ok(report)
    }

    async fn search(&self) -> Result<Vec<u32>, NotifierError> {
        let closed = || NotifierError::from_connection(ErrorStage::Search, &ConnectionError::Closed);

        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(ConnectionCommand::Search {
                criteria: self.criteria.clone(),
                reply,
            })
            .await
            .map_err(|_| closed())?;

        response
            .await
            .map_err(|_| closed())?
            .map_err(|e| NotifierError::from_connection(ErrorStage::Search, &e))
    }

    async fn emit(&self, mail: Mail) {
        self.diagnostics.record(Diagnostic::MailFound {
            uid: mail.uid,
            message_id: mail.message.message_id.clone(),
        });
        if self.events.send(NotifierEvent::Mail(mail)).await.is_err() {
            tracing::debug!("Mail dropped, nobody is listening");
        }
    }
}

impl ScanWorker for Scanner {
    async fn run(&mut self, _task: &ScanTask) -> ScanResult {
        self.state
            .transition(LifecycleState::Watching, LifecycleState::Scanning);
        let result = self.scan().await;
        self.state
            .transition(LifecycleState::Scanning, LifecycleState::Watching);

        if let Err(e) = &result {
            self.events.send(NotifierEvent::Error(e.clone())).await.ok();
        }
        result
    }
}
