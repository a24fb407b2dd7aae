//! Per-session lifecycle: drives one connection from negotiation to end.

use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::queue::{ScanQueue, ScanTask};
use crate::config::NotifierConfig;
use crate::error::{ConnectionError, ErrorStage, NotifierError};
use crate::mail::imap::{ConnectionCommand, ConnectionEvent, ConnectionHandle, MailboxStatus};
use crate::mail::parser::Assembler;

use super::diagnostics::{Diagnostic, DiagnosticSink};
use super::scanner::Scanner;
use super::{LifecycleState, NotifierEvent};

type OpenReply = oneshot::Receiver<Result<MailboxStatus, ConnectionError>>;

/// Write side of the shared lifecycle state for one session.
///
/// Once the session is over the cell goes inert, so work left over from an
/// old session can never touch the state of a newer one.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<LifecycleState>>,
    active: Arc<AtomicBool>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl StateCell {
    pub fn new(tx: Arc<watch::Sender<LifecycleState>>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            tx,
            active: Arc::new(AtomicBool::new(true)),
            diagnostics,
        }
    }

    /// A cell not shared with any notifier.
    #[cfg(test)]
    pub fn detached() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Idle);
        Self::new(Arc::new(tx), Arc::new(super::diagnostics::TracingSink))
    }

    pub fn set(&self, to: LifecycleState) {
        self.update(|_| true, to);
    }

    /// Move to `to` only if currently in `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.update(|current| current == from, to)
    }

    /// Final transition; the cell ignores everything afterwards.
    pub fn end(&self) {
        self.set(LifecycleState::Ended);
        self.active.store(false, Ordering::SeqCst);
    }

    fn update(&self, allowed: impl Fn(LifecycleState) -> bool, to: LifecycleState) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }

        let mut from = None;
        self.tx.send_if_modified(|state| {
            if *state == to || !allowed(*state) {
                return false;
            }
            from = Some(*state);
            *state = to;
            true
        });

        match from {
            Some(from) => {
                self.diagnostics
                    .record(Diagnostic::StateChanged { from, to });
                true
            }
            None => false,
        }
    }
}

/// Everything one session needs, moved into its task.
pub(crate) struct Session {
    pub config: NotifierConfig,
    pub assembler: Arc<dyn Assembler>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub events: mpsc::Sender<NotifierEvent>,
    pub state: StateCell,
}

impl Session {
    async fn emit(&self, event: NotifierEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Notifier event dropped, nobody is listening");
        }
    }
}

/// Drive one session until the connection ends.
///
/// `stop` resolving (or its sender going away) requests an orderly logout.
/// Exactly one `End` is emitted, whatever closes the session.
pub(crate) async fn run_session(
    session: Session,
    handle: ConnectionHandle,
    mut stop: oneshot::Receiver<()>,
) {
    let ConnectionHandle {
        cmd_tx,
        mut event_rx,
    } = handle;

    let mut stopping = false;
    let mut open_reply: Option<OpenReply> = None;
    let mut queue: Option<ScanQueue> = None;

    session.state.set(LifecycleState::Connecting);

    loop {
        tokio::select! {
            biased;

            _ = &mut stop, if !stopping => {
                stopping = true;
                tracing::info!("Stopping notifier for {}", session.config.host);
                if cmd_tx.send(ConnectionCommand::Logout).await.is_err() {
                    tracing::debug!("Connection already gone, nothing to log out");
                }
            }

            reply = wait_open(&mut open_reply), if open_reply.is_some() => {
                open_reply = None;
                match reply {
                    Ok(Ok(status)) => {
                        queue = Some(mailbox_opened(&session, &cmd_tx, status));
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Failed to open '{}': {}", session.config.mailbox, e);
                        let err = NotifierError::from_connection(ErrorStage::OpenMailbox, &e);
                        session.emit(NotifierEvent::Error(err)).await;
                    }
                    Err(_) => {
                        let err = NotifierError::from_connection(ErrorStage::OpenMailbox, &ConnectionError::Closed);
                        session.emit(NotifierEvent::Error(err)).await;
                    }
                }
            }

            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Connection event stream ended");
                    break;
                };

                match event {
                    ConnectionEvent::Ready => {
                        session.state.set(LifecycleState::Ready);
                        session.emit(NotifierEvent::Connected).await;

                        if stopping {
                            tracing::debug!("Stop requested, not opening '{}'", session.config.mailbox);
                            continue;
                        }

                        let (reply, rx) = oneshot::channel();
                        let open = ConnectionCommand::OpenMailbox {
                            name: session.config.mailbox.clone(),
                            reply,
                        };
                        if cmd_tx.send(open).await.is_ok() {
                            open_reply = Some(rx);
                        }
                    }
                    ConnectionEvent::Mail { count } => match &queue {
                        Some(queue) => {
                            session.diagnostics.record(Diagnostic::MailNotification { count });
                            // Completion is only of interest to diagnostics
                            drop(queue.push(ScanTask::triggered(count)));
                        }
                        None => {
                            session.diagnostics.record(Diagnostic::NotificationIgnored { count });
                        }
                    },
                    ConnectionEvent::Expunge { seq } => {
                        session.diagnostics.record(Diagnostic::Expunged { seq });
                    }
                    ConnectionEvent::UidValidity(value) => {
                        session.diagnostics.record(Diagnostic::UidValidity(value));
                    }
                    ConnectionEvent::Error(e) => {
                        let err = NotifierError::from_connection(ErrorStage::Connection, &e);
                        session.emit(NotifierEvent::Error(err)).await;
                    }
                    ConnectionEvent::End => break,
                    ConnectionEvent::Close { had_error } => {
                        session.diagnostics.record(Diagnostic::ConnectionClosed { had_error });
                        break;
                    }
                }
            }
        }
    }

    // Tasks already queued still run against the closing connection
    drop(queue);
    session.state.end();
    session.emit(NotifierEvent::End).await;
}

async fn wait_open(
    slot: &mut Option<OpenReply>,
) -> Result<Result<MailboxStatus, ConnectionError>, oneshot::error::RecvError> {
    match slot {
        Some(rx) => rx.await,
        None => pending().await,
    }
}

/// Mailbox is open: start the scan queue and queue the initial scan.
fn mailbox_opened(
    session: &Session,
    cmd_tx: &mpsc::Sender<ConnectionCommand>,
    status: MailboxStatus,
) -> ScanQueue {
    session.state.set(LifecycleState::BoxOpen);
    session.diagnostics.record(Diagnostic::MailboxOpened {
        mailbox: session.config.mailbox.clone(),
        exists: status.exists,
    });

    let scanner = Scanner {
        cmd_tx: cmd_tx.clone(),
        assembler: session.assembler.clone(),
        criteria: session.config.search_criteria(),
        mark_seen: session.config.mark_seen,
        mailbox: session.config.mailbox.clone(),
        events: session.events.clone(),
        diagnostics: session.diagnostics.clone(),
        state: session.state.clone(),
    };
    let queue = ScanQueue::spawn(scanner, session.diagnostics.clone());

    session.state.set(LifecycleState::Watching);
    drop(queue.push(ScanTask::initial()));
    queue
}
