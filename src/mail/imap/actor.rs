//! Connection actor: owns one IMAP session, serves commands and reports
//! lifecycle and mailbox-change events.

use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use tokio::sync::mpsc;

use crate::constants::{
    CONNECTION_COMMAND_CAPACITY, CONNECTION_EVENT_CAPACITY, IDLE_TIMEOUT_SECS, NOOP_POLL_SECS,
};
use crate::error::ConnectionError;

use super::client::MailboxChange;
use super::{ConnectionCommand, ConnectionEvent, ConnectionHandle, FetchEvent, ImapClient};

/// Spawn the connection actor and return a handle to control it.
/// The actor connects immediately and reports `Ready` once authenticated.
pub fn spawn_connection(client: ImapClient) -> ConnectionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CONNECTION_COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CONNECTION_EVENT_CAPACITY);

    tokio::spawn(connection_actor(client, cmd_rx, event_tx));

    ConnectionHandle { cmd_tx, event_rx }
}

enum Flow {
    Continue,
    Shutdown,
}

enum IdleOutcome {
    Command(Option<ConnectionCommand>),
    Refresh,
}

/// Tracks the EXISTS count of the open mailbox to turn growth into `Mail` events.
#[derive(Debug, Default)]
struct ExistsTracker {
    known: Option<u32>,
}

impl ExistsTracker {
    fn open(&mut self, exists: u32) {
        self.known = Some(exists);
    }

    fn is_open(&self) -> bool {
        self.known.is_some()
    }

    fn apply(&mut self, change: MailboxChange) -> Option<ConnectionEvent> {
        let known = self.known.as_mut()?;
        match change {
            MailboxChange::Exists(n) => {
                let previous = *known;
                *known = n;
                (n > previous).then(|| ConnectionEvent::Mail { count: n - previous })
            }
            MailboxChange::Expunge(seq) => {
                *known = known.saturating_sub(1);
                Some(ConnectionEvent::Expunge { seq })
            }
        }
    }
}

async fn connection_actor(
    mut client: ImapClient,
    mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let send_event = |event: ConnectionEvent| {
        let event_tx = event_tx.clone();
        async move {
            if let Err(e) = event_tx.send(event).await {
                tracing::debug!("Connection event dropped: {}", e);
            }
        }
    };

    // Connect, unless told to go away first
    tokio::select! {
        result = client.connect() => {
            if let Err(e) = result {
                tracing::warn!("Connection to {} failed: {}", client.config.host, e);
                send_event(ConnectionEvent::Error(e)).await;
                send_event(ConnectionEvent::Close { had_error: true }).await;
                return;
            }
            send_event(ConnectionEvent::Ready).await;
        }
        cmd = cmd_rx.recv() => {
            tracing::info!("Connection abandoned before ready");
            if let Some(cmd) = cmd {
                reject(cmd).await;
            }
            send_event(ConnectionEvent::End).await;
            send_event(ConnectionEvent::Close { had_error: false }).await;
            return;
        }
    }

    let mut tracker = ExistsTracker::default();

    loop {
        let next = if tracker.is_open() && client.has_idle {
            idle_until_command(&mut client, &mut cmd_rx, &mut tracker, &event_tx).await
        } else {
            poll_until_command(&mut client, &mut cmd_rx).await
        };

        let flow = match next {
            Ok(IdleOutcome::Refresh) => Ok(Flow::Continue),
            Ok(IdleOutcome::Command(Some(cmd))) => {
                handle_command(&mut client, cmd, &mut tracker, &event_tx).await
            }
            Ok(IdleOutcome::Command(None)) => {
                tracing::info!("Command channel closed, shutting down");
                Ok(Flow::Shutdown)
            }
            Err(e) => Err(e),
        };

        match flow {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => {
                let had_error = match client.disconnect().await {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::debug!("LOGOUT failed: {}", e);
                        true
                    }
                };
                send_event(ConnectionEvent::End).await;
                send_event(ConnectionEvent::Close { had_error }).await;
                break;
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!("Connection lost: {}", e);
                send_event(ConnectionEvent::Error(e)).await;
                send_event(ConnectionEvent::Close { had_error: true }).await;
                break;
            }
            Err(e) => tracing::debug!("Command failed: {}", e),
        }

        for change in client.drain_changes() {
            if let Some(event) = tracker.apply(change) {
                send_event(event).await;
            }
        }
    }

    // Fail whatever was queued behind the shutdown
    cmd_rx.close();
    while let Some(cmd) = cmd_rx.recv().await {
        reject(cmd).await;
    }
}

/// Wait for a command without IDLE, sending NOOP now and then so the server
/// gets a chance to report new messages.
async fn poll_until_command(
    client: &mut ImapClient,
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
) -> Result<IdleOutcome, ConnectionError> {
    tokio::select! {
        cmd = cmd_rx.recv() => Ok(IdleOutcome::Command(cmd)),
        _ = tokio::time::sleep(Duration::from_secs(NOOP_POLL_SECS)), if client.is_connected() => {
            client.noop().await?;
            Ok(IdleOutcome::Refresh)
        }
    }
}

/// Sit in IDLE until the server reports something or a command arrives.
async fn idle_until_command(
    client: &mut ImapClient,
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
    tracker: &mut ExistsTracker,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<IdleOutcome, ConnectionError> {
    let session = client.take_session().ok_or(ConnectionError::Closed)?;

    let mut idle = session.idle();
    if let Err(e) = idle.init().await {
        tracing::warn!("Failed to init IDLE: {:?}", e);
        if let Ok(session) = idle.done().await {
            client.restore_session(session);
        }
        return Err(e.into());
    }

    tracing::debug!("IDLE started, waiting for notifications...");

    let (idle_future, stop_source) =
        idle.wait_with_timeout(Duration::from_secs(IDLE_TIMEOUT_SECS));

    tokio::select! {
        result = idle_future => {
            let session = idle.done().await?;
            client.restore_session(session);

            match result? {
                IdleResponse::NewData(data) => {
                    let change = match data.parsed() {
                        Response::MailboxData(MailboxDatum::Exists(n)) => Some(MailboxChange::Exists(*n)),
                        Response::Expunge(seq) => Some(MailboxChange::Expunge(*seq)),
                        _ => None,
                    };
                    if let Some(event) = change.and_then(|c| tracker.apply(c)) {
                        tracing::info!("IDLE: {:?}", event);
                        event_tx.send(event).await.ok();
                    }
                }
                IdleResponse::Timeout => tracing::debug!("IDLE timeout, refreshing..."),
                IdleResponse::ManualInterrupt => tracing::debug!("IDLE interrupted"),
            }
            Ok(IdleOutcome::Refresh)
        }

        cmd = cmd_rx.recv() => {
            // Drop stop_source to interrupt IDLE immediately
            drop(stop_source);
            let session = idle.done().await?;
            client.restore_session(session);
            Ok(IdleOutcome::Command(cmd))
        }
    }
}

async fn handle_command(
    client: &mut ImapClient,
    cmd: ConnectionCommand,
    tracker: &mut ExistsTracker,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<Flow, ConnectionError> {
    match cmd {
        ConnectionCommand::OpenMailbox { name, reply } => {
            match client.select_mailbox(&name).await {
                Ok(status) => {
                    tracker.open(status.exists);
                    if let Some(validity) = status.uid_validity {
                        event_tx
                            .send(ConnectionEvent::UidValidity(validity))
                            .await
                            .ok();
                    }
                    reply.send(Ok(status)).ok();
                    Ok(Flow::Continue)
                }
                Err(e) => {
                    reply.send(Err(e.clone())).ok();
                    Err(e)
                }
            }
        }
        ConnectionCommand::Search { criteria, reply } => match client.search(&criteria).await {
            Ok(ids) => {
                reply.send(Ok(ids)).ok();
                Ok(Flow::Continue)
            }
            Err(e) => {
                reply.send(Err(e.clone())).ok();
                Err(e)
            }
        },
        ConnectionCommand::Fetch {
            uids,
            mark_seen,
            events,
        } => match client.fetch_messages(&uids, mark_seen, &events).await {
            Ok(_) => {
                events.send(FetchEvent::End).await.ok();
                Ok(Flow::Continue)
            }
            Err(e) => {
                events.send(FetchEvent::Error(e.clone())).await.ok();
                Err(e)
            }
        },
        ConnectionCommand::Logout => Ok(Flow::Shutdown),
    }
}

/// Answer a command that will never run.
async fn reject(cmd: ConnectionCommand) {
    match cmd {
        ConnectionCommand::OpenMailbox { reply, .. } => {
            reply.send(Err(ConnectionError::Closed)).ok();
        }
        ConnectionCommand::Search { reply, .. } => {
            reply.send(Err(ConnectionError::Closed)).ok();
        }
        ConnectionCommand::Fetch { events, .. } => {
            events
                .send(FetchEvent::Error(ConnectionError::Closed))
                .await
                .ok();
        }
        ConnectionCommand::Logout => {}
    }
}
