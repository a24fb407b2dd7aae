//! Scripted connection for driving a notifier without a network.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::config::NotifierConfig;
use crate::constants::{CONNECTION_COMMAND_CAPACITY, CONNECTION_EVENT_CAPACITY};
use crate::error::ConnectionError;
use crate::mail::imap::{
    ConnectionCommand, ConnectionEvent, ConnectionHandle, Connector, FetchEvent, MailboxStatus,
};
use crate::mail::types::MessageFlags;

use super::NotifierEvent;

const STEP: Duration = Duration::from_secs(2);

/// Hands every connection attempt to the test as a `FakeServer`.
pub(crate) struct FakeConnector {
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl FakeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Self { servers }, rx)
    }
}

impl Connector for FakeConnector {
    fn connect(&self, config: &NotifierConfig) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CONNECTION_COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CONNECTION_EVENT_CAPACITY);
        self.servers
            .send(FakeServer {
                config: config.clone(),
                cmd_rx,
                event_tx,
            })
            .ok();
        ConnectionHandle { cmd_tx, event_rx }
    }
}

/// The server side of one fake connection.
pub(crate) struct FakeServer {
    pub config: NotifierConfig,
    cmd_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

/// One message as the fake server serves it: sequence number, uid, raw body.
pub(crate) type Served = (u32, Option<u32>, Vec<u8>);

impl FakeServer {
    pub async fn accept(servers: &mut mpsc::UnboundedReceiver<FakeServer>) -> FakeServer {
        tokio::time::timeout(STEP, servers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    pub async fn send(&self, event: ConnectionEvent) {
        self.event_tx.send(event).await.expect("session gone");
    }

    /// Like `send`, for when the session may already be gone.
    pub async fn offer(&self, event: ConnectionEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }

    pub async fn next_command(&mut self) -> ConnectionCommand {
        tokio::time::timeout(STEP, self.cmd_rx.recv())
            .await
            .expect("no command arrived")
            .expect("command channel closed")
    }

    /// Nothing is waiting right now, after giving the session a moment.
    pub async fn assert_no_command(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        match self.cmd_rx.try_recv() {
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            Ok(cmd) => panic!("unexpected command {cmd:?}"),
        }
    }

    /// Answer an open request; returns the mailbox name asked for.
    pub async fn serve_open(&mut self, exists: u32) -> String {
        match self.next_command().await {
            ConnectionCommand::OpenMailbox { name, reply } => {
                reply
                    .send(Ok(MailboxStatus {
                        exists,
                        uid_validity: Some(1),
                    }))
                    .ok();
                name
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    pub async fn fail_open(&mut self, err: ConnectionError) {
        match self.next_command().await {
            ConnectionCommand::OpenMailbox { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    /// Answer a search; returns the criteria used.
    pub async fn serve_search(&mut self, ids: Vec<u32>) -> String {
        match self.next_command().await {
            ConnectionCommand::Search { criteria, reply } => {
                reply.send(Ok(ids)).ok();
                criteria
            }
            other => panic!("expected search, got {other:?}"),
        }
    }

    pub async fn fail_search(&mut self, err: ConnectionError) {
        match self.next_command().await {
            ConnectionCommand::Search { reply, .. } => {
                reply.send(Err(err)).ok();
            }
            other => panic!("expected search, got {other:?}"),
        }
    }

    /// Take a fetch request: the requested UIDs, the mark-seen flag and the
    /// channel to play results into.
    pub async fn expect_fetch(&mut self) -> (Vec<u32>, bool, mpsc::Sender<FetchEvent>) {
        match self.next_command().await {
            ConnectionCommand::Fetch {
                uids,
                mark_seen,
                events,
            } => (uids, mark_seen, events),
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    /// Serve a whole fetch in protocol order, ending with `End`.
    pub async fn serve_fetch(&mut self, messages: Vec<Served>) -> bool {
        let (_, mark_seen, events) = self.expect_fetch().await;
        play(&events, messages).await;
        events.send(FetchEvent::End).await.ok();
        mark_seen
    }

    pub async fn expect_logout(&mut self) {
        match self.next_command().await {
            ConnectionCommand::Logout => {}
            other => panic!("expected logout, got {other:?}"),
        }
    }
}

/// Send identity then body for each message.
pub(crate) async fn play(events: &mpsc::Sender<FetchEvent>, messages: Vec<Served>) {
    for (seq, uid, raw) in messages {
        let script = [
            FetchEvent::Message { seq },
            FetchEvent::Attributes {
                seq,
                uid,
                flags: MessageFlags::from_names(["\\Recent"]),
            },
            FetchEvent::Body { seq, raw },
        ];
        for event in script {
            events.send(event).await.ok();
        }
    }
}

pub(crate) fn raw_message(subject: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: bob@example.com\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{id}@example.com>\r\n\
         Date: Mon, 19 Oct 2026 10:00:00 +0000\r\n\
         \r\n\
         Hello from {subject}\r\n",
        id = subject.replace(' ', "-"),
    )
    .into_bytes()
}

pub(crate) async fn next_event(rx: &mut mpsc::Receiver<NotifierEvent>) -> NotifierEvent {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("no notifier event")
        .expect("event channel closed")
}

pub(crate) async fn assert_no_event(rx: &mut mpsc::Receiver<NotifierEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected event {event:?}");
    }
}
