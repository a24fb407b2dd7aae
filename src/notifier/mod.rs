//! Consumer-facing notifier: start/stop a watch session and receive events.
//!
//! This module is split into:
//! - `mod.rs` - `Notifier` facade, consumer events and lifecycle states
//! - `lifecycle.rs` - Per-session state machine over one connection
//! - `scanner.rs` - Search/fetch pass run by the scan queue
//! - `assembly.rs` - Per-message accumulator binding uid/flags to parsed bodies
//! - `diagnostics.rs` - Diagnostic hooks and the tracing sink

mod assembly;
pub mod diagnostics;
mod lifecycle;
mod scanner;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::NotifierConfig;
use crate::constants::NOTIFIER_EVENT_CAPACITY;
use crate::error::NotifierError;
use crate::mail::imap::{Connector, ImapConnector};
use crate::mail::parser::{Assembler, MailParserAssembler};
use crate::mail::types::Mail;

pub use assembly::{InFlightMessage, MessageAssembly};
pub use diagnostics::{Diagnostic, DiagnosticSink, TracingSink};

use lifecycle::{Session, StateCell, run_session};

/// Where a notifier session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    /// Never started
    #[default]
    Idle,
    /// Connection negotiating
    Connecting,
    /// Authenticated, mailbox not open yet
    Ready,
    BoxOpen,
    /// Waiting for mailbox changes
    Watching,
    /// A scan is running
    Scanning,
    /// Session over; `start()` begins a new one
    Ended,
}

/// Events delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Connected,
    Mail(Mail),
    Error(NotifierError),
    End,
}

struct RunningSession {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Watches one mailbox and reports new mail.
///
/// ```ignore
/// let (mut notifier, mut events) = Notifier::new(config);
/// notifier.start();
/// while let Some(event) = events.recv().await {
///     if let NotifierEvent::Mail(mail) = event {
///         println!("{} {}", mail.uid, mail.subject());
///     }
/// }
/// ```
pub struct Notifier {
    config: NotifierConfig,
    connector: Arc<dyn Connector>,
    assembler: Arc<dyn Assembler>,
    diagnostics: Arc<dyn DiagnosticSink>,
    events: mpsc::Sender<NotifierEvent>,
    state: Arc<watch::Sender<LifecycleState>>,
    session: Option<RunningSession>,
}

impl Notifier {
    /// Create a notifier and the receiver its events arrive on.
    pub fn new(config: NotifierConfig) -> (Self, mpsc::Receiver<NotifierEvent>) {
        let (events, rx) = mpsc::channel(NOTIFIER_EVENT_CAPACITY);
        let (state, _) = watch::channel(LifecycleState::Idle);

        let notifier = Self {
            config,
            connector: Arc::new(ImapConnector),
            assembler: Arc::new(MailParserAssembler),
            diagnostics: Arc::new(TracingSink),
            events,
            state: Arc::new(state),
            session: None,
        };
        (notifier, rx)
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn with_assembler(mut self, assembler: impl Assembler) -> Self {
        self.assembler = Arc::new(assembler);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Changes take effect on the next `start()`.
    pub fn config_mut(&mut self) -> &mut NotifierConfig {
        &mut self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Open a new connection and start watching. Must be called from within
    /// a tokio runtime. Ignored unless the notifier is `Idle` or `Ended`.
    pub fn start(&mut self) {
        if !matches!(self.state(), LifecycleState::Idle | LifecycleState::Ended) {
            tracing::warn!("Notifier already running, start ignored");
            return;
        }

        let state = StateCell::new(self.state.clone(), self.diagnostics.clone());
        state.set(LifecycleState::Idle);
        state.set(LifecycleState::Connecting);

        tracing::info!(
            "Watching {}@{}:{} '{}'",
            self.config.user,
            self.config.host,
            self.config.port,
            self.config.mailbox
        );
        let handle = self.connector.connect(&self.config);
        let session = Session {
            config: self.config.clone(),
            assembler: self.assembler.clone(),
            diagnostics: self.diagnostics.clone(),
            events: self.events.clone(),
            state,
        };

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(session, handle, stop_rx));
        self.session = Some(RunningSession {
            stop: Some(stop),
            task,
        });
    }

    /// Ask the current session to log out. `End` follows once the connection
    /// is gone. Queued scans are left to finish or fail on their own.
    pub fn stop(&mut self) {
        if let Some(stop) = self.session.as_mut().and_then(|s| s.stop.take()) {
            // Session already over if the receiver is gone
            stop.send(()).ok();
        }
    }

    /// Wait for the current session, if any, to end.
    pub async fn wait(&mut self) {
        if let Some(session) = self.session.as_mut()
            && let Err(e) = (&mut session.task).await
        {
            tracing::error!("Notifier session task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::diagnostics::recording::RecordingSink;
    use super::testing::{
        FakeConnector, FakeServer, assert_no_event, next_event, play, raw_message,
    };
    use super::*;
    use crate::error::{ConnectionError, ErrorStage};
    use crate::mail::imap::{ConnectionCommand, ConnectionEvent, FetchEvent, MailboxStatus};

    struct Setup {
        notifier: Notifier,
        events: mpsc::Receiver<NotifierEvent>,
        servers: mpsc::UnboundedReceiver<FakeServer>,
        sink: Arc<RecordingSink>,
    }

    fn setup_with(config: NotifierConfig) -> Setup {
        let (connector, servers) = FakeConnector::new();
        let sink = Arc::new(RecordingSink::default());
        let (notifier, events) = Notifier::new(config);
        let notifier = notifier
            .with_connector(connector)
            .with_diagnostics(sink.clone());
        Setup {
            notifier,
            events,
            servers,
            sink,
        }
    }

    fn setup() -> Setup {
        setup_with(NotifierConfig::new("imap.example.com", "me", "secret"))
    }

    /// Start, become ready and open the mailbox.
    async fn open(s: &mut Setup, exists: u32) -> FakeServer {
        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;
        server.send(ConnectionEvent::Ready).await;
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::Connected);
        server.serve_open(exists).await;
        server
    }

    async fn wait_for_state(notifier: &Notifier, target: LifecycleState) {
        let mut rx = notifier.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn expect_mail(event: NotifierEvent) -> Mail {
        match event {
            NotifierEvent::Mail(mail) => mail,
            other => panic!("expected mail, got {other:?}"),
        }
    }

    fn expect_error(event: NotifierEvent) -> NotifierError {
        match event {
            NotifierEvent::Error(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_three_unseen_messages() {
        let mut s = setup();
        let mut server = open(&mut s, 3).await;

        assert_eq!(server.serve_search(vec![1, 2, 3]).await, "UNSEEN");
        server
            .serve_fetch(vec![
                (1, Some(101), raw_message("one")),
                (2, Some(102), raw_message("two")),
                (3, Some(103), raw_message("three")),
            ])
            .await;

        for (uid, subject) in [(101, "one"), (102, "two"), (103, "three")] {
            let mail = expect_mail(next_event(&mut s.events).await);
            assert_eq!(mail.uid, uid);
            assert_eq!(mail.subject(), subject);
            assert!(mail.flags.contains("\\Recent"));
        }
        assert_no_event(&mut s.events).await;
        wait_for_state(&s.notifier, LifecycleState::Watching).await;
    }

    #[tokio::test]
    async fn test_no_matching_messages() {
        let mut s = setup();
        let mut server = open(&mut s, 0).await;

        server.serve_search(vec![]).await;
        server.assert_no_command().await;
        assert_no_event(&mut s.events).await;
        assert_eq!(
            s.sink
                .count(|d| matches!(d, Diagnostic::NoNewMail { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let mut s = setup();
        s.notifier.start();
        let server = FakeServer::accept(&mut s.servers).await;

        server
            .send(ConnectionEvent::Error(ConnectionError::Auth(
                "invalid credentials".into(),
            )))
            .await;
        server
            .send(ConnectionEvent::Close { had_error: true })
            .await;

        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Connection);
        assert!(err.message().contains("invalid credentials"));
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        assert_no_event(&mut s.events).await;
        assert_eq!(s.notifier.state(), LifecycleState::Ended);
    }

    #[tokio::test]
    async fn test_open_mailbox_failure_stops_there() {
        let mut s = setup();
        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;
        server.send(ConnectionEvent::Ready).await;
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::Connected);

        server
            .fail_open(ConnectionError::Protocol("no such mailbox".into()))
            .await;

        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::OpenMailbox);
        server.assert_no_command().await;
        assert_eq!(s.notifier.state(), LifecycleState::Ready);

        // Change notifications without an open mailbox do nothing
        server.send(ConnectionEvent::Mail { count: 1 }).await;
        server.assert_no_command().await;
    }

    #[tokio::test]
    async fn test_notifications_queue_one_scan_each_in_order() {
        let mut s = setup();
        let mut server = open(&mut s, 5).await;

        // Initial scan is in flight; two changes arrive meanwhile
        let first = server.next_command().await;
        server.send(ConnectionEvent::Mail { count: 1 }).await;
        server.send(ConnectionEvent::Mail { count: 2 }).await;
        server.assert_no_command().await;

        match first {
            ConnectionCommand::Search { reply, .. } => reply.send(Ok(vec![])).unwrap(),
            other => panic!("expected search, got {other:?}"),
        }
        server.serve_search(vec![]).await;
        server.assert_no_command().await;
        server.serve_search(vec![]).await;
        server.assert_no_command().await;

        let labels: Vec<String> = s
            .sink
            .records()
            .into_iter()
            .filter_map(|d| match d {
                Diagnostic::ScanStarted { label } => Some(label),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["scan initial", "scan 1", "scan 2"]);
        assert_no_event(&mut s.events).await;
    }

    #[tokio::test]
    async fn test_fetch_error_after_some_messages() {
        let mut s = setup();
        let mut server = open(&mut s, 3).await;

        server.serve_search(vec![1, 2, 3]).await;
        let (uids, _, events) = server.expect_fetch().await;
        assert_eq!(uids, vec![1, 2, 3]);
        play(
            &events,
            vec![
                (1, Some(11), raw_message("first")),
                (2, Some(12), raw_message("second")),
            ],
        )
        .await;
        events
            .send(FetchEvent::Error(ConnectionError::Io("reset".into())))
            .await
            .unwrap();

        assert_eq!(expect_mail(next_event(&mut s.events).await).uid, 11);
        assert_eq!(expect_mail(next_event(&mut s.events).await).uid, 12);
        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Fetch);
        assert_no_event(&mut s.events).await;
    }

    #[tokio::test]
    async fn test_expunge_between_search_and_fetch_keeps_uids() {
        let mut s = setup();
        let mut server = open(&mut s, 3).await;

        server.serve_search(vec![102, 103]).await;
        // Message 1 goes away; 102 and 103 move down to sequence numbers 1 and 2
        server.send(ConnectionEvent::Expunge { seq: 1 }).await;

        let (uids, _, events) = server.expect_fetch().await;
        assert_eq!(uids, vec![102, 103]);
        play(
            &events,
            vec![
                (1, Some(102), raw_message("second")),
                (2, Some(103), raw_message("third")),
            ],
        )
        .await;
        events.send(FetchEvent::End).await.unwrap();

        for (uid, subject) in [(102, "second"), (103, "third")] {
            let mail = expect_mail(next_event(&mut s.events).await);
            assert_eq!(mail.uid, uid);
            assert_eq!(mail.subject(), subject);
        }
        assert_no_event(&mut s.events).await;
        assert!(s.sink.records().contains(&Diagnostic::Expunged { seq: 1 }));
    }

    #[tokio::test]
    async fn test_search_error_does_not_stop_later_scans() {
        let mut s = setup();
        let mut server = open(&mut s, 1).await;

        server
            .fail_search(ConnectionError::Protocol("BAD search".into()))
            .await;
        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Search);

        server.send(ConnectionEvent::Mail { count: 1 }).await;
        server.serve_search(vec![4]).await;
        server
            .serve_fetch(vec![(4, Some(44), raw_message("after error"))])
            .await;
        assert_eq!(expect_mail(next_event(&mut s.events).await).uid, 44);
    }

    #[tokio::test]
    async fn test_config_reaches_the_connection() {
        let mut config = NotifierConfig::new("imap.example.com", "me", "secret");
        config.mailbox = "Work".to_string();
        config.search = vec!["UNSEEN".to_string(), "FROM \"boss\"".to_string()];
        config.mark_seen = false;
        let mut s = setup_with(config);

        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;
        assert_eq!(server.config.mailbox, "Work");
        server.send(ConnectionEvent::Ready).await;
        next_event(&mut s.events).await;

        assert_eq!(server.serve_open(1).await, "Work");
        assert_eq!(
            server.serve_search(vec![1]).await,
            "UNSEEN FROM \"boss\""
        );
        let mark_seen = server
            .serve_fetch(vec![(1, Some(1), raw_message("boss"))])
            .await;
        assert!(!mark_seen);
    }

    #[tokio::test]
    async fn test_notification_before_open_is_ignored() {
        let mut s = setup();
        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;
        server.send(ConnectionEvent::Ready).await;
        next_event(&mut s.events).await;

        let reply = match server.next_command().await {
            ConnectionCommand::OpenMailbox { reply, .. } => reply,
            other => panic!("expected open, got {other:?}"),
        };
        server.send(ConnectionEvent::Mail { count: 4 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        reply
            .send(Ok(MailboxStatus {
                exists: 4,
                uid_validity: None,
            }))
            .unwrap();

        server.serve_search(vec![]).await;
        server.assert_no_command().await;
        assert!(
            s.sink
                .records()
                .contains(&Diagnostic::NotificationIgnored { count: 4 })
        );
    }

    #[tokio::test]
    async fn test_stop_before_ready() {
        let mut s = setup();
        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;

        s.notifier.stop();
        server.expect_logout().await;
        server.send(ConnectionEvent::End).await;

        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        assert_no_event(&mut s.events).await;
        assert_eq!(
            s.sink
                .count(|d| matches!(d, Diagnostic::MailboxOpened { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_ready_after_stop_does_not_open() {
        let mut s = setup();
        s.notifier.start();
        let mut server = FakeServer::accept(&mut s.servers).await;

        s.notifier.stop();
        server.expect_logout().await;
        server.send(ConnectionEvent::Ready).await;
        server.send(ConnectionEvent::End).await;

        assert_eq!(next_event(&mut s.events).await, NotifierEvent::Connected);
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        server.assert_no_command().await;
    }

    #[tokio::test]
    async fn test_end_then_close_yields_single_end() {
        let mut s = setup();
        let mut server = open(&mut s, 0).await;
        server.serve_search(vec![]).await;

        s.notifier.stop();
        server.expect_logout().await;
        server.send(ConnectionEvent::End).await;
        server
            .offer(ConnectionEvent::Close { had_error: false })
            .await;

        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        assert_no_event(&mut s.events).await;
        s.notifier.wait().await;
        assert_eq!(s.notifier.state(), LifecycleState::Ended);
    }

    #[tokio::test]
    async fn test_close_without_end_still_ends() {
        let mut s = setup();
        let mut server = open(&mut s, 0).await;
        server.serve_search(vec![]).await;

        server
            .send(ConnectionEvent::Error(ConnectionError::Io("broken pipe".into())))
            .await;
        server
            .send(ConnectionEvent::Close { had_error: true })
            .await;

        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Connection);
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        assert!(
            s.sink
                .records()
                .contains(&Diagnostic::ConnectionClosed { had_error: true })
        );
    }

    #[tokio::test]
    async fn test_restart_builds_a_new_connection() {
        let mut s = setup();
        let mut server = open(&mut s, 0).await;
        server.serve_search(vec![]).await;

        s.notifier.stop();
        server.expect_logout().await;
        server.send(ConnectionEvent::End).await;
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
        s.notifier.wait().await;

        let mut second = open(&mut s, 2).await;
        second.serve_search(vec![2]).await;
        second
            .serve_fetch(vec![(2, Some(22), raw_message("again"))])
            .await;
        assert_eq!(expect_mail(next_event(&mut s.events).await).uid, 22);
        wait_for_state(&s.notifier, LifecycleState::Watching).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_right_after_end_without_wait() {
        let mut s = setup();

        for _ in 0..30 {
            s.notifier.start();
            let mut server = FakeServer::accept(&mut s.servers).await;
            s.notifier.stop();
            server.expect_logout().await;
            server.send(ConnectionEvent::End).await;
            assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);
            assert_eq!(s.notifier.state(), LifecycleState::Ended);
        }

        // The session task may still be winding down; start must not be lost
        s.notifier.start();
        let _server = FakeServer::accept(&mut s.servers).await;
        assert_eq!(s.notifier.state(), LifecycleState::Connecting);
    }

    #[tokio::test]
    async fn test_start_while_running_is_ignored() {
        let mut s = setup();
        s.notifier.start();
        let _server = FakeServer::accept(&mut s.servers).await;

        s.notifier.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s.servers.try_recv().is_err());
        assert_eq!(s.notifier.state(), LifecycleState::Connecting);
    }

    #[tokio::test]
    async fn test_message_without_uid_is_not_emitted() {
        let mut s = setup();
        let mut server = open(&mut s, 2).await;

        server.serve_search(vec![1, 2]).await;
        server
            .serve_fetch(vec![
                (1, None, raw_message("no uid")),
                (2, Some(2), raw_message("with uid")),
            ])
            .await;

        assert_eq!(expect_mail(next_event(&mut s.events).await).uid, 2);
        assert_no_event(&mut s.events).await;
        assert!(s.sink.records().contains(&Diagnostic::MissingUid { seq: 1 }));
    }

    #[tokio::test]
    async fn test_queued_scan_after_stop_surfaces_error() {
        let mut s = setup();
        let mut server = open(&mut s, 0).await;

        // Initial search stays pending while a second scan queues up
        let first = server.next_command().await;
        server.send(ConnectionEvent::Mail { count: 1 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        s.notifier.stop();
        server.expect_logout().await;
        server.send(ConnectionEvent::End).await;
        assert_eq!(next_event(&mut s.events).await, NotifierEvent::End);

        // The connection is gone: pending and queued scans fail
        drop(first);
        drop(server);
        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Search);
        let err = expect_error(next_event(&mut s.events).await);
        assert_eq!(err.stage(), ErrorStage::Search);
        assert_eq!(s.notifier.state(), LifecycleState::Ended);
    }
}
