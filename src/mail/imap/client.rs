//! IMAP client operations: connection, mailbox, search and fetch.

use async_imap::types::{Flag, UnsolicitedResponse};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::config::AuthMethod;
use crate::error::ConnectionError;
use crate::mail::parser::parse_flags_from_imap;

use super::tls::connect_stream;
use super::{FetchEvent, ImapClient, ImapSession, MailboxStatus, XOAuth2Authenticator};

/// Mailbox changes picked up from untagged server responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxChange {
    Exists(u32),
    Expunge(u32),
}

impl ImapClient {
    //
    // Connection Management
    //

    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let stream = connect_stream(
            &self.config.host,
            self.config.port,
            self.config.tls,
            self.config.accept_invalid_certs,
        )
        .await?;

        // async-imap speaks futures-io; wrap the tokio stream
        let client = async_imap::Client::new(stream.compat());

        let mut session = match self.auth_method() {
            AuthMethod::Password => client
                .login(&self.config.user, &self.config.password)
                .await
                .map_err(|e| ConnectionError::Auth(e.0.to_string()))?,
            AuthMethod::OAuth2 { access_token } => {
                let authenticator = XOAuth2Authenticator {
                    user: self.config.user.clone(),
                    access_token: access_token.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|e| ConnectionError::Auth(format!("XOAUTH2: {}", e.0)))?
            }
        };

        match session.capabilities().await {
            Ok(caps) => {
                self.has_idle = caps.has_str("IDLE");
                if !self.has_idle {
                    tracing::warn!(
                        "Server {} does not advertise IDLE; new mail is only picked up between commands",
                        self.config.host
                    );
                }
            }
            Err(e) => tracing::debug!("CAPABILITY failed: {}", e),
        }

        self.session = Some(session);
        tracing::info!("Connected to IMAP server {}", self.config.host);

        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut session) = self.session.take() {
            session.logout().await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Take the session out of the client (for IDLE)
    pub(crate) fn take_session(&mut self) -> Option<ImapSession> {
        self.session.take()
    }

    /// Put the session back into the client
    pub(crate) fn restore_session(&mut self, session: ImapSession) {
        self.session = Some(session);
    }

    fn session(&mut self) -> Result<&mut ImapSession, ConnectionError> {
        self.session.as_mut().ok_or(ConnectionError::Closed)
    }

    //
    // Mailbox Operations
    //

    pub async fn select_mailbox(&mut self, name: &str) -> Result<MailboxStatus, ConnectionError> {
        let mailbox = self.session()?.select(name).await?;
        tracing::debug!(
            "Selected '{}': {} messages, uidvalidity {:?}",
            name,
            mailbox.exists,
            mailbox.uid_validity
        );
        Ok(MailboxStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
        })
    }

    /// NOOP gives servers without IDLE a chance to report changes.
    pub async fn noop(&mut self) -> Result<(), ConnectionError> {
        self.session()?.noop().await?;
        Ok(())
    }

    /// Untagged EXISTS/EXPUNGE responses queued while commands ran.
    pub(crate) fn drain_changes(&mut self) -> Vec<MailboxChange> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let mut changes = Vec::new();
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(n) => changes.push(MailboxChange::Exists(n)),
                UnsolicitedResponse::Expunge(seq) => changes.push(MailboxChange::Expunge(seq)),
                other => tracing::trace!("Ignoring unsolicited response: {:?}", other),
            }
        }
        changes
    }

    //
    // Search and Fetch
    //

    /// UID SEARCH, returning UIDs in ascending order.
    ///
    /// UIDs stay valid across the EXPUNGEs that may arrive before the fetch.
    pub async fn search(&mut self, criteria: &str) -> Result<Vec<u32>, ConnectionError> {
        let found = self.session()?.uid_search(criteria).await?;
        let mut ids: Vec<u32> = found.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// FETCH complete messages, forwarding each one as it arrives.
    ///
    /// Returns once the server finishes the response; the caller reports the
    /// terminal `End`/`Error` event.
    pub async fn fetch_messages(
        &mut self,
        uids: &[u32],
        mark_seen: bool,
        events: &mpsc::Sender<FetchEvent>,
    ) -> Result<usize, ConnectionError> {
        let set = sequence_set(uids);
        let query = fetch_query(mark_seen);
        let session = self.session()?;

        let mut messages = session.uid_fetch(&set, query).await?;
        let mut count = 0;

        while let Some(result) = messages.next().await {
            let fetch = result?;
            let seq = fetch.message;

            // Unsolicited FETCH for messages outside the set (e.g. flag updates)
            if !requested(uids, fetch.uid) {
                continue;
            }

            let flag_vec: Vec<Flag> = fetch.flags().collect();
            let announcements = [
                FetchEvent::Message { seq },
                FetchEvent::Attributes {
                    seq,
                    uid: fetch.uid,
                    flags: parse_flags_from_imap(&flag_vec),
                },
            ];
            for event in announcements {
                events.send(event).await.ok();
            }

            if let Some(body) = fetch.body() {
                events
                    .send(FetchEvent::Body {
                        seq,
                        raw: body.to_vec(),
                    })
                    .await
                    .ok();
            }
            count += 1;
        }

        tracing::debug!("Fetched {} of {} messages", count, uids.len());
        Ok(count)
    }
}

/// Whether a FETCH response belongs to the requested (sorted) UID set.
fn requested(uids: &[u32], uid: Option<u32>) -> bool {
    uid.is_some_and(|uid| uids.binary_search(&uid).is_ok())
}

fn fetch_query(mark_seen: bool) -> &'static str {
    if mark_seen {
        "(UID FLAGS BODY[])"
    } else {
        "(UID FLAGS BODY.PEEK[])"
    }
}

/// Compact IMAP set for sorted ids: `[1,2,3,7]` -> `"1:3,7"`
pub(crate) fn sequence_set(ids: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = ids.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if next == end + 1 {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }

    parts.join(",")
}
