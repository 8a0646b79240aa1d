//! IMAP implementation of [`MailboxClient`].
//!
//! # Example
//!
//! ```no_run
//! use password_sentinel::{ImapMailbox, MailboxClient, MailboxConfig, MailboxQuery};
//!
//! # async fn example() -> password_sentinel::Result<()> {
//! let config = MailboxConfig::builder()
//!     .email("owner@gmail.com")
//!     .password("app-password")
//!     .build()?;
//!
//! let mailbox = ImapMailbox::connect(config).await?;
//! for message in mailbox.fetch_unseen(&MailboxQuery::after(0)).await? {
//!     println!("{} {}", message.id, message.subject);
//! }
//! mailbox.logout().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::MailboxConfig;
use crate::connection;
use crate::error::{Error, Result};
use crate::mailbox::{MailboxClient, MailboxQuery};
use crate::message::Message;
use crate::session::{self, ImapSession};
use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Mailbox reached over IMAPS.
///
/// The session is opened on first use and dropped after any transport error,
/// so the next call reconnects. Fetches use `BODY.PEEK[]` and never change
/// seen flags; only [`mark_seen`](MailboxClient::mark_seen) does.
///
/// Dropping the mailbox inside a tokio runtime logs out in the background.
pub struct ImapMailbox {
    config: MailboxConfig,
    session: Mutex<Option<Box<ImapSession>>>,
}

impl ImapMailbox {
    /// Creates a mailbox that connects on first use.
    #[must_use]
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    /// Connects, authenticates and selects the configured mailbox right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, authentication or mailbox selection fails.
    #[instrument(
        name = "ImapMailbox::connect",
        skip_all,
        fields(email = %config.email(), imap_host = %config.effective_imap_host())
    )]
    pub async fn connect(config: MailboxConfig) -> Result<Self> {
        let session = Self::initialize_session(&config).await?;
        debug!("Mailbox connected and ready");

        Ok(Self {
            config,
            session: Mutex::new(Some(Box::new(session))),
        })
    }

    /// Returns the login address of this mailbox.
    #[must_use]
    pub fn email(&self) -> &str {
        self.config.email()
    }

    /// Logs out if a session is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the logout command fails or times out.
    #[instrument(name = "ImapMailbox::logout", skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let Some(mut imap) = self.session.lock().await.take() else {
            return Ok(());
        };
        let timeout = self.config.timeouts.logout;
        match tokio::time::timeout(timeout, session::logout(&mut imap)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Logout timed out");
                Ok(())
            }
        }
    }

    /// Initializes IMAP session with connection, authentication, and mailbox selection.
    async fn initialize_session(config: &MailboxConfig) -> Result<ImapSession> {
        let timeouts = &config.timeouts;

        let tls_stream = connection::open(config).await?;
        debug!("TLS connection established");

        let mut session = tokio::time::timeout(
            timeouts.auth,
            session::authenticate(tls_stream, config.email(), config.password()),
        )
        .await
        .map_err(|_| Error::AuthTimeout {
            email: config.email().to_string(),
            timeout: timeouts.auth,
        })??;

        debug!("Authenticated");

        tokio::time::timeout(
            timeouts.select,
            session::select_mailbox(&mut session, &config.mailbox),
        )
        .await
        .map_err(|_| Error::SelectTimeout {
            mailbox: config.mailbox.clone(),
            timeout: timeouts.select,
        })??;

        debug!(mailbox = %config.mailbox, "Selected mailbox");

        Ok(session)
    }

    async fn ensure_session<'s>(
        &self,
        slot: &'s mut Option<Box<ImapSession>>,
    ) -> Result<&'s mut ImapSession> {
        let session = match slot.take() {
            Some(session) => session,
            None => Box::new(Self::initialize_session(&self.config).await?),
        };
        Ok(slot.insert(session))
    }

    async fn fetch_locked(
        &self,
        slot: &mut Option<Box<ImapSession>>,
        query: &MailboxQuery,
    ) -> Result<Vec<Message>> {
        let timeouts = &self.config.timeouts;
        let imap = self.ensure_session(slot).await?;

        let since = query.received_since.unwrap_or_else(|| {
            Utc::now()
                - chrono::Duration::from_std(self.config.lookback)
                    .unwrap_or(chrono::Duration::zero())
        });

        let uids = tokio::time::timeout(
            timeouts.search,
            session::search_after(
                imap,
                query.after_uid,
                Some(since.date_naive()),
                query.recipient.as_deref(),
            ),
        )
        .await
        .map_err(|_| Error::SearchTimeout {
            timeout: timeouts.search,
        })??;

        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = session::uid_set(&uids);
        let mut messages = tokio::time::timeout(timeouts.fetch, async {
            let mut stream = session::fetch_messages(imap, &uid_set).await?;
            let mut messages = Vec::with_capacity(uids.len());
            while let Some(item) = stream.next().await {
                let fetch = item.map_err(|source| Error::FetchMessage { source })?;
                if let Some(message) = to_message(&fetch) {
                    messages.push(message);
                }
            }
            Ok::<_, Error>(messages)
        })
        .await
        .map_err(|_| Error::FetchTimeout {
            uid_range: uid_set.clone(),
            timeout: timeouts.fetch,
        })??;

        messages.retain(|message| query.accepts(message));
        messages.sort_by_key(|message| message.id);
        Ok(messages)
    }

    async fn mark_seen_locked(&self, slot: &mut Option<Box<ImapSession>>, id: u32) -> Result<()> {
        let timeout = self.config.timeouts.flag;
        let imap = self.ensure_session(slot).await?;

        tokio::time::timeout(timeout, session::mark_seen(imap, id))
            .await
            .map_err(|_| Error::FlagTimeout { uid: id, timeout })?
    }
}

/// Converts a fetch response; messages without UID or body, or that fail to parse, are skipped.
fn to_message(fetch: &Fetch) -> Option<Message> {
    let uid = fetch.uid?;
    let Some(raw) = fetch.body() else {
        debug!(uid, "Fetch response without body");
        return None;
    };
    let internal_date = fetch.internal_date().map(|at| at.with_timezone(&Utc));
    let seen = fetch.flags().any(|flag| matches!(flag, Flag::Seen));

    match Message::from_rfc822(uid, raw, internal_date, seen) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(uid, error = %e, "Skipping unparsable message");
            None
        }
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    #[instrument(
        name = "ImapMailbox::fetch_unseen",
        skip_all,
        fields(after_uid = query.after_uid)
    )]
    async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>> {
        let mut slot = self.session.lock().await;
        let result = self.fetch_locked(&mut slot, query).await;

        match &result {
            Ok(messages) => debug!(count = messages.len(), "Fetched messages"),
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "Dropping IMAP session after transport error");
                *slot = None;
            }
            Err(_) => {}
        }
        result
    }

    #[instrument(name = "ImapMailbox::mark_seen", skip(self))]
    async fn mark_seen(&self, id: u32) -> Result<()> {
        let mut slot = self.session.lock().await;
        let result = self.mark_seen_locked(&mut slot, id).await;

        if matches!(&result, Err(e) if e.is_retryable()) {
            *slot = None;
        }
        result
    }
}

impl std::fmt::Debug for ImapMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailbox")
            .field("email", &self.config.email())
            .field("imap_host", &self.config.effective_imap_host())
            .field("mailbox", &self.config.mailbox)
            .finish_non_exhaustive()
    }
}

impl Drop for ImapMailbox {
    fn drop(&mut self) {
        let Some(mut imap) = self.session.get_mut().take() else {
            return;
        };
        let logout_timeout = self.config.timeouts.logout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match tokio::time::timeout(logout_timeout, session::logout(&mut imap)).await
                    {
                        Ok(Ok(())) => debug!("Mailbox logged out"),
                        Ok(Err(e)) => warn!(error = %e, "Mailbox logout failed"),
                        Err(_) => warn!(
                            timeout_secs = logout_timeout.as_secs(),
                            "Mailbox logout timed out"
                        ),
                    }
                });
            }
            Err(_) => {
                warn!(
                    "ImapMailbox dropped outside of tokio runtime context. \
                     Connection will be closed without IMAP logout."
                );
            }
        }
    }
}
