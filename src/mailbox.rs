//! Mailbox capability consumed by the watch cycle and the code service.
//!
//! The core never talks IMAP directly; it asks a [`MailboxClient`] for the
//! messages after a UID and flags the ones it has finished with.
//! [`ImapMailbox`](crate::ImapMailbox) is the production implementation.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Selects which messages a fetch returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxQuery {
    /// Only messages with a UID strictly greater than this.
    pub after_uid: u32,
    /// Only messages received at or after this instant.
    ///
    /// Servers may apply this at day granularity; callers re-check `received_at`.
    pub received_since: Option<DateTime<Utc>>,
    /// Only messages addressed to this recipient.
    pub recipient: Option<String>,
}

impl MailboxQuery {
    /// Messages after the given UID.
    #[must_use]
    pub fn after(uid: u32) -> Self {
        Self {
            after_uid: uid,
            ..Self::default()
        }
    }

    /// Restricts the query to messages received at or after `since`.
    #[must_use]
    pub fn received_since(mut self, since: DateTime<Utc>) -> Self {
        self.received_since = Some(since);
        self
    }

    /// Restricts the query to one recipient address.
    #[must_use]
    pub fn recipient(mut self, recipient: Option<String>) -> Self {
        self.recipient = recipient;
        self
    }

    /// Returns `true` if `message` satisfies every constraint of this query.
    #[must_use]
    pub fn accepts(&self, message: &Message) -> bool {
        message.id > self.after_uid
            && self
                .received_since
                .map_or(true, |since| message.received_at >= since)
            && self
                .recipient
                .as_deref()
                .map_or(true, |to| message.is_addressed_to(to))
    }
}

/// Remote mailbox operations the core depends on.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Returns the messages matching `query`, ordered by UID.
    ///
    /// Fetching must not change the messages' seen flags.
    async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>>;

    /// Flags a message as seen.
    async fn mark_seen(&self, id: u32) -> Result<()>;
}

#[async_trait]
impl<T: MailboxClient + ?Sized> MailboxClient for Arc<T> {
    async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>> {
        (**self).fetch_unseen(query).await
    }

    async fn mark_seen(&self, id: u32) -> Result<()> {
        (**self).mark_seen(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_query_accepts() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let message = Message::new(10, at, "s", "b").with_recipient("Owner@Example.com");

        assert!(MailboxQuery::after(9).accepts(&message));
        assert!(!MailboxQuery::after(10).accepts(&message));
        assert!(!MailboxQuery::after(0)
            .received_since(at + chrono::Duration::seconds(1))
            .accepts(&message));
        assert!(MailboxQuery::after(0)
            .recipient(Some("owner@example.com".into()))
            .accepts(&message));
        assert!(!MailboxQuery::after(0)
            .recipient(Some("other@example.com".into()))
            .accepts(&message));
    }
}
