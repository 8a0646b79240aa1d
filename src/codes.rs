//! On-demand verification code lookup.
//!
//! [`VerificationCodeService`] reuses the mailbox and the classifier to answer
//! "give me a code that arrived after T". It keeps its own UID cursor per call,
//! never touches the watch watermark and never flags messages seen, so it can
//! run while a reset attempt or a watch cycle is in flight.

use crate::classifier::{Category, Classifier};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::mailbox::{MailboxClient, MailboxQuery};
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// A code extracted from a verification message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    /// The code, exactly as it appears in the message.
    pub code: String,
    /// When the carrying message was received.
    pub received_at: DateTime<Utc>,
    /// UID of the carrying message.
    pub message_id: u32,
}

/// Anything that can produce verification codes.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Returns the first code for `account` received at or after `not_before`.
    ///
    /// # Errors
    ///
    /// [`Error::CodeTimedOut`] once `timeout` elapses without one; non-transient
    /// mailbox errors are returned as is.
    async fn fetch_code(
        &self,
        account: &str,
        not_before: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<VerificationCode>;
}

#[async_trait]
impl<T: CodeSource + ?Sized> CodeSource for Arc<T> {
    async fn fetch_code(
        &self,
        account: &str,
        not_before: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<VerificationCode> {
        (**self).fetch_code(account, not_before, timeout).await
    }
}

/// Mailbox-backed [`CodeSource`].
pub struct VerificationCodeService {
    mailbox: Arc<dyn MailboxClient>,
    classifier: Arc<Classifier>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    recipients: HashMap<String, Option<String>>,
}

impl VerificationCodeService {
    /// Creates a service polling `mailbox` every `poll_interval`.
    #[must_use]
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        classifier: Arc<Classifier>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            mailbox,
            classifier,
            clock,
            poll_interval,
            recipients: HashMap::new(),
        }
    }

    /// Restricts lookups for `account` to mail addressed to `recipient`.
    ///
    /// Accounts without an entry search the whole mailbox.
    #[must_use]
    pub fn with_recipient(mut self, account: impl Into<String>, recipient: Option<String>) -> Self {
        self.recipients.insert(account.into(), recipient);
        self
    }

    fn query(&self, account: &str, after_uid: u32, since: DateTime<Utc>) -> MailboxQuery {
        MailboxQuery::after(after_uid)
            .received_since(since)
            .recipient(self.recipients.get(account).cloned().flatten())
    }

    fn extract(&self, message: &Message) -> Option<VerificationCode> {
        let event = self.classifier.classify(message);
        if event.category != Category::VerificationCode {
            return None;
        }
        event.payload.map(|code| VerificationCode {
            code,
            received_at: message.received_at,
            message_id: message.id,
        })
    }

    /// Newest code for `account` received within `max_age`, without waiting.
    ///
    /// # Errors
    ///
    /// Returns mailbox errors.
    #[instrument(name = "VerificationCodeService::latest_code", skip(self), fields(account = %account))]
    pub async fn latest_code(
        &self,
        account: &str,
        max_age: Duration,
    ) -> Result<Option<VerificationCode>> {
        let since = self.clock.now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut messages = self.mailbox.fetch_unseen(&self.query(account, 0, since)).await?;
        messages.sort_by_key(|message| (message.received_at, message.id));

        let code = messages
            .iter()
            .rev()
            .filter(|message| message.received_at >= since)
            .find_map(|message| self.extract(message));
        debug!(found = code.is_some(), "Looked up latest code");
        Ok(code)
    }
}

#[async_trait]
impl CodeSource for VerificationCodeService {
    #[instrument(
        name = "VerificationCodeService::fetch_code",
        skip(self),
        fields(account = %account, not_before = %not_before)
    )]
    async fn fetch_code(
        &self,
        account: &str,
        not_before: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<VerificationCode> {
        let deadline = Instant::now() + timeout;
        let mut cursor = 0u32;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let query = self.query(account, cursor, not_before);

            match tokio::time::timeout_at(deadline, self.mailbox.fetch_unseen(&query)).await {
                Err(_) => return Err(Error::CodeTimedOut { timeout }),
                Ok(Ok(mut messages)) => {
                    messages.sort_by_key(|message| (message.received_at, message.id));
                    for message in &messages {
                        if message.received_at < not_before {
                            continue;
                        }
                        cursor = cursor.max(message.id);
                        if let Some(code) = self.extract(message) {
                            debug!(polls, message_id = code.message_id, "Verification code found");
                            return Ok(code);
                        }
                    }
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(polls, error = %e, "Mailbox poll failed, will retry");
                }
                Ok(Err(e)) => return Err(e),
            }

            if Instant::now() + self.poll_interval > deadline {
                debug!(polls, "No verification code before deadline");
                return Err(Error::CodeTimedOut { timeout });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl std::fmt::Debug for VerificationCodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationCodeService")
            .field("poll_interval", &self.poll_interval)
            .field("accounts", &self.recipients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Mailbox whose content grows over (virtual) time.
    #[derive(Default)]
    struct ScriptedMailbox {
        messages: Mutex<Vec<Message>>,
        polls: Mutex<u32>,
        /// `(poll number, message)`: the message appears from that poll on.
        arrivals: Mutex<Vec<(u32, Message)>>,
    }

    #[async_trait]
    impl MailboxClient for ScriptedMailbox {
        async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>> {
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            let mut messages = self.messages.lock().unwrap();
            let mut arrivals = self.arrivals.lock().unwrap();
            let (ready, pending): (Vec<_>, Vec<_>) =
                arrivals.drain(..).partition(|(at, _)| *at <= *polls);
            *arrivals = pending;
            messages.extend(ready.into_iter().map(|(_, m)| m));
            Ok(messages.iter().filter(|m| query.accepts(m)).cloned().collect())
        }

        async fn mark_seen(&self, _id: u32) -> Result<()> {
            panic!("code service must not flag messages");
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn code_message(id: u32, at: DateTime<Utc>, code: &str) -> Message {
        Message::new(
            id,
            at,
            "Your sign-in code",
            format!("Enter this code to sign in: {code}"),
        )
    }

    fn service(mailbox: Arc<ScriptedMailbox>) -> VerificationCodeService {
        VerificationCodeService::new(
            mailbox,
            Arc::new(Classifier::default()),
            Arc::new(ManualClock::new(t0())),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_codes_before_not_before() {
        let mailbox = Arc::new(ScriptedMailbox::default());
        mailbox
            .messages
            .lock()
            .unwrap()
            .push(code_message(1, t0() - chrono::Duration::minutes(5), "1111"));
        mailbox
            .arrivals
            .lock()
            .unwrap()
            .push((3, code_message(2, t0() + chrono::Duration::seconds(30), "2222")));

        let code = service(Arc::clone(&mailbox))
            .fetch_code("acct", t0(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(code.code, "2222");
        assert_eq!(code.message_id, 2);
        assert_eq!(*mailbox.polls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let mailbox = Arc::new(ScriptedMailbox::default());
        let result = service(mailbox)
            .fetch_code("acct", t0(), Duration::from_secs(7))
            .await;

        assert!(matches!(result, Err(Error::CodeTimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_code_prefers_newest() {
        let mailbox = Arc::new(ScriptedMailbox::default());
        {
            let mut messages = mailbox.messages.lock().unwrap();
            messages.push(code_message(4, t0() - chrono::Duration::minutes(3), "AB12CD"));
            messages.push(code_message(5, t0() - chrono::Duration::minutes(1), "998877"));
            messages.push(code_message(3, t0() - chrono::Duration::hours(2), "000000"));
        }

        let svc = service(Arc::clone(&mailbox));
        let code = svc
            .latest_code("acct", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.code, "998877");

        let none = svc
            .latest_code("acct", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
