//! Watch cycles: fetch, classify and dispatch new mail per account.
//!
//! A cycle walks the messages after the account's watermark in UID order,
//! the same order the watermark advances in, whatever their arrival times.
//! "Password changed" notices go to the [`ResetOrchestrator`] one at a time;
//! every examined message is flagged seen and the watermark moves past it
//! before the next one is looked at. When the store fails the cycle stops
//! where it is, so the next cycle resumes right after the last message that
//! was fully handled.

use crate::classifier::{Category, Classifier};
use crate::config::{AccountConfig, SentinelConfig};
use crate::error::{Error, Result};
use crate::mailbox::{MailboxClient, MailboxQuery};
use crate::orchestrator::{Disposition, ResetOrchestrator};
use crate::store::{AccountState, StateStore};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What one cycle did for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Account id.
    pub account: String,
    /// Messages looked at.
    pub examined: usize,
    /// Result of every notice handed to the orchestrator, in order.
    pub dispatched: Vec<Disposition>,
    /// Watermark after the cycle.
    pub watermark: Option<u32>,
    /// `true` if this was a first run that only recorded the newest UID.
    pub skipped_backlog: bool,
}

/// Runs watch cycles over every configured account.
pub struct Watcher {
    config: Arc<SentinelConfig>,
    mailbox: Arc<dyn MailboxClient>,
    store: Arc<dyn StateStore>,
    classifier: Arc<Classifier>,
    orchestrator: Arc<ResetOrchestrator>,
}

impl Watcher {
    /// Wires a watcher. `orchestrator` should share `store` and `config`.
    #[must_use]
    pub fn new(
        config: Arc<SentinelConfig>,
        mailbox: Arc<dyn MailboxClient>,
        store: Arc<dyn StateStore>,
        classifier: Arc<Classifier>,
        orchestrator: Arc<ResetOrchestrator>,
    ) -> Self {
        Self {
            config,
            mailbox,
            store,
            classifier,
            orchestrator,
        }
    }

    /// Runs one cycle for the account with id `account_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if no such account is configured
    /// - mailbox errors from the initial fetch
    /// - [`Error::StateStore`] / [`Error::CorruptState`], which abort the cycle
    #[instrument(name = "Watcher::run_cycle", skip(self), fields(account = %account_id))]
    pub async fn run_cycle(&self, account_id: &str) -> Result<CycleReport> {
        let account = self
            .config
            .account(account_id)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("unknown account '{account_id}'"),
            })?;
        let state = AccountState::new(&*self.store, &account.id);

        let mut report = CycleReport {
            account: account.id.clone(),
            ..CycleReport::default()
        };

        let Some(watermark) = state.watermark().await? else {
            if self.config.skip_backlog {
                return self.skip_backlog(account, &state, report).await;
            }
            return self.dispatch_after(account, &state, 0, report).await;
        };
        report.watermark = Some(watermark);
        self.dispatch_after(account, &state, watermark, report).await
    }

    async fn skip_backlog(
        &self,
        account: &AccountConfig,
        state: &AccountState<'_>,
        mut report: CycleReport,
    ) -> Result<CycleReport> {
        let query = MailboxQuery::after(0).recipient(account.mail_filter.clone());
        let messages = self.mailbox.fetch_unseen(&query).await?;
        let newest = messages.iter().map(|message| message.id).max().unwrap_or(0);

        report.watermark = Some(state.advance_watermark(newest).await?);
        report.skipped_backlog = true;
        info!(
            skipped = messages.len(),
            watermark = newest,
            "First run, skipping existing mail"
        );
        Ok(report)
    }

    async fn dispatch_after(
        &self,
        account: &AccountConfig,
        state: &AccountState<'_>,
        watermark: u32,
        mut report: CycleReport,
    ) -> Result<CycleReport> {
        let query = MailboxQuery::after(watermark).recipient(account.mail_filter.clone());
        let mut messages = self.mailbox.fetch_unseen(&query).await?;
        // The watermark is a UID maximum; any other order could skip past a pending lower UID
        messages.sort_by_key(|message| message.id);
        debug!(count = messages.len(), watermark, "Fetched new mail");

        for message in &messages {
            let event = self.classifier.classify(message);
            report.examined += 1;

            match event.category {
                Category::PasswordChanged => {
                    info!(
                        message_id = message.id,
                        rule = event.rule.as_deref().unwrap_or(""),
                        "Password change notice"
                    );
                    let disposition = self.orchestrator.handle(account, message).await?;
                    report.dispatched.push(disposition);
                }
                category => debug!(message_id = message.id, %category, "Not a change notice"),
            }

            if let Err(e) = self.mailbox.mark_seen(message.id).await {
                warn!(message_id = message.id, error = %e, "Failed to flag message seen");
            }
            report.watermark = Some(state.advance_watermark(message.id).await?);
        }

        Ok(report)
    }

    /// Runs one cycle per configured account, concurrently.
    ///
    /// Accounts are isolated: each gets its own result, and a failing or
    /// panicking cycle leaves the others untouched.
    pub async fn run_all(&self) -> Vec<(String, Result<CycleReport>)> {
        let cycles = self.config.accounts().iter().map(|account| async move {
            let result = AssertUnwindSafe(self.run_cycle(&account.id))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(account = %account.id, "Watch cycle panicked");
                    Err(Error::CyclePanicked {
                        account: account.id.clone(),
                    })
                });
            if let Err(e) = &result {
                warn!(account = %account.id, error = %e, "Watch cycle failed");
            }
            (account.id.clone(), result)
        });
        futures::future::join_all(cycles).await
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("accounts", &self.config.accounts().len())
            .field("rules", &self.classifier.rules().len())
            .field("skip_backlog", &self.config.skip_backlog)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{CodeSource, VerificationCode};
    use crate::driver::{AutomationDriver, DriverFactory};
    use crate::message::Message;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticMailbox {
        messages: Vec<Message>,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MailboxClient for StaticMailbox {
        async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>> {
            Ok(self
                .messages
                .iter()
                .filter(|m| query.accepts(m))
                .cloned()
                .collect())
        }

        async fn mark_seen(&self, id: u32) -> Result<()> {
            self.seen.lock().unwrap().push(id);
            Ok(())
        }
    }

    struct NoBrowser;

    #[async_trait]
    impl DriverFactory for NoBrowser {
        async fn open(&self) -> Result<Box<dyn AutomationDriver>> {
            panic!("no browser expected in this test");
        }
    }

    struct NoCodes;

    #[async_trait]
    impl CodeSource for NoCodes {
        async fn fetch_code(
            &self,
            _account: &str,
            _not_before: DateTime<Utc>,
            timeout: Duration,
        ) -> Result<VerificationCode> {
            Err(Error::CodeTimedOut { timeout })
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()
    }

    fn watcher(skip_backlog: bool, messages: Vec<Message>) -> (Watcher, Arc<StaticMailbox>) {
        let config = Arc::new(
            SentinelConfig::builder()
                .account(AccountConfig::new("owner@example.com", "Secret-1"))
                .skip_backlog(skip_backlog)
                .build()
                .unwrap(),
        );
        let mailbox = Arc::new(StaticMailbox {
            messages,
            seen: Mutex::new(Vec::new()),
        });
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(ResetOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::new(NoBrowser),
            Arc::new(NoCodes),
        ));
        let watcher = Watcher::new(
            config,
            Arc::clone(&mailbox) as Arc<dyn MailboxClient>,
            store,
            Arc::new(Classifier::default()),
            orchestrator,
        );
        (watcher, mailbox)
    }

    fn newsletter(id: u32, minute: u32) -> Message {
        Message::new(id, at(minute), "This week on the service", "New releases")
            .with_recipient("owner@example.com")
    }

    #[tokio::test]
    async fn test_first_run_skips_backlog() {
        let (watcher, mailbox) = watcher(true, vec![newsletter(3, 1), newsletter(8, 2)]);

        let report = watcher.run_cycle("owner@example.com").await.unwrap();
        assert!(report.skipped_backlog);
        assert_eq!(report.watermark, Some(8));
        assert_eq!(report.examined, 0);
        assert!(mailbox.seen.lock().unwrap().is_empty());

        let report = watcher.run_cycle("owner@example.com").await.unwrap();
        assert!(!report.skipped_backlog);
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_mail_is_walked_in_uid_order() {
        // UID 9 arrived before UID 4
        let (watcher, mailbox) = watcher(false, vec![newsletter(9, 1), newsletter(4, 5)]);

        let report = watcher.run_cycle("owner@example.com").await.unwrap();
        assert_eq!(report.examined, 2);
        assert!(report.dispatched.is_empty());
        assert_eq!(report.watermark, Some(9));
        assert_eq!(*mailbox.seen.lock().unwrap(), vec![4, 9]);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (watcher, _) = watcher(false, Vec::new());
        assert!(matches!(
            watcher.run_cycle("nobody").await,
            Err(Error::InvalidConfig { .. })
        ));
    }
}
