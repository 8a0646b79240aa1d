//! # password-sentinel
//!
//! Keeps sole control of a shared streaming-service account: watches the
//! owner's mailbox for "your password was changed" notices and puts the
//! configured password back through an automated browser session.
//!
//! This crate provides:
//! - A mailbox watcher with a durable per-account watermark ([`Watcher`])
//! - A rule-based message classifier ([`classifier::Classifier`])
//! - A reset state machine with cooldown, attempt lock and bounded retries
//!   ([`ResetOrchestrator`])
//! - On-demand verification code lookup ([`VerificationCodeService`])
//! - Owner notification of every finished attempt over SMTP ([`notify::MailSink`])
//!
//! The core only talks to capability traits: [`MailboxClient`], [`StateStore`],
//! [`AutomationDriver`] / [`DriverFactory`] and [`CodeSource`]. The crate ships
//! [`ImapMailbox`] (IMAPS), [`MemoryStore`] / [`SqliteStore`] and, with the
//! `webdriver` feature, [`WebDriverFactory`].
//!
//! ## Features
//!
//! - **`webdriver`** (default): fantoccini-backed browser automation.
//! - **`observability`**: Enables OpenTelemetry integration for distributed tracing.
//!   Without this feature, tracing spans are still emitted but require no OTEL dependencies.
//!
//! ## Quick Start
//!
//! ```no_run
//! use password_sentinel::{
//!     classifier::Classifier, CodeSource, ImapMailbox, MailboxClient, ResetOrchestrator,
//!     SentinelConfig, SqliteStore, StateStore, VerificationCodeService, Watcher,
//!     WebDriverFactory,
//! };
//! use password_sentinel::clock::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> password_sentinel::Result<()> {
//! let config = Arc::new(SentinelConfig::from_env()?);
//! let mailbox_config = config.mailbox.clone().expect("SENTINEL_IMAP_* variables");
//!
//! let mailbox: Arc<dyn MailboxClient> = Arc::new(ImapMailbox::new(mailbox_config));
//! let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open("sentinel.db").await?);
//! let classifier = Arc::new(Classifier::default());
//! let codes: Arc<dyn CodeSource> = Arc::new(VerificationCodeService::new(
//!     Arc::clone(&mailbox),
//!     Arc::clone(&classifier),
//!     Arc::new(SystemClock),
//!     config.code_poll_interval,
//! ));
//!
//! let orchestrator = Arc::new(ResetOrchestrator::new(
//!     Arc::clone(&config),
//!     Arc::clone(&store),
//!     Arc::new(WebDriverFactory::new("http://localhost:9515")),
//!     codes,
//! ));
//! let watcher = Watcher::new(config, mailbox, store, classifier, orchestrator);
//!
//! for (account, report) in watcher.run_all().await {
//!     println!("{account}: {report:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All errors implement `std::error::Error` and provide context. Use [`Error::is_retryable`]
//! to determine if an operation can be retried:
//!
//! ```
//! use password_sentinel::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_state_failure() {
//!         println!("State store down, cycle aborted: {}", error);
//!     } else if error.is_retryable() {
//!         println!("Transient error, can retry: {}", error);
//!     } else {
//!         println!("Permanent error: {}", error);
//!     }
//! }
//! ```
//!
//! Reset attempts do not return their step failures as errors; they end in an
//! [`AttemptRecord`] carrying a [`FailureReason`].
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. All major operations emit spans with
//! structured fields suitable for distributed tracing.
//!
//! ### Span Naming Convention
//!
//! - `Watcher::run_cycle` - One watch cycle for one account
//! - `ResetOrchestrator::handle` - One password change notice
//! - `VerificationCodeService::fetch_code` - Waiting for a code
//! - `ImapMailbox::connect` / `ImapMailbox::fetch_unseen` / `ImapMailbox::mark_seen`
//! - `WebDriverFactory::open` - Browser session start
//! - `MailSink::send` - Owner notification
//! - `session::authenticate` - IMAP authentication
//! - `connection::establish_tls` - TLS connection
//!
//! ### Standard Fields
//!
//! - `account` - Account id
//! - `message_id` - UID of the triggering message
//! - `step` - Reset step
//! - `attempts` - Step executions in an attempt
//! - `email` - Mailbox login
//!
//! Enable the `observability` feature for OpenTelemetry integration.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod classifier;
pub mod clock;
pub mod codes;
pub mod config;
pub mod driver;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod notify;
pub mod orchestrator;
pub mod site;
pub mod store;
pub mod watch;

// Internal modules
mod connection;
mod imap;
mod retry;
mod session;
mod sqlite_store;
#[cfg(feature = "webdriver")]
mod webdriver;

// Re-exports for ergonomic API
pub use codes::{CodeSource, VerificationCode, VerificationCodeService};
pub use config::{
    AccountConfig, ChallengePolicy, MailboxConfig, MailboxConfigBuilder, SentinelConfig,
    SentinelConfigBuilder, TimeoutConfig,
};
pub use driver::{AutomationDriver, DriverFactory, DriverSession};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, FailureReason, Result};
pub use imap::ImapMailbox;
pub use mailbox::{MailboxClient, MailboxQuery};
pub use message::Message;
pub use notify::{MailSink, NotifyConfig};
pub use orchestrator::{
    AttemptRecord, Disposition, IgnoreReason, Outcome, OutcomeSink, ResetAttempt,
    ResetOrchestrator, ResetStep, TracingSink,
};
pub use retry::RetryPolicy;
pub use site::SiteProfile;
pub use sqlite_store::SqliteStore;
pub use store::{AccountState, MemoryStore, StateStore};
pub use watch::{CycleReport, Watcher};
#[cfg(feature = "webdriver")]
pub use webdriver::{WebDriver, WebDriverFactory};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        // Ensure all public types are accessible
        let _ = SentinelConfig::builder();
        let _ = MailboxConfig::builder();
        let _ = NotifyConfig::builder();
        let _ = MemoryStore::new();
        let _ = classifier::Classifier::default();
        let _ = SiteProfile::default();
        let _ = RetryPolicy::default();
    }
}
