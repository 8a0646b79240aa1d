//! Owner notifications.
//!
//! [`MailSink`] mails the account owner a short report of every finished
//! reset attempt through an SMTP relay, so a failed reset never goes unseen.
//!
//! # Example
//!
//! ```no_run
//! use password_sentinel::notify::{MailSink, NotifyConfig};
//! use password_sentinel::{OutcomeSink, TracingSink};
//! use std::sync::Arc;
//!
//! # fn example() -> password_sentinel::Result<()> {
//! let config = NotifyConfig::builder()
//!     .smtp_host("smtp.gmail.com")
//!     .username("sentinel@gmail.com")
//!     .password("app-password")
//!     .to("owner@example.com")
//!     .build()?;
//!
//! let sinks: Vec<Arc<dyn OutcomeSink>> = vec![
//!     Arc::new(TracingSink),
//!     Arc::new(MailSink::new(&config)?),
//! ];
//! # Ok(())
//! # }
//! ```

use crate::config::{parse_var, validate_email};
use crate::error::{Error, Result};
use crate::orchestrator::{AttemptRecord, Outcome, OutcomeSink};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const SENDER_NAME: &str = "Password Sentinel";

/// SMTP relay and addresses for owner notifications.
#[derive(Clone)]
pub struct NotifyConfig {
    /// Relay hostname.
    pub smtp_host: String,
    /// Relay port (default: 465, or 587 with STARTTLS).
    pub smtp_port: u16,
    /// Upgrade a plain connection with STARTTLS instead of connecting over TLS.
    pub starttls: bool,
    username: String,
    password: SecretString,
    from: String,
    to: String,
    /// Upper bound for delivering one notification.
    pub send_timeout: Duration,
}

impl std::fmt::Debug for NotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("starttls", &self.starttls)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl NotifyConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> NotifyConfigBuilder {
        NotifyConfigBuilder::default()
    }

    /// Sender address.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.from
    }

    /// Recipient address.
    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.to
    }

    /// Reads `SENTINEL_SMTP_*` and `SENTINEL_NOTIFY_*` variables, loading `.env` first.
    ///
    /// Returns `Ok(None)` when `SENTINEL_SMTP_HOST` is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result fails validation.
    pub fn from_env() -> Result<Option<Self>> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result fails validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(host) = lookup("SENTINEL_SMTP_HOST") else {
            return Ok(None);
        };

        let mut builder = Self::builder()
            .smtp_host(host)
            .password(lookup("SENTINEL_SMTP_PASSWORD").unwrap_or_default());
        if let Some(username) = lookup("SENTINEL_SMTP_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(port) = parse_var(&lookup, "SENTINEL_SMTP_PORT")? {
            builder = builder.smtp_port(port);
        }
        if let Some(starttls) = parse_var(&lookup, "SENTINEL_SMTP_STARTTLS")? {
            builder = builder.starttls(starttls);
        }
        if let Some(from) = lookup("SENTINEL_NOTIFY_FROM") {
            builder = builder.from(from);
        }
        if let Some(to) = lookup("SENTINEL_NOTIFY_TO") {
            builder = builder.to(to);
        }

        builder.build().map(Some)
    }
}

/// Builder for [`NotifyConfig`].
#[derive(Debug, Default)]
pub struct NotifyConfigBuilder {
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    starttls: bool,
    username: Option<String>,
    password: Option<String>,
    from: Option<String>,
    to: Option<String>,
    send_timeout: Option<Duration>,
}

impl NotifyConfigBuilder {
    /// Sets the relay hostname (required).
    #[must_use]
    pub fn smtp_host(mut self, host: impl Into<String>) -> Self {
        self.smtp_host = Some(host.into());
        self
    }

    /// Sets the relay port.
    #[must_use]
    pub fn smtp_port(mut self, port: u16) -> Self {
        self.smtp_port = Some(port);
        self
    }

    /// Uses STARTTLS instead of implicit TLS.
    #[must_use]
    pub fn starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// Sets the relay login (required).
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the relay password (required).
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the sender address (default: the relay login).
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the owner's address (required).
    #[must_use]
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the delivery timeout.
    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or an address is invalid.
    pub fn build(self) -> Result<NotifyConfig> {
        let smtp_host = self
            .smtp_host
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                message: "SMTP host is required".into(),
            })?;
        let username = self.username.ok_or_else(|| Error::InvalidConfig {
            message: "SMTP username is required".into(),
        })?;
        let password = self.password.ok_or_else(|| Error::InvalidConfig {
            message: "SMTP password is required".into(),
        })?;
        let to = self.to.ok_or_else(|| Error::InvalidConfig {
            message: "notification recipient is required".into(),
        })?;
        let from = self.from.unwrap_or_else(|| username.clone());

        let from = validate_email(&from)?.as_str().to_string();
        let to = validate_email(&to)?.as_str().to_string();
        let default_port = if self.starttls { 587 } else { 465 };

        Ok(NotifyConfig {
            smtp_host,
            smtp_port: self.smtp_port.unwrap_or(default_port),
            starttls: self.starttls,
            username,
            password: SecretString::from(password),
            from,
            to,
            send_timeout: self.send_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

/// [`OutcomeSink`] that mails a report of every finished attempt to the owner.
///
/// Delivery runs in the background on the current tokio runtime; failures are
/// logged and never reach the attempt that produced the record.
pub struct MailSink {
    from: Mailbox,
    to: Mailbox,
    relay: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    send_timeout: Duration,
}

impl MailSink {
    /// Prepares the relay transport. Nothing is sent or connected yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be used as a mailbox or the relay
    /// TLS parameters cannot be built.
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let from = mailbox(&format!("{SENDER_NAME} <{}>", config.from))?;
        let to = mailbox(&config.to)?;
        let relay = format!("{}:{}", config.smtp_host, config.smtp_port);

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        }
        .map_err(|source| Error::NotifySend {
            relay: relay.clone(),
            source,
        })?;

        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let mailer = builder
            .credentials(credentials)
            .port(config.smtp_port)
            .timeout(Some(config.send_timeout))
            .build();

        Ok(Self {
            from,
            to,
            relay,
            mailer,
            send_timeout: config.send_timeout,
        })
    }

    /// Builds the notification for `record` without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotifyCompose`] if the message cannot be assembled.
    pub fn compose(&self, record: &AttemptRecord) -> Result<Message> {
        let (subject, body) = report(record);
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| Error::NotifyCompose {
                message: e.to_string(),
            })
    }

    /// Composes and delivers the notification for `record`, waiting for the relay.
    ///
    /// # Errors
    ///
    /// Returns an error if composing fails, the relay refuses the message, or
    /// delivery exceeds the send timeout.
    #[instrument(
        name = "MailSink::send",
        skip_all,
        fields(account = %record.account, relay = %self.relay)
    )]
    pub async fn send(&self, record: &AttemptRecord) -> Result<()> {
        let message = self.compose(record)?;
        deliver(self.mailer.clone(), message, self.relay.clone(), self.send_timeout).await
    }
}

impl std::fmt::Debug for MailSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSink")
            .field("from", &self.from.to_string())
            .field("to", &self.to.to_string())
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

impl OutcomeSink for MailSink {
    fn record(&self, record: &AttemptRecord) {
        let message = match self.compose(record) {
            Ok(message) => message,
            Err(e) => {
                warn!(account = %record.account, error = %e, "Owner notification not composed");
                return;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let account = record.account.clone();
                let delivery =
                    deliver(self.mailer.clone(), message, self.relay.clone(), self.send_timeout);
                handle.spawn(async move {
                    if let Err(e) = delivery.await {
                        warn!(%account, error = %e, "Owner notification not delivered");
                    }
                });
            }
            Err(_) => {
                warn!(
                    account = %record.account,
                    "MailSink used outside of tokio runtime context. Notification dropped."
                );
            }
        }
    }
}

async fn deliver(
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    message: Message,
    relay: String,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, mailer.send(message)).await {
        Ok(Ok(response)) => {
            debug!(%relay, code = %response.code(), "Owner notified");
            Ok(())
        }
        Ok(Err(source)) => Err(Error::NotifySend { relay, source }),
        Err(_) => Err(Error::ConnectTimeout {
            target: relay,
            timeout,
        }),
    }
}

fn mailbox(raw: &str) -> Result<Mailbox> {
    raw.parse().map_err(|e| Error::NotifyCompose {
        message: format!("invalid mailbox '{raw}': {e}"),
    })
}

/// Subject and plain-text body describing one attempt.
fn report(record: &AttemptRecord) -> (String, String) {
    let subject = match record.outcome {
        Outcome::Succeeded => format!("Password restored for {}", record.account),
        Outcome::Failed(reason) => {
            format!("Password reset failed for {} ({reason})", record.account)
        }
    };

    let mut body = String::new();
    let _ = writeln!(body, "Account: {}", record.account);
    let _ = writeln!(body, "Notice UID: {}", record.message_id);
    let _ = writeln!(body, "Outcome: {}", record.outcome);
    let _ = writeln!(body, "Step reached: {}", record.step_reached);
    let _ = writeln!(body, "Step executions: {}", record.attempts);
    let _ = writeln!(body, "Started: {}", record.started_at.to_rfc3339());
    let _ = writeln!(body, "Duration: {}s", record.duration.as_secs());
    if let Some(error) = &record.last_error {
        let _ = writeln!(body, "Last error: {error}");
    }
    if record.outcome != Outcome::Succeeded {
        body.push('\n');
        body.push_str("The password may still be the one somebody else set.\n");
        body.push_str("Sign in and change it by hand.\n");
    }

    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::orchestrator::ResetStep;
    use chrono::{TimeZone, Utc};

    fn config() -> NotifyConfig {
        NotifyConfig::builder()
            .smtp_host("localhost")
            .username("sentinel@example.com")
            .password("secret")
            .to("owner@example.com")
            .build()
            .unwrap()
    }

    fn record(outcome: Outcome) -> AttemptRecord {
        AttemptRecord {
            account: "owner@example.com".into(),
            message_id: 42,
            outcome,
            step_reached: match outcome {
                Outcome::Succeeded => ResetStep::Succeeded,
                Outcome::Failed(_) => ResetStep::ChallengeCheck,
            },
            attempts: 3,
            last_error: match outcome {
                Outcome::Succeeded => None,
                Outcome::Failed(_) => Some("challenge unanswered after 5 polls".into()),
            },
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            duration: Duration::from_secs(95),
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = config();
        assert_eq!(config.smtp_port, 465);
        assert_eq!(config.sender(), "sentinel@example.com");
        assert_eq!(config.recipient(), "owner@example.com");
        assert!(!format!("{config:?}").contains("secret"));

        let starttls = NotifyConfig::builder()
            .smtp_host("smtp.example.com")
            .username("sentinel@example.com")
            .password("secret")
            .to("owner@example.com")
            .starttls(true)
            .build()
            .unwrap();
        assert_eq!(starttls.smtp_port, 587);
    }

    #[test]
    fn test_builder_rejects_missing_and_invalid() {
        let missing_to = NotifyConfig::builder()
            .smtp_host("smtp.example.com")
            .username("sentinel@example.com")
            .password("secret")
            .build();
        assert!(matches!(missing_to, Err(Error::InvalidConfig { .. })));

        let bad_to = NotifyConfig::builder()
            .smtp_host("smtp.example.com")
            .username("sentinel@example.com")
            .password("secret")
            .to("not-an-address")
            .build();
        assert!(matches!(bad_to, Err(Error::InvalidEmailFormat { .. })));
    }

    #[test]
    fn test_from_lookup() {
        let vars = [
            ("SENTINEL_SMTP_HOST", "smtp.example.com"),
            ("SENTINEL_SMTP_PORT", "2525"),
            ("SENTINEL_SMTP_STARTTLS", "true"),
            ("SENTINEL_SMTP_USERNAME", "relay-user@example.com"),
            ("SENTINEL_SMTP_PASSWORD", "secret"),
            ("SENTINEL_NOTIFY_FROM", "sentinel@example.com"),
            ("SENTINEL_NOTIFY_TO", "owner@example.com"),
        ];
        let lookup = |name: &str| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        };

        let config = NotifyConfig::from_lookup(lookup).unwrap().unwrap();
        assert_eq!(config.smtp_host, "smtp.example.com");
        assert_eq!(config.smtp_port, 2525);
        assert!(config.starttls);
        assert_eq!(config.sender(), "sentinel@example.com");

        assert!(NotifyConfig::from_lookup(|_| None).unwrap().is_none());
    }

    #[test]
    fn test_failure_report_tells_owner_to_act() {
        let (subject, body) = report(&record(Outcome::Failed(FailureReason::ChallengeTimeout)));
        assert_eq!(
            subject,
            "Password reset failed for owner@example.com (challenge_timeout)"
        );
        assert!(body.contains("Step reached: challenge_check"));
        assert!(body.contains("Last error: challenge unanswered after 5 polls"));
        assert!(body.contains("change it by hand"));
    }

    #[test]
    fn test_success_report() {
        let (subject, body) = report(&record(Outcome::Succeeded));
        assert_eq!(subject, "Password restored for owner@example.com");
        assert!(body.contains("Notice UID: 42"));
        assert!(body.contains("Duration: 95s"));
        assert!(!body.contains("Last error"));
        assert!(!body.contains("by hand"));
    }

    #[test]
    fn test_compose_addresses_owner() {
        let sink = MailSink::new(&config()).unwrap();
        let message = sink.compose(&record(Outcome::Succeeded)).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("To: owner@example.com"), "{raw}");
        assert!(raw.contains("sentinel@example.com"), "{raw}");
        assert!(raw.contains("Subject: Password restored for owner@example.com"), "{raw}");
    }

    #[test]
    fn test_record_outside_runtime_is_dropped() {
        let sink = MailSink::new(&config()).unwrap();
        sink.record(&record(Outcome::Succeeded));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_send_error() {
        // Grab a free port, then close it again
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = NotifyConfig::builder()
            .smtp_host("localhost")
            .smtp_port(port)
            .username("sentinel@example.com")
            .password("secret")
            .to("owner@example.com")
            .send_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let sink = MailSink::new(&config).unwrap();

        let err = sink
            .send(&record(Outcome::Failed(FailureReason::AuthFailure)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::NotifySend { .. } | Error::ConnectTimeout { .. }),
            "{err:?}"
        );
        assert!(err.is_retryable());
    }
}
