//! Configuration for the sentinel.
//!
//! Use [`SentinelConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use password_sentinel::{AccountConfig, MailboxConfig, SentinelConfig};
//!
//! let config = SentinelConfig::builder()
//!     .mailbox(
//!         MailboxConfig::builder()
//!             .email("owner@example.com")
//!             .password("app-password")
//!             .build()
//!             .expect("valid mailbox"),
//!     )
//!     .account(AccountConfig::new("owner@example.com", "streaming-password"))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.accounts().len(), 1);
//! ```

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::site::SiteProfile;
use email_address::EmailAddress;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Connection settings for the watched mailbox.
///
/// Create using [`MailboxConfig::builder()`].
///
/// The `password` field is stored as a [`SecretString`]; the `email` field is a
/// validated [`EmailAddress`].
#[derive(Clone)]
pub struct MailboxConfig {
    email: EmailAddress,
    password: SecretString,
    /// IMAP server hostname (`imap.<domain>` if not set).
    pub imap_host: Option<String>,
    /// IMAP server port (default: 993 for IMAPS).
    pub imap_port: u16,
    /// Mailbox to watch (default: `INBOX`).
    pub mailbox: String,
    /// Only consider messages received within this window (default: 3 days).
    pub lookback: Duration,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
}

impl std::fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("email", &self.email.as_str())
            .field("password", &"[REDACTED]")
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("mailbox", &self.mailbox)
            .field("lookback", &self.lookback)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl MailboxConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> MailboxConfigBuilder {
        MailboxConfigBuilder::default()
    }

    /// Returns the login address as a string slice.
    #[must_use]
    pub fn email(&self) -> &str {
        self.email.as_str()
    }

    /// Returns the password as a string slice.
    ///
    /// The password is intentionally not directly accessible to prevent accidental logging.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the effective IMAP host, either explicitly configured or derived from the email domain.
    #[must_use]
    pub fn effective_imap_host(&self) -> String {
        match &self.imap_host {
            Some(host) => host.clone(),
            None => format!("imap.{}", self.email.domain().to_lowercase()),
        }
    }

    /// Returns the full IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.effective_imap_host(), self.imap_port)
    }
}

/// Timeouts for individual mailbox operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Timeout for establishing the TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for selecting the mailbox.
    pub select: Duration,
    /// Timeout for UID searches.
    pub search: Duration,
    /// Timeout for fetching message content.
    pub fetch: Duration,
    /// Timeout for flag updates.
    pub flag: Duration,
    /// Timeout for logout.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            select: Duration::from_secs(10),
            search: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
            flag: Duration::from_secs(10),
            logout: Duration::from_secs(5),
        }
    }
}

/// Validates an email address format.
pub(crate) fn validate_email(email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            email: email.to_string(),
        }
    })
}

/// Builder for [`MailboxConfig`].
#[derive(Debug, Default)]
pub struct MailboxConfigBuilder {
    email: Option<String>,
    password: Option<String>,
    imap_host: Option<String>,
    imap_port: Option<u16>,
    mailbox: Option<String>,
    lookback: Option<Duration>,
    timeouts: Option<TimeoutConfig>,
}

impl MailboxConfigBuilder {
    /// Sets the login address (required).
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the password (required). Use an app-specific password where the provider offers one.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the IMAP server hostname explicitly.
    #[must_use]
    pub fn imap_host(mut self, host: impl Into<String>) -> Self {
        self.imap_host = Some(host.into());
        self
    }

    /// Sets the IMAP server port.
    #[must_use]
    pub fn imap_port(mut self, port: u16) -> Self {
        self.imap_port = Some(port);
        self
    }

    /// Sets the mailbox to watch.
    #[must_use]
    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    /// Sets how far back fetches look.
    #[must_use]
    pub fn lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<MailboxConfig> {
        let email_raw = self.email.ok_or_else(|| Error::InvalidConfig {
            message: "mailbox email is required".into(),
        })?;
        let email = validate_email(&email_raw)?;

        let password_raw = self.password.ok_or_else(|| Error::InvalidConfig {
            message: "mailbox password is required".into(),
        })?;

        Ok(MailboxConfig {
            email,
            password: SecretString::from(password_raw),
            imap_host: self.imap_host,
            imap_port: self.imap_port.unwrap_or(993),
            mailbox: self.mailbox.unwrap_or_else(|| "INBOX".into()),
            lookback: self.lookback.unwrap_or(Duration::from_secs(3 * 24 * 60 * 60)),
            timeouts: self.timeouts.unwrap_or_default(),
        })
    }
}

/// One guarded streaming-service account.
#[derive(Clone)]
pub struct AccountConfig {
    /// Identifier used for state keys and log fields (defaults to the login).
    pub id: String,
    /// Sign-in identifier on the site.
    pub login: String,
    password: SecretString,
    login_password: Option<SecretString>,
    /// Only mail addressed here belongs to this account.
    pub mail_filter: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .field("mail_filter", &self.mail_filter)
            .finish_non_exhaustive()
    }
}

impl AccountConfig {
    /// Creates an account whose wanted password is also the one used to sign in.
    ///
    /// If the login looks like an email address it doubles as the mail filter.
    #[must_use]
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        let login = login.into();
        let mail_filter = EmailAddress::is_valid(&login).then(|| login.to_lowercase());
        Self {
            id: login.clone(),
            login,
            password: SecretString::from(password.into()),
            login_password: None,
            mail_filter,
        }
    }

    /// Overrides the identifier used in state keys.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Signs in with `password` while the wanted password is something else
    /// (the co-user's change has already taken effect).
    #[must_use]
    pub fn with_login_password(mut self, password: impl Into<String>) -> Self {
        self.login_password = Some(SecretString::from(password.into()));
        self
    }

    /// Overrides the recipient filter; `None` accepts every message.
    #[must_use]
    pub fn with_mail_filter(mut self, filter: Option<String>) -> Self {
        self.mail_filter = filter.map(|f| f.to_lowercase());
        self
    }

    /// The password the account must end up with.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// The password used to sign in.
    #[must_use]
    pub fn login_password(&self) -> &str {
        self.login_password
            .as_ref()
            .unwrap_or(&self.password)
            .expose_secret()
    }
}

/// Bounds for answering a sign-in challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePolicy {
    /// Code lookups before giving up.
    pub max_polls: u32,
    /// Pause between lookups.
    pub poll_delay: Duration,
    /// How long one lookup waits for mail.
    pub poll_timeout: Duration,
    /// How long before the challenge a code may have arrived and still count.
    pub staleness_window: Duration,
    /// How long to look for the challenge prompt after signing in.
    pub detect_timeout: Duration,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            max_polls: 5,
            poll_delay: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(30),
            staleness_window: Duration::ZERO,
            detect_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration.
///
/// Create using [`SentinelConfig::builder()`] or [`SentinelConfig::from_env()`].
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    accounts: Vec<AccountConfig>,
    /// Mailbox receiving the site's notices.
    pub mailbox: Option<MailboxConfig>,
    /// Bounds for transient step failures.
    pub retry: RetryPolicy,
    /// Bounds for challenge handling.
    pub challenge: ChallengePolicy,
    /// Minimum interval between two resets of one account.
    pub cooldown: Duration,
    /// Expiry of the attempt lock; must exceed the worst-case attempt.
    pub lock_ttl: Duration,
    /// Timeout for one browser step.
    pub step_timeout: Duration,
    /// On first run, mark existing mail handled instead of reacting to it.
    pub skip_backlog: bool,
    /// Interval between mailbox polls of the code service.
    pub code_poll_interval: Duration,
    /// How long after a reset our own change notice is expected.
    pub receipt_window: Duration,
    /// Page map of the site.
    pub site: SiteProfile,
}

impl SentinelConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> SentinelConfigBuilder {
        SentinelConfigBuilder::default()
    }

    /// Configured accounts.
    #[must_use]
    pub fn accounts(&self) -> &[AccountConfig] {
        &self.accounts
    }

    /// Looks up an account by id.
    #[must_use]
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|account| account.id == id)
    }

    /// Upper bound on the duration of one reset attempt.
    ///
    /// Four retried browser steps, the full backoff schedule, and every challenge poll.
    #[must_use]
    pub fn attempt_budget(&self) -> Duration {
        let steps = self
            .step_timeout
            .saturating_mul(self.retry.max_attempts.saturating_mul(4));
        let polls = (self.challenge.poll_timeout + self.challenge.poll_delay)
            .saturating_mul(self.challenge.max_polls);
        steps + self.retry.total_backoff() + polls + self.challenge.detect_timeout
    }

    /// Loads configuration from `SENTINEL_*` environment variables (and a `.env` file if present).
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `SENTINEL_ACCOUNTS` | `[login\|password\|mail_filter]...`, filter optional |
    /// | `SENTINEL_IMAP_EMAIL`, `SENTINEL_IMAP_PASSWORD` | mailbox credentials |
    /// | `SENTINEL_IMAP_HOST`, `SENTINEL_IMAP_PORT`, `SENTINEL_IMAP_MAILBOX` | mailbox location |
    /// | `SENTINEL_COOLDOWN_SECS`, `SENTINEL_LOCK_TTL_SECS`, `SENTINEL_STEP_TIMEOUT_SECS` | attempt timing |
    /// | `SENTINEL_RETRY_MAX_ATTEMPTS`, `SENTINEL_RETRY_BASE_DELAY_SECS` | retry bounds |
    /// | `SENTINEL_CHALLENGE_MAX_POLLS`, `SENTINEL_CHALLENGE_STALENESS_SECS` | challenge bounds |
    /// | `SENTINEL_FORCE` | `true` reacts to notices already in the mailbox on first run |
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result fails validation.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result fails validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();

        let accounts_raw = lookup("SENTINEL_ACCOUNTS").ok_or_else(|| Error::InvalidConfig {
            message: "SENTINEL_ACCOUNTS is required".into(),
        })?;
        for account in parse_accounts(&accounts_raw)? {
            builder = builder.account(account);
        }

        if let Some(email) = lookup("SENTINEL_IMAP_EMAIL") {
            let mut mailbox = MailboxConfig::builder()
                .email(email)
                .password(lookup("SENTINEL_IMAP_PASSWORD").unwrap_or_default());
            if let Some(host) = lookup("SENTINEL_IMAP_HOST") {
                mailbox = mailbox.imap_host(host);
            }
            if let Some(port) = parse_var(&lookup, "SENTINEL_IMAP_PORT")? {
                mailbox = mailbox.imap_port(port);
            }
            if let Some(name) = lookup("SENTINEL_IMAP_MAILBOX") {
                mailbox = mailbox.mailbox(name);
            }
            builder = builder.mailbox(mailbox.build()?);
        }

        if let Some(secs) = parse_var(&lookup, "SENTINEL_COOLDOWN_SECS")? {
            builder = builder.cooldown(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, "SENTINEL_LOCK_TTL_SECS")? {
            builder = builder.lock_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var(&lookup, "SENTINEL_STEP_TIMEOUT_SECS")? {
            builder = builder.step_timeout(Duration::from_secs(secs));
        }

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = parse_var(&lookup, "SENTINEL_RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = attempts;
        }
        if let Some(secs) = parse_var(&lookup, "SENTINEL_RETRY_BASE_DELAY_SECS")? {
            retry.base_delay = Duration::from_secs(secs);
        }
        builder = builder.retry(retry);

        let mut challenge = ChallengePolicy::default();
        if let Some(polls) = parse_var(&lookup, "SENTINEL_CHALLENGE_MAX_POLLS")? {
            challenge.max_polls = polls;
        }
        if let Some(secs) = parse_var(&lookup, "SENTINEL_CHALLENGE_STALENESS_SECS")? {
            challenge.staleness_window = Duration::from_secs(secs);
        }
        builder = builder.challenge(challenge);

        if let Some(force) = parse_var::<bool>(&lookup, "SENTINEL_FORCE")? {
            builder = builder.skip_backlog(!force);
        }

        builder.build()
    }
}

pub(crate) fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| Error::InvalidConfig {
                message: format!("{name} has an invalid value '{raw}'"),
            })
        })
        .transpose()
}

/// Parses `[login|password|filter][login|password]...`.
fn parse_accounts(raw: &str) -> Result<Vec<AccountConfig>> {
    let mut accounts = Vec::new();
    let mut rest = raw.trim();

    while !rest.is_empty() {
        let open = rest.strip_prefix('[').ok_or_else(|| malformed_accounts(rest))?;
        let close = open.find(']').ok_or_else(|| malformed_accounts(rest))?;
        let fields: Vec<&str> = open[..close].split('|').map(str::trim).collect();

        let account = match fields.as_slice() {
            [login, password] => AccountConfig::new(*login, *password),
            [login, password, filter] => AccountConfig::new(*login, *password)
                .with_mail_filter((!filter.is_empty()).then(|| (*filter).to_string())),
            _ => return Err(malformed_accounts(&open[..close])),
        };
        accounts.push(account);
        rest = open[close + 1..].trim_start_matches([',', ' ', '\n']);
    }

    Ok(accounts)
}

fn malformed_accounts(fragment: &str) -> Error {
    Error::InvalidConfig {
        message: format!("malformed account list near '{fragment}'"),
    }
}

/// Builder for [`SentinelConfig`].
#[derive(Debug, Default)]
pub struct SentinelConfigBuilder {
    accounts: Vec<AccountConfig>,
    mailbox: Option<MailboxConfig>,
    retry: Option<RetryPolicy>,
    challenge: Option<ChallengePolicy>,
    cooldown: Option<Duration>,
    lock_ttl: Option<Duration>,
    step_timeout: Option<Duration>,
    skip_backlog: Option<bool>,
    code_poll_interval: Option<Duration>,
    receipt_window: Option<Duration>,
    site: Option<SiteProfile>,
}

impl SentinelConfigBuilder {
    /// Adds a guarded account (at least one is required).
    #[must_use]
    pub fn account(mut self, account: AccountConfig) -> Self {
        self.accounts.push(account);
        self
    }

    /// Sets the mailbox connection.
    #[must_use]
    pub fn mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the challenge policy.
    #[must_use]
    pub fn challenge(mut self, challenge: ChallengePolicy) -> Self {
        self.challenge = Some(challenge);
        self
    }

    /// Sets the staleness window for verification codes.
    #[must_use]
    pub fn staleness_window(mut self, window: Duration) -> Self {
        self.challenge
            .get_or_insert_with(ChallengePolicy::default)
            .staleness_window = window;
        self
    }

    /// Sets the cooldown between resets (default: 10 minutes).
    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Sets the attempt lock expiry (default: 15 minutes).
    #[must_use]
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Sets the timeout of one browser step (default: 24 seconds).
    #[must_use]
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Controls whether the first run skips mail already in the mailbox (default: `true`).
    #[must_use]
    pub fn skip_backlog(mut self, skip: bool) -> Self {
        self.skip_backlog = Some(skip);
        self
    }

    /// Sets the mailbox poll interval of the code service (default: 2 seconds).
    #[must_use]
    pub fn code_poll_interval(mut self, interval: Duration) -> Self {
        self.code_poll_interval = Some(interval);
        self
    }

    /// Sets how long after a reset its receipt notice is expected (default: 30 minutes).
    #[must_use]
    pub fn receipt_window(mut self, window: Duration) -> Self {
        self.receipt_window = Some(window);
        self
    }

    /// Sets the page map.
    #[must_use]
    pub fn site(mut self, site: SiteProfile) -> Self {
        self.site = Some(site);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no account is configured, account ids collide, or
    /// the lock expiry does not cover the worst-case attempt.
    pub fn build(self) -> Result<SentinelConfig> {
        if self.accounts.is_empty() {
            return Err(Error::InvalidConfig {
                message: "at least one account is required".into(),
            });
        }
        for (i, account) in self.accounts.iter().enumerate() {
            if account.login.is_empty() || account.password().is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("account #{} needs a login and a password", i + 1),
                });
            }
            if self.accounts[..i].iter().any(|other| other.id == account.id) {
                return Err(Error::InvalidConfig {
                    message: format!("duplicate account id '{}'", account.id),
                });
            }
        }

        let retry = self.retry.unwrap_or_default();
        if retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "retry.max_attempts must be at least 1".into(),
            });
        }

        let config = SentinelConfig {
            accounts: self.accounts,
            mailbox: self.mailbox,
            retry,
            challenge: self.challenge.unwrap_or_default(),
            cooldown: self.cooldown.unwrap_or(Duration::from_secs(10 * 60)),
            lock_ttl: self.lock_ttl.unwrap_or(Duration::from_secs(15 * 60)),
            step_timeout: self.step_timeout.unwrap_or(Duration::from_secs(24)),
            skip_backlog: self.skip_backlog.unwrap_or(true),
            code_poll_interval: self.code_poll_interval.unwrap_or(Duration::from_secs(2)),
            receipt_window: self.receipt_window.unwrap_or(Duration::from_secs(30 * 60)),
            site: self.site.unwrap_or_default(),
        };

        let budget = config.attempt_budget();
        if config.lock_ttl <= budget {
            return Err(Error::InvalidConfig {
                message: format!(
                    "lock_ttl ({:?}) must exceed the worst-case attempt duration ({budget:?})",
                    config.lock_ttl
                ),
            });
        }

        Ok(config)
    }
}
