//! Error types for the password-sentinel crate.
//!
//! All errors implement [`std::error::Error`] and provide context about what went wrong.
//! Errors are categorized by their retryability - see [`Error::is_retryable`].
//!
//! Reset attempts never surface their step failures as [`Error`]s: the orchestrator
//! folds them into a terminal [`FailureReason`]. The only error that escapes a watch
//! cycle is [`Error::StateStore`], which aborts the cycle without advancing the watermark.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used by storage backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while watching a mailbox or driving a reset.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid email address format.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// A classification rule pattern failed to compile.
    #[error("invalid pattern '{pattern}'")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network / connection errors (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors (mixed retryability)
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox authentication timeout.
    #[error("authentication timeout for {email} after {timeout:?}")]
    AuthTimeout {
        /// The email address used for authentication.
        email: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox selection timeout.
    #[error("mailbox selection timeout for '{mailbox}' after {timeout:?}")]
    SelectTimeout {
        /// The mailbox name.
        mailbox: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// UID search timeout.
    #[error("UID search timeout after {timeout:?}")]
    SearchTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Message fetch timeout.
    #[error("message fetch timeout for UID range {uid_range} after {timeout:?}")]
    FetchTimeout {
        /// The UID range being fetched.
        uid_range: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Flag update timeout.
    #[error("flag update timeout for UID {uid} after {timeout:?}")]
    FlagTimeout {
        /// The message UID.
        uid: u32,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// A browser step did not complete in time.
    #[error("browser step '{action}' timed out after {timeout:?}")]
    DriverTimeout {
        /// The driver action that timed out.
        action: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// No verification code arrived before the deadline.
    #[error("no verification code received after {timeout:?}")]
    CodeTimedOut {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors (RETRYABLE - could be transient server issues)
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP login failed.
    #[error("IMAP login failed for {email}")]
    ImapLogin {
        /// The email address used for login.
        email: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to select mailbox.
    #[error("failed to select mailbox '{mailbox}'")]
    SelectMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP NOOP failed.
    #[error("IMAP NOOP command failed")]
    ImapNoop {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP search failed.
    #[error("IMAP search failed")]
    ImapSearch {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for UID range {uid_range}")]
    ImapFetch {
        /// The UID range that failed.
        uid_range: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to fetch message from stream.
    #[error("failed to fetch message from stream")]
    FetchMessage {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP STORE (flag update) failed.
    #[error("IMAP flag update failed for UID {uid}")]
    ImapStore {
        /// The message UID.
        uid: u32,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Browser automation errors (mixed retryability)
    // ─────────────────────────────────────────────────────────────────────────
    /// Could not open a browser session.
    #[error("failed to open browser session: {message}")]
    DriverSession {
        /// Description from the automation engine.
        message: String,
    },

    /// Transport-level driver failure (connection dropped, remote end reset).
    #[error("browser step '{action}' failed: {message}")]
    DriverTransport {
        /// The driver action that failed.
        action: String,
        /// Description from the automation engine.
        message: String,
    },

    /// A required page element is absent.
    #[error("element '{selector}' not found")]
    ElementMissing {
        /// The selector that matched nothing.
        selector: String,
    },

    /// The page is not the one the flow expected.
    #[error("unexpected page: expected {expected}, at {actual}")]
    UnexpectedPage {
        /// What the flow was waiting for.
        expected: String,
        /// The URL the browser is actually on.
        actual: String,
    },

    /// The browser session was used after being closed.
    #[error("browser session already closed")]
    DriverClosed,

    /// The site refused the sign-in credentials.
    #[error("sign-in rejected for {login}")]
    CredentialsRejected {
        /// The sign-in identifier.
        login: String,
    },

    /// No fresh verification code was accepted within the poll bound.
    #[error("challenge unanswered after {polls} polls")]
    ChallengeUnanswered {
        /// Code lookups performed.
        polls: u32,
    },

    /// A watch cycle panicked; resources were released before unwinding.
    #[error("watch cycle for {account} panicked")]
    CyclePanicked {
        /// The account whose cycle panicked.
        account: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Owner notification errors
    // ─────────────────────────────────────────────────────────────────────────
    /// An owner notification could not be built.
    #[error("failed to compose notification: {message}")]
    NotifyCompose {
        /// What was wrong with the message.
        message: String,
    },

    /// The SMTP relay did not take an owner notification.
    #[error("failed to send notification through {relay}")]
    NotifySend {
        /// The relay host.
        relay: String,
        /// The underlying SMTP error.
        #[source]
        source: lettre::transport::smtp::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Email parsing errors (NOT retryable - malformed content won't change)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to parse email message.
    #[error("failed to parse email")]
    ParseEmail {
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    /// Failed to extract email body.
    #[error("failed to extract email body")]
    ExtractBody {
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // State store errors (fatal for the current cycle)
    // ─────────────────────────────────────────────────────────────────────────
    /// The state store could not serve a request.
    #[error("state store unavailable during {operation}")]
    StateStore {
        /// The store operation that failed.
        operation: String,
        /// The underlying backend error.
        #[source]
        source: BoxError,
    },

    /// A stored value could not be decoded.
    #[error("corrupt state value for key '{key}': {value}")]
    CorruptState {
        /// The key holding the value.
        key: String,
        /// The raw value.
        value: String,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    ///
    /// The orchestrator retries these in place with exponential backoff; everything else
    /// escalates to a terminal failure immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            // RETRYABLE errors: network, connection timeouts, IMAP operations, flaky browser steps
            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::SearchTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::FlagTimeout { .. }
            | Error::DriverTimeout { .. }
            | Error::ImapLogin { .. }
            | Error::SelectMailbox { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::FetchMessage { .. }
            | Error::ImapStore { .. }
            | Error::DriverSession { .. }
            | Error::DriverTransport { .. }
            | Error::NotifySend { .. } => true,

            // NOT retryable: config errors, structural page errors, parsing, state store
            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidPattern { .. }
            | Error::InvalidDnsName { .. }
            | Error::CodeTimedOut { .. }
            | Error::ImapLogout { .. }
            | Error::ElementMissing { .. }
            | Error::UnexpectedPage { .. }
            | Error::DriverClosed
            | Error::CredentialsRejected { .. }
            | Error::ChallengeUnanswered { .. }
            | Error::CyclePanicked { .. }
            | Error::NotifyCompose { .. }
            | Error::ParseEmail { .. }
            | Error::ExtractBody { .. }
            | Error::StateStore { .. }
            | Error::CorruptState { .. } => false,
        }
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidPattern { .. }
            | Error::InvalidDnsName { .. }
            | Error::NotifyCompose { .. } => ErrorCategory::Configuration,

            Error::TcpConnect { .. } | Error::TlsConnect { .. } | Error::NotifySend { .. } => {
                ErrorCategory::Network
            }

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::SearchTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::FlagTimeout { .. }
            | Error::DriverTimeout { .. } => ErrorCategory::Timeout,

            Error::ImapLogin { .. }
            | Error::SelectMailbox { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::FetchMessage { .. }
            | Error::ImapStore { .. }
            | Error::ImapLogout { .. } => ErrorCategory::Protocol,

            Error::DriverSession { .. }
            | Error::DriverTransport { .. }
            | Error::ElementMissing { .. }
            | Error::UnexpectedPage { .. }
            | Error::DriverClosed
            | Error::CredentialsRejected { .. }
            | Error::CyclePanicked { .. } => ErrorCategory::Automation,

            Error::ParseEmail { .. } | Error::ExtractBody { .. } => ErrorCategory::Parse,

            Error::StateStore { .. } | Error::CorruptState { .. } => ErrorCategory::State,

            Error::CodeTimedOut { .. } | Error::ChallengeUnanswered { .. } => {
                ErrorCategory::NotFound
            }
        }
    }

    /// Returns `true` if this error means the state store could not be trusted.
    #[must_use]
    pub fn is_state_failure(&self) -> bool {
        self.category() == ErrorCategory::State
    }

    pub(crate) fn state(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::StateStore {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// IMAP protocol errors.
    Protocol,
    /// Browser automation errors.
    Automation,
    /// Email parsing errors.
    Parse,
    /// State store errors.
    State,
    /// Nothing matching arrived.
    NotFound,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Automation => write!(f, "automation"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::State => write!(f, "state"),
            ErrorCategory::NotFound => write!(f, "not_found"),
        }
    }
}

/// Why a reset attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Could not sign in (bad credentials, or transient errors past the retry bound).
    AuthFailure,
    /// The secondary verification step never accepted a fresh code.
    ChallengeTimeout,
    /// A page was missing elements or redirected somewhere unexpected.
    UnexpectedPageState,
    /// The post-condition after submitting the new password did not hold.
    ConfirmationFailed,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::AuthFailure => write!(f, "auth_failure"),
            FailureReason::ChallengeTimeout => write!(f, "challenge_timeout"),
            FailureReason::UnexpectedPageState => write!(f, "unexpected_page_state"),
            FailureReason::ConfirmationFailed => write!(f, "confirmation_failed"),
        }
    }
}
