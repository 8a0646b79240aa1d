//! Mailbox messages and RFC 822 parsing.
//!
//! A [`Message`] is the immutable view of one mailbox entry that the rest of the
//! crate works with. Mailbox adapters produce them; the classifier and the
//! orchestrator only read them.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use tracing::debug;

/// A message fetched from the watched mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Mailbox-unique identifier (the IMAP UID).
    pub id: u32,
    /// When the mailbox received the message.
    pub received_at: DateTime<Utc>,
    /// Decoded subject line.
    pub subject: String,
    /// Text body (plain text preferred, HTML otherwise).
    pub body: String,
    /// Addresses from the `To` and `Delivered-To` headers, lowercased.
    pub recipients: Vec<String>,
    /// Whether the mailbox had already flagged the message as seen.
    pub seen: bool,
}

impl Message {
    /// Builds a message from already-decoded parts.
    #[must_use]
    pub fn new(
        id: u32,
        received_at: DateTime<Utc>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id,
            received_at,
            subject: subject.into(),
            body: body.into(),
            recipients: Vec::new(),
            seen: false,
        }
    }

    /// Adds a recipient address.
    #[must_use]
    pub fn with_recipient(mut self, address: impl Into<String>) -> Self {
        self.recipients.push(address.into().to_lowercase());
        self
    }

    /// Parses a raw RFC 822 message.
    ///
    /// `internal_date` is the server-side receive time; when absent the `Date`
    /// header is used, falling back to the Unix epoch so that undated messages
    /// sort first instead of being dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseEmail`] or [`Error::ExtractBody`] for malformed input.
    pub fn from_rfc822(
        id: u32,
        raw: &[u8],
        internal_date: Option<DateTime<Utc>>,
        seen: bool,
    ) -> Result<Self> {
        let parsed = parse_mail(raw).map_err(|source| Error::ParseEmail { source })?;
        let headers = parsed.get_headers();

        let subject = headers.get_first_value("Subject").unwrap_or_default();
        let received_at = internal_date
            .or_else(|| header_date(&parsed))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut recipients = Vec::new();
        for name in ["To", "Delivered-To"] {
            for value in headers.get_all_values(name) {
                recipients.extend(extract_addresses(&value));
            }
        }

        let body = extract_body_text(&parsed).map_err(|source| Error::ExtractBody { source })?;

        debug!(uid = id, subject = %subject, "Parsed message");

        Ok(Self {
            id,
            received_at,
            subject,
            body,
            recipients,
            seen,
        })
    }

    /// Returns `true` if the message was addressed to `address` (case-insensitive).
    #[must_use]
    pub fn is_addressed_to(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        self.recipients.iter().any(|r| *r == address)
    }
}

fn header_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let value = parsed.get_headers().get_first_value("Date")?;
    let timestamp = mailparse::dateparse(&value).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}

/// Pulls bare addresses out of an address-list header value.
fn extract_addresses(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => vec![info.addr.to_lowercase()],
                mailparse::MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| info.addr.to_lowercase())
                    .collect(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Extracts text content from a parsed email, handling multipart messages.
fn extract_body_text(parsed: &ParsedMail<'_>) -> std::result::Result<String, mailparse::MailParseError> {
    if !parsed.subparts.is_empty() {
        // text/plain first, then text/html
        for wanted in ["text/plain", "text/html"] {
            for part in &parsed.subparts {
                if part.ctype.mimetype.eq_ignore_ascii_case(wanted) {
                    if let Ok(body) = part.get_body() {
                        return Ok(body);
                    }
                }
            }
        }

        if let Some(first_part) = parsed.subparts.first() {
            return extract_body_text(first_part);
        }
    }

    parsed.get_body()
}
