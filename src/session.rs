//! Internal IMAP session management.
//!
//! Thin wrappers over async-imap commands that map failures onto [`Error`].

use crate::connection::TlsStream;
use crate::error::{Error, Result};
use async_imap::Session;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, instrument};

/// Type alias for IMAP session over TLS.
pub(crate) type ImapSession = Session<TlsStream>;

/// Fetch items: `PEEK` leaves `\Seen` untouched.
const FETCH_ITEMS: &str = "(UID INTERNALDATE FLAGS BODY.PEEK[])";

/// Authenticates to the IMAP server and returns a session.
#[instrument(name = "session::authenticate", skip_all, fields(email = %email))]
pub(crate) async fn authenticate(
    tls_stream: TlsStream,
    email: &str,
    password: &str,
) -> Result<ImapSession> {
    let client = async_imap::Client::new(tls_stream);

    debug!("Authenticating to IMAP server");

    client
        .login(email, password)
        .await
        .map_err(|e| Error::ImapLogin {
            email: email.to_string(),
            source: e.0,
        })
}

/// Selects a mailbox (typically "INBOX").
#[instrument(name = "session::select", skip(session), fields(mailbox = %mailbox))]
pub(crate) async fn select_mailbox(session: &mut ImapSession, mailbox: &str) -> Result<()> {
    debug!("Selecting mailbox");

    session
        .select(mailbox)
        .await
        .map_err(|source| Error::SelectMailbox {
            mailbox: mailbox.to_string(),
            source,
        })?;

    Ok(())
}

/// Builds the `UID SEARCH` criteria for messages after `after_uid`.
pub(crate) fn search_query(
    after_uid: u32,
    since_date: Option<NaiveDate>,
    recipient: Option<&str>,
) -> String {
    let mut query = format!("UID {}:*", after_uid.saturating_add(1));
    if let Some(date) = since_date {
        // IMAP SINCE format: "DD-Mon-YYYY" (e.g., "07-Dec-2025")
        query.push_str(&format!(" SINCE {}", date.format("%d-%b-%Y")));
    }
    if let Some(to) = recipient {
        let to: String = to.chars().filter(|c| *c != '"' && *c != '\\').collect();
        query.push_str(&format!(" TO \"{to}\""));
    }
    query
}

/// Searches for UIDs strictly greater than `after_uid`, ascending.
///
/// `n:*` always matches the newest message, so the result is re-filtered.
#[instrument(name = "session::search_after", skip(session, recipient), fields(after_uid))]
pub(crate) async fn search_after(
    session: &mut ImapSession,
    after_uid: u32,
    since_date: Option<NaiveDate>,
    recipient: Option<&str>,
) -> Result<Vec<u32>> {
    // NOOP to ensure we have latest state
    session
        .noop()
        .await
        .map_err(|source| Error::ImapNoop { source })?;

    let query = search_query(after_uid, since_date, recipient);
    let uids = session
        .uid_search(&query)
        .await
        .map_err(|source| Error::ImapSearch { source })?;

    let mut uids: Vec<u32> = uids.into_iter().filter(|uid| *uid > after_uid).collect();
    uids.sort_unstable();

    debug!(uid_count = uids.len(), query = %query, "Found messages");

    Ok(uids)
}

/// Formats UIDs as an IMAP sequence set.
pub(crate) fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Fetches messages by UID set without flagging them seen.
///
/// Returns a boxed stream of fetch results.
pub(crate) async fn fetch_messages<'a>(
    session: &'a mut ImapSession,
    uid_set: &str,
) -> Result<BoxStream<'a, std::result::Result<async_imap::types::Fetch, async_imap::error::Error>>>
{
    debug!(uid_set = %uid_set, "Fetching messages");

    let stream = session
        .uid_fetch(uid_set, FETCH_ITEMS)
        .await
        .map_err(|source| Error::ImapFetch {
            uid_range: uid_set.to_string(),
            source,
        })?;

    Ok(stream.boxed())
}

/// Adds `\Seen` to one message.
#[instrument(name = "session::mark_seen", skip(session))]
pub(crate) async fn mark_seen(session: &mut ImapSession, uid: u32) -> Result<()> {
    let updates = session
        .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
        .await
        .map_err(|source| Error::ImapStore { uid, source })?;

    updates
        .try_collect::<Vec<_>>()
        .await
        .map_err(|source| Error::ImapStore { uid, source })?;

    debug!("Flagged message seen");

    Ok(())
}

/// Logs out from IMAP session.
#[instrument(name = "session::logout", skip(session))]
pub(crate) async fn logout(session: &mut ImapSession) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })?;

    Ok(())
}
