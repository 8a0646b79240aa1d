//! TCP + TLS transport for the mailbox.
//!
//! The watcher reconnects lazily after every transport error, so the rustls
//! configuration is built once and shared by all connections.

use crate::config::MailboxConfig;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

/// A TLS stream over TCP, used for IMAP communication.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

static CONNECTOR: Lazy<TlsConnector> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(tls_config))
});

/// Opens the TLS transport to the configured IMAP server.
///
/// TCP connect and handshake share the `connect` timeout.
#[instrument(
    name = "connection::establish_tls",
    skip_all,
    fields(imap_host = tracing::field::Empty, target_addr = tracing::field::Empty)
)]
pub(crate) async fn open(config: &MailboxConfig) -> Result<TlsStream> {
    let host = config.effective_imap_host();
    let target = config.server_address();
    let span = tracing::Span::current();
    span.record("imap_host", host.as_str());
    span.record("target_addr", target.as_str());

    let server_name = server_name(&host)?;
    let timeout = config.timeouts.connect;

    tokio::time::timeout(timeout, handshake(server_name, &target))
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target.clone(),
            timeout,
        })?
}

async fn handshake(server_name: ServerName, target: &str) -> Result<TlsStream> {
    let tcp = TcpStream::connect(target)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target.to_string(),
            source,
        })?;
    // IMAP is strictly request/response
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle");
    }

    debug!("Performing TLS handshake");
    CONNECTOR
        .connect(server_name, tcp)
        .await
        .map_err(|source| Error::TlsConnect {
            target: target.to_string(),
            source,
        })
}

/// SNI name of the server.
fn server_name(host: &str) -> Result<ServerName> {
    ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_name_accepts_hostnames() {
        assert!(server_name("imap.example.com").is_ok());
        assert!(matches!(
            server_name(""),
            Err(Error::InvalidDnsName { .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_tcp_error() {
        // Grab a free port, then close it again
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = MailboxConfig::builder()
            .email("owner@example.com")
            .password("secret")
            .imap_host("localhost")
            .imap_port(port)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let err = open(&config).await.unwrap_err();
        assert!(matches!(err, Error::TcpConnect { .. }), "{err:?}");
        assert!(err.is_retryable());
    }
}
