//! Tests against a real IMAP mailbox.
//!
//! These tests require a real IMAP server and are disabled by default.
//! To run them:
//!
//! ```bash
//! # Set environment variables (or put them in .env)
//! export SENTINEL_TEST_EMAIL="your@email.com"
//! export SENTINEL_TEST_PASSWORD="your-app-password"
//! # Optional: explicit server
//! export SENTINEL_TEST_IMAP_HOST="imap.example.com"
//!
//! # Run with the integration-tests feature
//! cargo test --features integration-tests -- --ignored
//! ```

use chrono::Utc;
use password_sentinel::classifier::Classifier;
use password_sentinel::clock::SystemClock;
use password_sentinel::{
    Error, ImapMailbox, MailboxClient, MailboxConfig, MailboxQuery, VerificationCodeService,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Test Configuration Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn get_test_config() -> Option<MailboxConfig> {
    dotenvy::dotenv().ok();
    let email = env::var("SENTINEL_TEST_EMAIL").ok()?;
    let password = env::var("SENTINEL_TEST_PASSWORD").ok()?;

    let mut builder = MailboxConfig::builder()
        .email(email)
        .password(password)
        .lookback(Duration::from_secs(24 * 60 * 60));
    if let Ok(host) = env::var("SENTINEL_TEST_IMAP_HOST") {
        builder = builder.imap_host(host);
    }

    builder.build().ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_connect_and_logout() {
    let config = get_test_config().expect("Test config from environment variables");

    let mailbox = ImapMailbox::connect(config)
        .await
        .expect("Failed to connect");

    assert!(!mailbox.email().is_empty());

    mailbox.logout().await.expect("Failed to logout");
    // A second logout is a no-op
    mailbox.logout().await.expect("Second logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_debug_hides_password() {
    let config = get_test_config().expect("Test config from environment variables");
    let password = env::var("SENTINEL_TEST_PASSWORD").unwrap_or_default();

    let mailbox = ImapMailbox::connect(config)
        .await
        .expect("Failed to connect");

    let debug_str = format!("{mailbox:?}");
    assert!(debug_str.contains("ImapMailbox"));
    assert!(!password.is_empty() && !debug_str.contains(&password));

    mailbox.logout().await.expect("Failed to logout");
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetch Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_fetch_unseen_connects_lazily() {
    let config = get_test_config().expect("Test config from environment variables");
    let mailbox = ImapMailbox::new(config);

    let since = Utc::now() - chrono::Duration::hours(24);
    let messages = mailbox
        .fetch_unseen(&MailboxQuery::after(0).received_since(since))
        .await
        .expect("Failed to fetch");

    for pair in messages.windows(2) {
        assert!(pair[0].id < pair[1].id, "messages come back in UID order");
    }
    for message in &messages {
        assert!(message.received_at >= since);
    }

    mailbox.logout().await.expect("Failed to logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_fetch_after_newest_uid_is_empty() {
    let config = get_test_config().expect("Test config from environment variables");
    let mailbox = ImapMailbox::new(config);

    let messages = mailbox
        .fetch_unseen(&MailboxQuery::after(0))
        .await
        .expect("Failed to fetch");
    let newest = messages.iter().map(|m| m.id).max().unwrap_or(0);

    let after = mailbox
        .fetch_unseen(&MailboxQuery::after(newest))
        .await
        .expect("Failed to fetch");
    assert!(after.iter().all(|m| m.id > newest));

    mailbox.logout().await.expect("Failed to logout");
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_latest_code_lookup() {
    let config = get_test_config().expect("Test config from environment variables");
    let mailbox: Arc<dyn MailboxClient> = Arc::new(ImapMailbox::new(config));

    let codes = VerificationCodeService::new(
        mailbox,
        Arc::new(Classifier::default()),
        Arc::new(SystemClock),
        Duration::from_secs(5),
    );

    // Result depends on whether there are matching emails
    match codes
        .latest_code("live", Duration::from_secs(24 * 60 * 60))
        .await
        .expect("Lookup failed")
    {
        Some(code) => {
            assert!((4..=8).contains(&code.code.len()));
            println!("Latest code: {} (message {})", code.code, code.message_id);
        }
        None => println!("No verification code in the last day"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires intentionally wrong credentials"]
async fn test_invalid_credentials() {
    let config = MailboxConfig::builder()
        .email("test@gmail.com")
        .password("wrong-password")
        .build()
        .expect("valid config structure");

    let result = ImapMailbox::connect(config).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    println!("Connection error: {err}");
    println!("Category: {}", err.category());
}

#[tokio::test]
async fn test_invalid_email_format() {
    let result = MailboxConfig::builder()
        .email("not-an-email")
        .password("password")
        .build();

    assert!(matches!(result, Err(Error::InvalidEmailFormat { .. })));
}

#[tokio::test]
async fn test_missing_required_fields() {
    // Missing email
    let result = MailboxConfig::builder().password("password").build();
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));

    // Missing password
    let result = MailboxConfig::builder().email("test@example.com").build();
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));
}

#[tokio::test]
async fn test_default_server_from_domain() {
    let config = MailboxConfig::builder()
        .email("owner@Example.com")
        .password("password")
        .build()
        .unwrap();

    assert_eq!(config.effective_imap_host(), "imap.example.com");
    assert_eq!(config.server_address(), "imap.example.com:993");
}
