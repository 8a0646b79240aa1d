//! Example: Look up the latest verification code for an account.
//!
//! Prints the newest code from the last 15 minutes, or waits up to a minute
//! for a fresh one with `--wait`.
//!
//! # Usage
//!
//! ```bash
//! export SENTINEL_IMAP_EMAIL="owner@example.com"
//! export SENTINEL_IMAP_PASSWORD="your-app-password"
//! # Optional: only consider mail addressed to this recipient
//! export SENTINEL_CODE_RECIPIENT="alias@example.com"
//!
//! cargo run --example fetch_code
//! cargo run --example fetch_code -- --wait
//! ```

use chrono::Utc;
use password_sentinel::classifier::Classifier;
use password_sentinel::clock::SystemClock;
use password_sentinel::{CodeSource, Error, ImapMailbox, MailboxConfig, VerificationCodeService};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT: &str = "demo";

#[tokio::main]
async fn main() -> password_sentinel::Result<()> {
    dotenvy::dotenv().ok();
    let email =
        env::var("SENTINEL_IMAP_EMAIL").expect("SENTINEL_IMAP_EMAIL environment variable required");
    let password = env::var("SENTINEL_IMAP_PASSWORD")
        .expect("SENTINEL_IMAP_PASSWORD environment variable required");
    let wait = env::args().any(|arg| arg == "--wait");

    let config = MailboxConfig::builder()
        .email(&email)
        .password(password)
        .build()?;
    let mailbox = Arc::new(ImapMailbox::connect(config).await?);
    println!("Connected to {}", mailbox.email());

    let codes = VerificationCodeService::new(
        Arc::clone(&mailbox) as Arc<dyn password_sentinel::MailboxClient>,
        Arc::new(Classifier::default()),
        Arc::new(SystemClock),
        Duration::from_secs(5),
    )
    .with_recipient(ACCOUNT, env::var("SENTINEL_CODE_RECIPIENT").ok());

    if wait {
        println!("Waiting for a new code (request one now)...");
        match codes
            .fetch_code(ACCOUNT, Utc::now(), Duration::from_secs(60))
            .await
        {
            Ok(code) => println!("Got code: {} (message {})", code.code, code.message_id),
            Err(Error::CodeTimedOut { timeout }) => println!("No code within {timeout:?}"),
            Err(e) => return Err(e),
        }
    } else {
        match codes
            .latest_code(ACCOUNT, Duration::from_secs(15 * 60))
            .await?
        {
            Some(code) => println!(
                "Latest code: {} (received {})",
                code.code, code.received_at
            ),
            None => println!("No code in the last 15 minutes"),
        }
    }

    mailbox.logout().await?;
    Ok(())
}
