//! Example: Guard every configured account in a loop.
//!
//! Wires the IMAP mailbox, the SQLite state store, the verification code
//! service and a WebDriver-backed browser, then runs one watch cycle per
//! account on a fixed interval.
//!
//! # Usage
//!
//! ```bash
//! export SENTINEL_ACCOUNTS="[owner@example.com|the-password]"
//! export SENTINEL_IMAP_EMAIL="owner@example.com"
//! export SENTINEL_IMAP_PASSWORD="your-app-password"
//! # A running WebDriver server (chromedriver, geckodriver, ...)
//! export WEBDRIVER_URL="http://localhost:9515"
//! # Optional: mail the owner after every attempt
//! export SENTINEL_SMTP_HOST="smtp.gmail.com"
//! export SENTINEL_SMTP_USERNAME="sentinel@gmail.com"
//! export SENTINEL_SMTP_PASSWORD="your-app-password"
//! export SENTINEL_NOTIFY_TO="owner@example.com"
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=password_sentinel=info
//!
//! cargo run --example watch_accounts
//! ```

use password_sentinel::classifier::Classifier;
use password_sentinel::clock::SystemClock;
use password_sentinel::{
    CodeSource, Error, ImapMailbox, MailSink, MailboxClient, NotifyConfig, OutcomeSink,
    ResetOrchestrator, SentinelConfig, SqliteStore, StateStore, TracingSink,
    VerificationCodeService, Watcher, WebDriverFactory,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> password_sentinel::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("password_sentinel=info")),
        )
        .with_target(true)
        .init();

    let config = Arc::new(SentinelConfig::from_env()?);
    let mailbox_config = config.mailbox.clone().ok_or_else(|| Error::InvalidConfig {
        message: "SENTINEL_IMAP_EMAIL is required".into(),
    })?;
    let webdriver_url = env::var("WEBDRIVER_URL").unwrap_or_else(|_| "http://localhost:9515".into());
    let db_path = env::var("SENTINEL_DB").unwrap_or_else(|_| "sentinel.db".into());
    let interval = env::var("SENTINEL_INTERVAL_SECS")
        .ok()
        .and_then(|secs| secs.parse().ok())
        .map_or(Duration::from_secs(60), Duration::from_secs);

    let mailbox: Arc<dyn MailboxClient> = Arc::new(ImapMailbox::new(mailbox_config));
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&db_path).await?);
    let classifier = Arc::new(Classifier::default());

    let codes = config.accounts().iter().fold(
        VerificationCodeService::new(
            Arc::clone(&mailbox),
            Arc::clone(&classifier),
            Arc::new(SystemClock),
            config.code_poll_interval,
        ),
        |codes, account| codes.with_recipient(account.id.clone(), account.mail_filter.clone()),
    );
    let codes: Arc<dyn CodeSource> = Arc::new(codes);

    let mut sinks: Vec<Arc<dyn OutcomeSink>> = vec![Arc::new(TracingSink)];
    if let Some(notify) = NotifyConfig::from_env()? {
        tracing::info!(to = notify.recipient(), "Owner notifications enabled");
        sinks.push(Arc::new(MailSink::new(&notify)?));
    }

    let orchestrator = Arc::new(
        ResetOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::new(WebDriverFactory::new(webdriver_url)),
            codes,
        )
        .with_sink(Arc::new(sinks)),
    );
    let watcher = Watcher::new(Arc::clone(&config), mailbox, store, classifier, orchestrator);

    tracing::info!(
        accounts = config.accounts().len(),
        interval_secs = interval.as_secs(),
        db = %db_path,
        "Sentinel started"
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }

        for (account, result) in watcher.run_all().await {
            match result {
                Ok(report) if report.skipped_backlog => {
                    println!("{account}: first run, watermark at {:?}", report.watermark);
                }
                Ok(report) => {
                    for disposition in &report.dispatched {
                        println!("{account}: {disposition:?}");
                    }
                }
                Err(e) => eprintln!("{account}: cycle failed ({}): {e}", e.category()),
            }
        }
    }
}
