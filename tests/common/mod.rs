//! Fakes shared by the integration tests: a scripted mailbox, an in-memory
//! web site behind the `AutomationDriver` trait, a store that can be made to
//! fail, and a scripted code source.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use password_sentinel::classifier::Classifier;
use password_sentinel::clock::ManualClock;
use password_sentinel::{
    AccountConfig, AttemptRecord, AutomationDriver, CodeSource, DriverFactory, Error, MailboxClient,
    MailboxQuery, MemoryStore, Message, OutcomeSink, ResetOrchestrator, Result, SentinelConfig, SiteProfile,
    StateStore, VerificationCode, VerificationCodeService, Watcher,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LOGIN: &str = "owner@example.com";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

pub fn change_notice(id: u32, at: DateTime<Utc>) -> Message {
    Message::new(
        id,
        at,
        "Your password has been changed",
        "The password on your account was just changed.",
    )
    .with_recipient(LOGIN)
}

pub fn newsletter(id: u32, at: DateTime<Utc>) -> Message {
    Message::new(id, at, "New this week", "Three new series are waiting for you.")
        .with_recipient(LOGIN)
}

pub fn code_mail(id: u32, at: DateTime<Utc>, code: &str) -> Message {
    Message::new(
        id,
        at,
        "Your sign-in code",
        format!("Enter this code to sign in: {code}"),
    )
    .with_recipient(LOGIN)
}

// ─────────────────────────────────────────────────────────────────────────────
// Mailbox
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<Vec<Message>>,
    pub seen: Mutex<Vec<u32>>,
}

impl FakeMailbox {
    pub fn deliver(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn fetch_unseen(&self, query: &MailboxQuery) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| query.accepts(m))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn mark_seen(&self, id: u32) -> Result<()> {
        self.seen.lock().unwrap().push(id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Web site
// ─────────────────────────────────────────────────────────────────────────────

pub fn profile() -> SiteProfile {
    SiteProfile {
        login_url: "https://site.test/login".into(),
        login_identifier: "#login-id".into(),
        login_password: "#login-pw".into(),
        login_submit: "#login-go".into(),
        login_error: "#login-error".into(),
        signed_in_marker: "#account-menu".into(),
        challenge_prompt: "#otp-prompt".into(),
        code_input: "#otp".into(),
        code_submit: "#otp-go".into(),
        code_error: "#otp-error".into(),
        change_password_url: "https://site.test/password".into(),
        change_password_path: "/password".into(),
        current_password: "#pw-current".into(),
        new_password: "#pw-new".into(),
        confirm_password: "#pw-confirm".into(),
        sign_out_everywhere: Some("#signout-all".into()),
        change_submit: "#pw-save".into(),
        password_reused_error: "#pw-reused".into(),
        success_url_fragment: "account?confirm=password".into(),
        success_banner: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Blank,
    Login,
    LoginFailed,
    Challenge,
    ChallengeFailed,
    Home,
    ChangeForm,
    ChangeReused,
    Success,
}

impl Page {
    fn url(self) -> &'static str {
        match self {
            Page::Blank => "about:blank",
            Page::Login | Page::LoginFailed => "https://site.test/login",
            Page::Challenge | Page::ChallengeFailed => "https://site.test/login/verify",
            Page::Home => "https://site.test/browse",
            Page::ChangeForm | Page::ChangeReused => "https://site.test/password",
            Page::Success => "https://site.test/account?confirm=password",
        }
    }

    fn elements(self) -> &'static [&'static str] {
        match self {
            Page::Blank => &[],
            Page::Login => &["#login-id", "#login-pw", "#login-go"],
            Page::LoginFailed => &["#login-id", "#login-pw", "#login-go", "#login-error"],
            Page::Challenge => &["#otp-prompt", "#otp", "#otp-go"],
            Page::ChallengeFailed => &["#otp-prompt", "#otp", "#otp-go", "#otp-error"],
            Page::Home | Page::Success => &["#account-menu"],
            Page::ChangeForm => &[
                "#account-menu",
                "#pw-current",
                "#pw-new",
                "#pw-confirm",
                "#signout-all",
                "#pw-save",
            ],
            Page::ChangeReused => &[
                "#account-menu",
                "#pw-current",
                "#pw-new",
                "#pw-confirm",
                "#signout-all",
                "#pw-save",
                "#pw-reused",
            ],
        }
    }
}

/// Server-side state of the fake site, shared by every browser session.
#[derive(Debug)]
pub struct SiteState {
    pub password: String,
    pub page: Page,
    pub signed_in: bool,
    /// When set, sign-in asks for this code.
    pub challenge_code: Option<String>,
    /// The next N navigations hang.
    pub navigate_hangs: u32,
    /// The next N navigations to the change form hang.
    pub change_form_hangs: u32,
    /// Every navigation takes this long.
    pub latency: Duration,
    pub panic_on_save: bool,
    pub fields: HashMap<String, String>,
    pub submitted_codes: Vec<String>,
    pub password_history: Vec<String>,
    pub signed_out_everywhere: bool,
}

#[derive(Clone)]
pub struct FakeSite {
    pub state: Arc<Mutex<SiteState>>,
    pub opens: Arc<AtomicU32>,
    pub closes: Arc<AtomicU32>,
}

impl FakeSite {
    pub fn with_password(password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SiteState {
                password: password.to_string(),
                page: Page::Blank,
                signed_in: false,
                challenge_code: None,
                navigate_hangs: 0,
                change_form_hangs: 0,
                latency: Duration::ZERO,
                panic_on_save: false,
                fields: HashMap::new(),
                submitted_codes: Vec::new(),
                password_history: Vec::new(),
                signed_out_everywhere: false,
            })),
            opens: Arc::new(AtomicU32::new(0)),
            closes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn edit(&self, f: impl FnOnce(&mut SiteState)) {
        f(&mut *self.state.lock().unwrap());
    }

    pub fn password(&self) -> String {
        self.state.lock().unwrap().password.clone()
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverFactory for FakeSite {
    async fn open(&self) -> Result<Box<dyn AutomationDriver>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.page = Page::Blank;
        state.signed_in = false;
        state.fields.clear();
        Ok(Box::new(FakeBrowser {
            state: Arc::clone(&self.state),
            closes: Arc::clone(&self.closes),
        }))
    }
}

pub struct FakeBrowser {
    state: Arc<Mutex<SiteState>>,
    closes: Arc<AtomicU32>,
}

impl FakeBrowser {
    fn visible(&self, selector: &str) -> bool {
        let page = self.state.lock().unwrap().page;
        selector
            .split(", ")
            .any(|part| page.elements().contains(&part))
    }

    fn missing(selector: &str) -> Error {
        Error::ElementMissing {
            selector: selector.to_string(),
        }
    }
}

#[async_trait]
impl AutomationDriver for FakeBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        let (hang, latency) = {
            let mut state = self.state.lock().unwrap();
            let hang = if state.navigate_hangs > 0 {
                state.navigate_hangs -= 1;
                true
            } else if url.ends_with("/password") && state.change_form_hangs > 0 {
                state.change_form_hangs -= 1;
                true
            } else {
                false
            };
            (hang, state.latency)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.page = if url.ends_with("/login") {
            Page::Login
        } else if url.ends_with("/password") && state.signed_in {
            Page::ChangeForm
        } else if url.ends_with("/password") {
            Page::Login
        } else {
            Page::Blank
        };
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        if self.visible(selector) {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.visible(selector))
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        if !self.visible(selector) {
            return Err(Self::missing(selector));
        }
        self.state
            .lock()
            .unwrap()
            .fields
            .insert(selector.to_string(), text.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        if !self.visible(selector) {
            return Err(Self::missing(selector));
        }

        let mut state = self.state.lock().unwrap();

        match selector {
            "#login-go" => {
                if field(&state, "#login-pw") != state.password {
                    state.page = Page::LoginFailed;
                } else if state.challenge_code.is_some() {
                    state.page = Page::Challenge;
                } else {
                    state.signed_in = true;
                    state.page = Page::Home;
                }
            }
            "#otp-go" => {
                let code = field(&state, "#otp");
                state.submitted_codes.push(code.clone());
                if state.challenge_code.as_deref() == Some(code.as_str()) {
                    state.signed_in = true;
                    state.page = Page::Home;
                } else {
                    state.page = Page::ChallengeFailed;
                }
            }
            "#signout-all" => state.signed_out_everywhere = true,
            "#pw-save" => {
                if state.panic_on_save {
                    drop(state);
                    panic!("browser crashed on save");
                }
                let current = field(&state, "#pw-current");
                let new = field(&state, "#pw-new");
                let confirm = field(&state, "#pw-confirm");
                if current != state.password || new != confirm {
                    state.page = Page::ChangeForm;
                } else if new == state.password {
                    state.page = Page::ChangeReused;
                } else {
                    let old = std::mem::replace(&mut state.password, new);
                    state.password_history.push(old);
                    state.page = Page::Success;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().page.url().to_string())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn field(state: &SiteState, name: &str) -> String {
    state.fields.get(name).cloned().unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Code source
// ─────────────────────────────────────────────────────────────────────────────

/// Hands out queued codes regardless of `not_before`, then times out.
#[derive(Default)]
pub struct ScriptedCodes {
    codes: Mutex<VecDeque<VerificationCode>>,
    pub calls: AtomicU32,
}

impl ScriptedCodes {
    pub fn push(&self, code: &str, received_at: DateTime<Utc>, message_id: u32) {
        self.codes.lock().unwrap().push_back(VerificationCode {
            code: code.to_string(),
            received_at,
            message_id,
        });
    }
}

#[async_trait]
impl CodeSource for ScriptedCodes {
    async fn fetch_code(
        &self,
        _account: &str,
        _not_before: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<VerificationCode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.codes.lock().unwrap().pop_front() {
            Some(code) => Ok(code),
            None => Err(Error::CodeTimedOut { timeout }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// `MemoryStore` whose watermark writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Number of `advance` calls that still succeed; `None` never fails.
    pub advances_left: Mutex<Option<u32>>,
    /// Keys passed to `increment`, in order.
    pub increments: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn fail_after_advances(&self, n: u32) {
        *self.advances_left.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.advances_left.lock().unwrap() = None;
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        self.increments.lock().unwrap().push(key.to_string());
        self.inner.increment(key, ttl).await
    }

    async fn advance(&self, key: &str, value: u64) -> Result<u64> {
        {
            let mut left = self.advances_left.lock().unwrap();
            match left.as_mut() {
                Some(0) => {
                    return Err(Error::StateStore {
                        operation: "advance".into(),
                        source: "disk I/O error".into(),
                    })
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.inner.advance(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_acquire_lock(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.inner.release(key, owner).await
    }
}

/// `MemoryStore` whose cooldown writes take `delay` to land.
pub struct SlowCooldownStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

#[async_trait]
impl StateStore for SlowCooldownStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        if key.ends_with(".cooldown_until") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        self.inner.increment(key, ttl).await
    }

    async fn advance(&self, key: &str, value: u64) -> Result<u64> {
        self.inner.advance(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_acquire_lock(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.inner.release(key, owner).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome sink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<AttemptRecord>>,
}

impl OutcomeSink for RecordingSink {
    fn record(&self, record: &AttemptRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

pub fn config(account: AccountConfig) -> Arc<SentinelConfig> {
    Arc::new(
        SentinelConfig::builder()
            .account(account)
            .site(profile())
            .skip_backlog(false)
            .build()
            .unwrap(),
    )
}

pub struct Harness {
    pub config: Arc<SentinelConfig>,
    pub clock: ManualClock,
    pub mailbox: Arc<FakeMailbox>,
    pub store: Arc<dyn StateStore>,
    pub site: FakeSite,
    pub codes: Arc<dyn CodeSource>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Arc<ResetOrchestrator>,
}

impl Harness {
    /// Wires everything; without `codes` a real `VerificationCodeService`
    /// reads the fake mailbox.
    pub fn new(
        config: Arc<SentinelConfig>,
        site: FakeSite,
        store: Arc<dyn StateStore>,
        codes: Option<Arc<dyn CodeSource>>,
    ) -> Self {
        let clock = ManualClock::new(t0());
        let mailbox = Arc::new(FakeMailbox::default());
        let codes = codes.unwrap_or_else(|| {
            Arc::new(VerificationCodeService::new(
                Arc::clone(&mailbox) as Arc<dyn MailboxClient>,
                Arc::new(Classifier::default()),
                Arc::new(clock.clone()),
                Duration::from_secs(2),
            )) as Arc<dyn CodeSource>
        });
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Arc::new(
            ResetOrchestrator::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::new(site.clone()),
                Arc::clone(&codes),
            )
            .with_clock(Arc::new(clock.clone()))
            .with_sink(Arc::clone(&sink) as Arc<dyn OutcomeSink>),
        );
        Self {
            config,
            clock,
            mailbox,
            store,
            site,
            codes,
            sink,
            orchestrator,
        }
    }

    pub fn watcher(&self) -> Watcher {
        Watcher::new(
            Arc::clone(&self.config),
            Arc::clone(&self.mailbox) as Arc<dyn MailboxClient>,
            Arc::clone(&self.store),
            Arc::new(Classifier::default()),
            Arc::clone(&self.orchestrator),
        )
    }

    pub fn account(&self) -> &AccountConfig {
        &self.config.accounts()[0]
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.sink.records.lock().unwrap().clone()
    }

    pub async fn key(&self, suffix: &str) -> Option<String> {
        self.store
            .get(&format!("{LOGIN}.{suffix}"))
            .await
            .unwrap()
    }
}
