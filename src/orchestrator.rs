//! Automated password reset.
//!
//! [`ResetOrchestrator::handle`] takes one "password changed" notice through
//!
//! ```text
//! Idle → Locked(cooldown) → LoggingIn → ChallengeCheck → ChangingPassword → Confirming → Succeeded | Failed
//! ```
//!
//! A notice is only acted on when no cooldown is running and the per-account
//! attempt lock can be taken. Whatever happens afterwards (success, failure,
//! the attempt budget running out, a panic), the browser is closed, the lock
//! released, the cooldown set, the watermark moved past the notice and an
//! [`AttemptRecord`] emitted.
//!
//! Step failures never escape as errors; they become a [`FailureReason`].
//! Only state store failures are returned, since nothing can be recorded
//! reliably without the store.

use crate::clock::{Clock, SystemClock};
use crate::codes::{CodeSource, VerificationCode};
use crate::config::{AccountConfig, SentinelConfig};
use crate::driver::{DriverFactory, DriverSession};
use crate::error::{Error, FailureReason, Result};
use crate::message::Message;
use crate::retry::retry_transient;
use crate::store::{AccountState, StateStore};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Interval between checks while waiting for the change form's verdict.
const VERDICT_POLL: Duration = Duration::from_millis(500);

/// Position in the reset state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetStep {
    /// No attempt running.
    Idle,
    /// Cooldown and lock checks.
    Locked,
    /// Signing in with the known-good credentials.
    LoggingIn,
    /// Detecting and answering a secondary verification step.
    ChallengeCheck,
    /// Submitting the password-change form.
    ChangingPassword,
    /// Checking the post-condition.
    Confirming,
    /// Terminal: password restored.
    Succeeded,
    /// Terminal: gave up.
    Failed,
}

impl ResetStep {
    /// Failure reason when an attempt stops while in this step.
    #[must_use]
    pub fn failure_reason(self) -> FailureReason {
        match self {
            ResetStep::ChallengeCheck => FailureReason::ChallengeTimeout,
            ResetStep::ChangingPassword => FailureReason::UnexpectedPageState,
            ResetStep::Confirming | ResetStep::Succeeded => FailureReason::ConfirmationFailed,
            ResetStep::Idle | ResetStep::Locked | ResetStep::LoggingIn | ResetStep::Failed => {
                FailureReason::AuthFailure
            }
        }
    }
}

impl std::fmt::Display for ResetStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResetStep::Idle => "idle",
            ResetStep::Locked => "locked",
            ResetStep::LoggingIn => "logging_in",
            ResetStep::ChallengeCheck => "challenge_check",
            ResetStep::ChangingPassword => "changing_password",
            ResetStep::Confirming => "confirming",
            ResetStep::Succeeded => "succeeded",
            ResetStep::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Run-scoped state of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetAttempt {
    /// Account being reset.
    pub account: String,
    /// UID of the triggering notice.
    pub message_id: u32,
    /// Step reached so far.
    pub step: ResetStep,
    /// Step executions so far, retries and challenge polls included.
    pub attempts: u32,
    /// Most recent step error.
    pub last_error: Option<String>,
}

/// Terminal result of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The configured password is in place again.
    Succeeded,
    /// The attempt gave up.
    Failed(FailureReason),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed(reason) => write!(f, "failed:{reason}"),
        }
    }
}

/// Structured record of a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Account id.
    pub account: String,
    /// UID of the triggering notice.
    pub message_id: u32,
    /// How it ended.
    pub outcome: Outcome,
    /// Last step entered before the terminal state.
    pub step_reached: ResetStep,
    /// Step executions, retries and challenge polls included.
    pub attempts: u32,
    /// Most recent step error.
    pub last_error: Option<String>,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Wall time spent.
    pub duration: Duration,
}

/// Why a notice did not start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A reset ran recently; no new one before `until`.
    CooldownActive {
        /// End of the cooldown.
        until: DateTime<Utc>,
    },
    /// Another attempt holds the account lock.
    AttemptInProgress,
    /// The notice reports our own successful reset.
    SelfReceipt,
}

/// What [`ResetOrchestrator::handle`] did with a notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No attempt was started.
    Ignored(IgnoreReason),
    /// An attempt ran to a terminal state.
    Completed(AttemptRecord),
}

/// Receives every terminal [`AttemptRecord`].
pub trait OutcomeSink: Send + Sync {
    /// Called once per finished attempt.
    fn record(&self, record: &AttemptRecord);
}

/// Logs records through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn record(&self, record: &AttemptRecord) {
        let duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX);
        match record.outcome {
            Outcome::Succeeded => info!(
                account = %record.account,
                message_id = record.message_id,
                outcome = %record.outcome,
                attempts = record.attempts,
                duration_ms,
                "Password reset succeeded"
            ),
            Outcome::Failed(reason) => error!(
                account = %record.account,
                message_id = record.message_id,
                outcome = %record.outcome,
                reason = %reason,
                step = %record.step_reached,
                attempts = record.attempts,
                last_error = record.last_error.as_deref().unwrap_or(""),
                duration_ms,
                "Password reset failed"
            ),
        }
    }
}

/// Hands every record to each sink in turn.
impl OutcomeSink for Vec<Arc<dyn OutcomeSink>> {
    fn record(&self, record: &AttemptRecord) {
        for sink in self {
            sink.record(record);
        }
    }
}

/// Shared progress of the running attempt, readable after cancellation or panic.
struct Progress(Mutex<ResetAttempt>);

impl Progress {
    fn new(account: &str, message_id: u32) -> Self {
        Self(Mutex::new(ResetAttempt {
            account: account.to_string(),
            message_id,
            step: ResetStep::Locked,
            attempts: 0,
            last_error: None,
        }))
    }

    fn update(&self, f: impl FnOnce(&mut ResetAttempt)) {
        let mut attempt = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *attempt);
    }

    fn enter(&self, step: ResetStep) {
        debug!(%step, "Entering step");
        self.update(|attempt| attempt.step = step);
    }

    fn note_try(&self) {
        self.update(|attempt| attempt.attempts += 1);
    }

    fn note_error(&self, error: &Error) {
        self.update(|attempt| attempt.last_error = Some(error.to_string()));
    }

    fn snapshot(&self) -> ResetAttempt {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// What the change form said after submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeVerdict {
    /// Landed on the success page.
    Confirmed,
    /// The site refuses a previously used password.
    Reused,
    /// Neither within the step timeout.
    Pending,
}

/// Everything one attempt works with.
struct Attempt<'a> {
    account: &'a AccountConfig,
    state: AccountState<'a>,
    progress: Progress,
    session: tokio::sync::Mutex<Option<DriverSession>>,
}

/// Drives resets for every configured account.
pub struct ResetOrchestrator {
    config: Arc<SentinelConfig>,
    store: Arc<dyn StateStore>,
    drivers: Arc<dyn DriverFactory>,
    codes: Arc<dyn CodeSource>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn OutcomeSink>,
}

impl ResetOrchestrator {
    /// Creates an orchestrator using the system clock and a [`TracingSink`].
    #[must_use]
    pub fn new(
        config: Arc<SentinelConfig>,
        store: Arc<dyn StateStore>,
        drivers: Arc<dyn DriverFactory>,
        codes: Arc<dyn CodeSource>,
    ) -> Self {
        Self {
            config,
            store,
            drivers,
            codes,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the outcome sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Reacts to one "password changed" notice for `account`.
    ///
    /// # Errors
    ///
    /// Only state store failures; every other problem ends up in the returned
    /// [`AttemptRecord`].
    #[instrument(
        name = "ResetOrchestrator::handle",
        skip_all,
        fields(account = %account.id, message_id = message.id)
    )]
    pub async fn handle(&self, account: &AccountConfig, message: &Message) -> Result<Disposition> {
        let state = AccountState::new(&*self.store, &account.id);

        if let Some(after) = state.receipt_after().await? {
            let window = to_chrono(self.config.receipt_window);
            if message.received_at > after && message.received_at <= after + window {
                state.clear_receipt().await?;
                info!("Notice is the receipt of our own reset");
                return Ok(Disposition::Ignored(IgnoreReason::SelfReceipt));
            }
            if message.received_at > after + window {
                state.clear_receipt().await?;
            }
        }

        let now = self.clock.now();
        if let Some(until) = state.cooldown_until().await? {
            if now < until {
                info!(%until, "Cooldown active, ignoring notice");
                return Ok(Disposition::Ignored(IgnoreReason::CooldownActive { until }));
            }
        }

        let owner = Uuid::new_v4().to_string();
        if !state.try_lock(&owner, self.config.lock_ttl).await? {
            info!("Another attempt holds the lock, ignoring notice");
            return Ok(Disposition::Ignored(IgnoreReason::AttemptInProgress));
        }
        // A previous holder writes its cooldown before releasing the lock
        match state.cooldown_until().await {
            Ok(Some(until)) if now < until => {
                state.unlock(&owner).await?;
                info!(%until, "Cooldown started while waiting for the lock, ignoring notice");
                return Ok(Disposition::Ignored(IgnoreReason::CooldownActive { until }));
            }
            Ok(_) => {}
            Err(e) => {
                if let Err(unlock) = state.unlock(&owner).await {
                    warn!(error = %unlock, "Failed to release lock after store error");
                }
                return Err(e);
            }
        }

        let attempt = Attempt {
            account,
            state,
            progress: Progress::new(&account.id, message.id),
            session: tokio::sync::Mutex::new(None),
        };
        let started_at = now;
        let started = Instant::now();
        let budget = self.config.attempt_budget();

        let run = AssertUnwindSafe(self.run(&attempt)).catch_unwind();
        let (result, panic) = match tokio::time::timeout(budget, run).await {
            Ok(Ok(result)) => (result, None),
            Ok(Err(payload)) => {
                error!("Reset attempt panicked");
                let step = attempt.progress.snapshot().step;
                (Ok(Outcome::Failed(step.failure_reason())), Some(payload))
            }
            Err(_) => {
                let step = attempt.progress.snapshot().step;
                warn!(%step, budget_secs = budget.as_secs(), "Reset attempt ran out of time");
                attempt.progress.update(|a| {
                    a.last_error = Some(format!("attempt budget of {budget:?} exhausted"));
                });
                (Ok(Outcome::Failed(step.failure_reason())), None)
            }
        };

        let finished = self
            .finish(&attempt, &owner, message, result, started_at, started.elapsed())
            .await;

        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        finished.map(Disposition::Completed)
    }

    /// Terminal bookkeeping; runs on every exit path of an attempt.
    async fn finish(
        &self,
        attempt: &Attempt<'_>,
        owner: &str,
        message: &Message,
        result: Result<Outcome>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Result<AttemptRecord> {
        if let Some(mut session) = attempt.session.lock().await.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close browser session cleanly");
            }
        }

        let (outcome, mut failure) = match result {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                attempt.progress.note_error(&e);
                let step = attempt.progress.snapshot().step;
                (Outcome::Failed(step.failure_reason()), Some(e))
            }
        };

        let state = &attempt.state;
        let cooldown_until = self.clock.now() + to_chrono(self.config.cooldown);
        // The lock goes last: until then a concurrent notice still sees this attempt
        let mut bookkeeping = vec![
            state.set_cooldown_until(cooldown_until).await,
            state.advance_watermark(message.id).await.map(|_| ()),
        ];
        if outcome == Outcome::Succeeded {
            bookkeeping.push(state.expect_receipt(started_at).await);
        }
        bookkeeping.push(state.clear_retries().await);
        bookkeeping.push(state.unlock(owner).await);
        for result in bookkeeping {
            if let Err(e) = result {
                error!(error = %e, "State update after attempt failed");
                failure.get_or_insert(e);
            }
        }

        let snapshot = attempt.progress.snapshot();
        let record = AttemptRecord {
            account: snapshot.account,
            message_id: snapshot.message_id,
            outcome,
            step_reached: snapshot.step,
            attempts: snapshot.attempts,
            last_error: snapshot.last_error,
            started_at,
            duration,
        };
        self.sink.record(&record);

        match failure {
            Some(e) => Err(e),
            None => Ok(record),
        }
    }

    /// The state machine proper. `Err` only for state store failures.
    async fn run(&self, attempt: &Attempt<'_>) -> Result<Outcome> {
        let progress = &attempt.progress;

        progress.enter(ResetStep::LoggingIn);
        if let Err(e) = self.log_in(attempt).await {
            return self.fail(attempt, ResetStep::LoggingIn, e);
        }

        progress.enter(ResetStep::ChallengeCheck);
        {
            let slot = attempt.session.lock().await;
            let Some(session) = slot.as_ref() else {
                return self.fail(attempt, ResetStep::ChallengeCheck, Error::DriverClosed);
            };
            if let Err(e) = self.check_challenge(attempt, session).await {
                return self.fail(attempt, ResetStep::ChallengeCheck, e);
            }
            if let Err(e) = session.require(&self.config.site.signed_in_marker).await {
                progress.note_error(&e);
                warn!(error = %e, "Not signed in after the challenge step");
                return Ok(Outcome::Failed(FailureReason::AuthFailure));
            }
        }

        progress.enter(ResetStep::ChangingPassword);
        let account = attempt.account;
        let verdict = match self
            .change_password(attempt, account.login_password(), account.password())
            .await
        {
            Ok(ChangeVerdict::Reused) => self.change_via_interim(attempt).await,
            other => other,
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) => return self.fail(attempt, ResetStep::ChangingPassword, e),
        };

        progress.enter(ResetStep::Confirming);
        match self.confirm(attempt, verdict).await {
            Ok(true) => {
                progress.enter(ResetStep::Succeeded);
                Ok(Outcome::Succeeded)
            }
            Ok(false) => {
                progress.update(|a| a.last_error = Some("success page not reached".into()));
                Ok(Outcome::Failed(FailureReason::ConfirmationFailed))
            }
            Err(e) => self.fail(attempt, ResetStep::Confirming, e),
        }
    }

    /// Maps a step error to a terminal outcome; state failures propagate.
    fn fail(&self, attempt: &Attempt<'_>, step: ResetStep, error: Error) -> Result<Outcome> {
        if error.is_state_failure() {
            return Err(error);
        }
        attempt.progress.note_error(&error);

        let reason = match (&error, step) {
            (
                Error::ElementMissing { .. } | Error::UnexpectedPage { .. },
                ResetStep::ChallengeCheck,
            ) => FailureReason::UnexpectedPageState,
            _ => step.failure_reason(),
        };
        warn!(%step, %reason, error = %error, "Reset step failed");
        Ok(Outcome::Failed(reason))
    }

    /// Signs in, reopening the browser for every try.
    async fn log_in(&self, attempt: &Attempt<'_>) -> Result<()> {
        let budget_used = attempt.state.retries().await?;
        let cooldown = self.config.cooldown;

        retry_transient(
            &self.config.retry,
            "login",
            budget_used,
            move || async move {
                attempt.progress.note_try();
                let mut slot = attempt.session.lock().await;
                let result = self.log_in_once(&mut slot, attempt.account).await;
                if let Err(e) = &result {
                    attempt.progress.note_error(e);
                }
                result
            },
            move |_| async move { attempt.state.record_retry(cooldown).await.map(|_| ()) },
        )
        .await
    }

    async fn log_in_once(
        &self,
        slot: &mut Option<DriverSession>,
        account: &AccountConfig,
    ) -> Result<()> {
        let site = &self.config.site;
        let step_timeout = self.config.step_timeout;

        if let Some(mut stale) = slot.take() {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Closing previous browser session failed");
            }
        }
        let session = slot.insert(DriverSession::open(&*self.drivers, step_timeout).await?);

        session.navigate(&site.login_url).await?;
        session.require(&site.login_identifier).await?;
        session.fill(&site.login_identifier, &account.login).await?;
        session
            .fill(&site.login_password, account.login_password())
            .await?;
        session.click(&site.login_submit).await?;

        let landed = format!(
            "{}, {}, {}",
            site.login_error, site.signed_in_marker, site.challenge_prompt
        );
        if !session.wait_for(&landed, step_timeout).await? {
            return Err(Error::DriverTimeout {
                action: "sign-in response".into(),
                timeout: step_timeout,
            });
        }
        if session.wait_for(&site.login_error, Duration::ZERO).await? {
            return Err(Error::CredentialsRejected {
                login: account.login.clone(),
            });
        }

        debug!("Signed in");
        Ok(())
    }

    /// Answers the verification prompt if the site shows one.
    async fn check_challenge(&self, attempt: &Attempt<'_>, session: &DriverSession) -> Result<()> {
        let site = &self.config.site;
        let policy = &self.config.challenge;

        if session
            .wait_for(&site.signed_in_marker, Duration::ZERO)
            .await?
        {
            return Ok(());
        }
        if !session
            .wait_for(&site.challenge_prompt, policy.detect_timeout)
            .await?
        {
            debug!("No challenge presented");
            return Ok(());
        }

        let presented_at = self.clock.now();
        let stale_until = presented_at - to_chrono(policy.staleness_window);
        let mut not_before = stale_until;
        info!(%presented_at, "Challenge presented, waiting for a code");

        for poll in 1..=policy.max_polls {
            attempt.progress.note_try();

            match self
                .codes
                .fetch_code(&attempt.account.id, not_before, policy.poll_timeout)
                .await
            {
                Ok(code) if code.received_at <= stale_until => {
                    warn!(
                        poll,
                        message_id = code.message_id,
                        received_at = %code.received_at,
                        "Rejecting stale verification code"
                    );
                    not_before = code.received_at + chrono::Duration::milliseconds(1);
                }
                Ok(code) => match self.submit_code(session, &code).await {
                    Ok(true) => {
                        info!(poll, message_id = code.message_id, "Challenge answered");
                        return Ok(());
                    }
                    Ok(false) => {
                        warn!(poll, message_id = code.message_id, "Site rejected the code");
                        not_before = code.received_at + chrono::Duration::milliseconds(1);
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(poll, error = %e, "Submitting code failed");
                        attempt.progress.note_error(&e);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_retryable() || matches!(e, Error::CodeTimedOut { .. }) => {
                    debug!(poll, error = %e, "No usable code yet");
                    attempt.progress.note_error(&e);
                }
                Err(e) => return Err(e),
            }

            if poll < policy.max_polls {
                tokio::time::sleep(policy.poll_delay).await;
            }
        }

        Err(Error::ChallengeUnanswered {
            polls: policy.max_polls,
        })
    }

    /// Submits `code`; `Ok(false)` if the site shows its rejection banner.
    async fn submit_code(&self, session: &DriverSession, code: &VerificationCode) -> Result<bool> {
        let site = &self.config.site;
        let step_timeout = self.config.step_timeout;

        session.fill(&site.code_input, &code.code).await?;
        session.click(&site.code_submit).await?;

        let verdict = format!("{}, {}", site.code_error, site.signed_in_marker);
        if !session.wait_for(&verdict, step_timeout).await? {
            return Err(Error::DriverTimeout {
                action: "code verdict".into(),
                timeout: step_timeout,
            });
        }
        Ok(!session.wait_for(&site.code_error, Duration::ZERO).await?)
    }

    /// Goes through a random interim password when the wanted one counts as reused.
    async fn change_via_interim(&self, attempt: &Attempt<'_>) -> Result<ChangeVerdict> {
        let account = attempt.account;
        let interim = interim_password();
        info!("Password counts as reused, switching through an interim password");

        match self
            .change_password(attempt, account.login_password(), &interim)
            .await?
        {
            ChangeVerdict::Reused => Err(Error::UnexpectedPage {
                expected: "interim password accepted".into(),
                actual: "password reused".into(),
            }),
            ChangeVerdict::Confirmed | ChangeVerdict::Pending => {
                match self
                    .change_password(attempt, &interim, account.password())
                    .await?
                {
                    ChangeVerdict::Reused => {
                        error!("Interim password is now set on the account");
                        Err(Error::UnexpectedPage {
                            expected: "password accepted after interim".into(),
                            actual: "password reused".into(),
                        })
                    }
                    verdict => Ok(verdict),
                }
            }
        }
    }

    /// Fills and submits the change form, retrying transient failures.
    async fn change_password(
        &self,
        attempt: &Attempt<'_>,
        current: &str,
        new: &str,
    ) -> Result<ChangeVerdict> {
        // Form retries stay in memory; the persisted counter is the login budget
        retry_transient(
            &self.config.retry,
            "change_password",
            0,
            move || async move {
                attempt.progress.note_try();
                let slot = attempt.session.lock().await;
                let result = match slot.as_ref() {
                    Some(session) => self.change_password_once(session, current, new).await,
                    None => Err(Error::DriverClosed),
                };
                if let Err(e) = &result {
                    attempt.progress.note_error(e);
                }
                result
            },
            |_| async { Ok(()) },
        )
        .await
    }

    async fn change_password_once(
        &self,
        session: &DriverSession,
        current: &str,
        new: &str,
    ) -> Result<ChangeVerdict> {
        let site = &self.config.site;

        session.navigate(&site.change_password_url).await?;
        if !session
            .wait_for(&site.current_password, session.step_timeout())
            .await?
        {
            let actual = session.current_url().await?;
            if actual.contains(&site.change_password_path) {
                return Err(Error::ElementMissing {
                    selector: site.current_password.clone(),
                });
            }
            return Err(Error::UnexpectedPage {
                expected: site.change_password_path.clone(),
                actual,
            });
        }

        session.fill(&site.current_password, current).await?;
        session.fill(&site.new_password, new).await?;
        session.fill(&site.confirm_password, new).await?;
        if let Some(toggle) = &site.sign_out_everywhere {
            if session.wait_for(toggle, Duration::ZERO).await? {
                session.click(toggle).await?;
            }
        }
        session.click(&site.change_submit).await?;

        self.change_verdict(session).await
    }

    /// Polls until the success page or the "reused" error shows, or the step times out.
    async fn change_verdict(&self, session: &DriverSession) -> Result<ChangeVerdict> {
        let site = &self.config.site;
        let deadline = Instant::now() + session.step_timeout();

        loop {
            if self.on_success_page(session).await? {
                return Ok(ChangeVerdict::Confirmed);
            }
            if session
                .wait_for(&site.password_reused_error, Duration::ZERO)
                .await?
            {
                return Ok(ChangeVerdict::Reused);
            }
            if Instant::now() + VERDICT_POLL > deadline {
                return Ok(ChangeVerdict::Pending);
            }
            tokio::time::sleep(VERDICT_POLL).await;
        }
    }

    async fn on_success_page(&self, session: &DriverSession) -> Result<bool> {
        let site = &self.config.site;
        if session
            .current_url()
            .await?
            .contains(&site.success_url_fragment)
        {
            return Ok(true);
        }
        match &site.success_banner {
            Some(banner) => session.wait_for(banner, Duration::ZERO).await,
            None => Ok(false),
        }
    }

    /// Checks the post-condition.
    async fn confirm(&self, attempt: &Attempt<'_>, verdict: ChangeVerdict) -> Result<bool> {
        match verdict {
            ChangeVerdict::Confirmed => Ok(true),
            ChangeVerdict::Reused => Ok(false),
            ChangeVerdict::Pending => {
                attempt.progress.note_try();
                let slot = attempt.session.lock().await;
                let session = slot.as_ref().ok_or(Error::DriverClosed)?;
                if let Some(banner) = &self.config.site.success_banner {
                    if session.wait_for(banner, session.step_timeout()).await? {
                        return Ok(true);
                    }
                }
                self.on_success_page(session).await
            }
        }
    }
}

impl std::fmt::Debug for ResetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetOrchestrator")
            .field("accounts", &self.config.accounts().len())
            .field("cooldown", &self.config.cooldown)
            .field("lock_ttl", &self.config.lock_ttl)
            .finish_non_exhaustive()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

/// Random password for the reused-password detour.
fn interim_password() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("Tx{}#9", &random[..14])
}
