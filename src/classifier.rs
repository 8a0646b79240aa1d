//! Message classification.
//!
//! A [`Classifier`] holds an ordered list of [`Rule`]s and labels each
//! [`Message`] with the first rule that fires. Classification is pure: it never
//! touches the network and never fails; anything unmatched is
//! [`Category::Irrelevant`].
//!
//! # Example
//!
//! ```
//! use password_sentinel::classifier::{Category, Classifier};
//! use password_sentinel::Message;
//! use chrono::Utc;
//!
//! let classifier = Classifier::default();
//!
//! let notice = Message::new(1, Utc::now(), "Your password has been changed", "Hi there");
//! assert_eq!(classifier.classify(&notice).category, Category::PasswordChanged);
//!
//! let code = Message::new(2, Utc::now(), "Your sign-in code", "Enter this code: 482913");
//! assert_eq!(classifier.classify(&code).payload.as_deref(), Some("482913"));
//! ```

use crate::error::{Error, Result};
use crate::message::Message;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Trait for matching and extracting content from message text.
///
/// Implement this trait to plug custom payload extraction into a [`Rule`].
pub trait Matcher: Send + Sync {
    /// Attempts to find and extract matching content from the text.
    ///
    /// Uses `Cow<str>` so matches can be borrowed straight from the input.
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>>;

    /// Returns a human-readable description of what this matcher looks for.
    fn description(&self) -> &str;
}

/// Case-insensitive regex matcher.
///
/// Extracts the first capture group when the pattern has one, the whole match otherwise.
///
/// # Example
///
/// ```
/// use password_sentinel::classifier::{RegexMatcher, Matcher};
///
/// let matcher = RegexMatcher::new(r"code:\s*(\d+)").unwrap();
/// assert_eq!(matcher.find_match("Your CODE: 42"), Some("42".into()));
/// ```
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
    description: String,
}

impl RegexMatcher {
    /// Creates a new case-insensitive regex matcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn new(pattern: &str) -> Result<Self> {
        Self::with_description(pattern, format!("regex pattern: {pattern}"))
    }

    /// Creates a new matcher with a custom description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn with_description(pattern: &str, description: impl Into<String>) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            regex,
            description: description.into(),
        })
    }

    /// Returns the byte range of the first match.
    #[must_use]
    pub fn locate(&self, text: &str) -> Option<Range<usize>> {
        self.regex.find(text).map(|m| m.range())
    }
}

impl Matcher for RegexMatcher {
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>> {
        self.regex
            .captures(text)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| Cow::Borrowed(m.as_str()))
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Matcher for one-time codes of bounded length.
///
/// A code is a word-bounded run of `min..=max` ASCII letters or digits that
/// contains at least one digit and no lowercase letters, so ordinary words are skipped.
///
/// # Example
///
/// ```
/// use password_sentinel::classifier::{CodeMatcher, Matcher};
///
/// let codes = CodeMatcher::new(4, 8);
/// assert_eq!(codes.find_match("Your code is 4829 13"), Some("4829".into()));
/// assert_eq!(codes.find_match("Code: AB12CD."), Some("AB12CD".into()));
/// assert_eq!(codes.find_match("Code: 123"), None);
/// ```
#[derive(Debug, Clone)]
pub struct CodeMatcher {
    token: Regex,
    description: String,
}

impl CodeMatcher {
    /// Creates a matcher for codes between `min` and `max` characters long.
    ///
    /// # Panics
    ///
    /// Panics if `min` is 0 or greater than `max`.
    #[must_use]
    pub fn new(min: usize, max: usize) -> Self {
        assert!(min > 0 && min <= max, "code length bounds must satisfy 0 < min <= max");
        let pattern = format!(r"\b[0-9A-Za-z]{{{min},{max}}}\b");
        Self {
            token: Regex::new(&pattern).expect("valid regex"),
            description: format!("{min}-{max} character one-time code"),
        }
    }
}

impl Matcher for CodeMatcher {
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>> {
        self.token
            .find_iter(text)
            .map(|m| m.as_str())
            .find(|token| {
                token.bytes().any(|b| b.is_ascii_digit())
                    && !token.bytes().any(|b| b.is_ascii_lowercase())
            })
            .map(Cow::Borrowed)
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// What a message means to the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Someone (or the service itself) changed the account password.
    PasswordChanged,
    /// A sign-in / verification code; the payload carries the code.
    VerificationCode,
    /// Anything else.
    Irrelevant,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::PasswordChanged => write!(f, "password_changed"),
            Category::VerificationCode => write!(f, "verification_code"),
            Category::Irrelevant => write!(f, "irrelevant"),
        }
    }
}

/// The result of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    /// Assigned category.
    pub category: Category,
    /// Extracted payload (the code for [`Category::VerificationCode`]).
    pub payload: Option<String>,
    /// Identifier of the source message.
    pub message_id: u32,
    /// Name of the rule that fired, if any.
    pub rule: Option<String>,
}

/// One pattern-to-category mapping.
///
/// A rule fires when any of its signals matches (the subject signal against the
/// subject, the body signal against the body) and, if it has an extractor, the
/// extractor finds a payload. Extraction starts right after the body signal,
/// then falls back to the whole body and finally the subject.
#[derive(Clone)]
pub struct Rule {
    name: String,
    category: Category,
    subject: Option<RegexMatcher>,
    body: Option<RegexMatcher>,
    extract: Option<Arc<dyn Matcher>>,
}

impl Rule {
    /// Creates a rule with no signals. Add at least one with
    /// [`subject`](Self::subject) or [`body`](Self::body).
    #[must_use]
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        Self {
            name: name.into(),
            category,
            subject: None,
            body: None,
            extract: None,
        }
    }

    /// Adds a case-insensitive subject signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn subject(mut self, pattern: &str) -> Result<Self> {
        self.subject = Some(RegexMatcher::with_description(
            pattern,
            format!("{} subject", self.name),
        )?);
        Ok(self)
    }

    /// Adds a case-insensitive body signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn body(mut self, pattern: &str) -> Result<Self> {
        self.body = Some(RegexMatcher::with_description(
            pattern,
            format!("{} body", self.name),
        )?);
        Ok(self)
    }

    /// Sets the payload extractor.
    #[must_use]
    pub fn extract(mut self, matcher: impl Matcher + 'static) -> Self {
        self.extract = Some(Arc::new(matcher));
        self
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the category this rule assigns.
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Applies the rule. `Some(payload)` means the rule fired.
    fn apply(&self, subject: &str, body: &str) -> Option<Option<String>> {
        let subject_hit = self
            .subject
            .as_ref()
            .is_some_and(|m| m.locate(subject).is_some());
        let body_hit = self.body.as_ref().and_then(|m| m.locate(body));

        if !subject_hit && body_hit.is_none() {
            return None;
        }

        let Some(extract) = &self.extract else {
            return Some(None);
        };

        let after_signal = body_hit.map(|range| &body[range.end..]);
        let payload = after_signal
            .and_then(|text| extract.find_match(text))
            .or_else(|| extract.find_match(body))
            .or_else(|| extract.find_match(subject))?;

        Some(Some(payload.into_owned()))
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("subject", &self.subject.as_ref().map(RegexMatcher::description))
            .field("body", &self.body.as_ref().map(RegexMatcher::description))
            .field("extract", &self.extract.as_ref().map(|m| m.description().to_string()))
            .finish()
    }
}

/// Ordered, data-driven message classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    /// Creates a classifier from an ordered rule list (most specific first).
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Appends a rule after the existing ones.
    pub fn push_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Inserts a rule ahead of all existing ones.
    pub fn prepend_rule(&mut self, rule: Rule) {
        self.rules.insert(0, rule);
    }

    /// Returns the rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Labels a message. Never fails.
    #[must_use]
    pub fn classify(&self, message: &Message) -> ClassifiedEvent {
        let body = visible_text(&message.body);

        for rule in &self.rules {
            if let Some(payload) = rule.apply(&message.subject, &body) {
                debug!(
                    uid = message.id,
                    rule = %rule.name,
                    category = %rule.category,
                    "Message classified"
                );
                return ClassifiedEvent {
                    category: rule.category,
                    payload,
                    message_id: message.id,
                    rule: Some(rule.name.clone()),
                };
            }
        }

        ClassifiedEvent {
            category: Category::Irrelevant,
            payload: None,
            message_id: message.id,
            rule: None,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.clone())
    }
}

static HTML_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(style|script|head)[^>]*>.*?</(style|script|head)>").expect("valid regex")
});
static HTML_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Reduces an HTML body to its visible text; plain text passes through untouched.
fn visible_text(body: &str) -> Cow<'_, str> {
    if !body.contains('<') {
        return Cow::Borrowed(body);
    }
    let without_blocks = HTML_BLOCKS.replace_all(body, " ");
    let text = HTML_TAGS.replace_all(&without_blocks, " ");
    Cow::Owned(text.replace("&nbsp;", " "))
}

const PASSWORD_CHANGED_SUBJECT: &str = concat!(
    r"password (has been |was )(changed|updated|reset)|password (changed|updated)",
    r"|contraseña (ha sido |fue )?(cambiada|actualizada)|cambio de contraseña",
    r"|senha (foi )?(alterada|atualizada)|alteração de senha",
    r"|mot de passe (a été )?(modifié|changé)",
    r"|passwort (wurde )?geändert",
    r"|密码已(更改|修改|变更)|密码(更改|修改)(成功|通知)",
);

// Forgot-password requests look like change notices but nothing has changed yet.
const RESET_REQUEST_SUBJECT: &str = concat!(
    r"password reset request|reset your password|complete your password reset",
    r"|restablec(e|er) tu contraseña|redefin(a|ir) (sua|a) senha",
    r"|réinitialise[rz]? (votre|ton) mot de passe|passwort zurücksetzen",
    r"|重置(您的)?密码",
);

const RESET_REQUEST_LINK: &str = r"accountaccess[^\s<>]*lkid=URL_ACCOUNT_ACCESS";

const PASSWORD_CHANGED_LINK: &str =
    r"https?://[^\s<>]*netflix\.com/YourAccount\?[^\s<>]*lkid=URL_YOUR_ACCOUNT";

const FORCED_CHANGE_LINK: &str =
    r"https?://www\.netflix\.com/LoginHelp[^\s<>]*lkid=URL_LOGIN_HELP";

const VERIFICATION_SIGNAL: &str = concat!(
    r"(verification|sign[- ]?in|security|one[- ]time|login|access) code|enter this code",
    r"|código de (verificación|inicio de sesión|acceso|verificação)",
    r"|code de (vérification|connexion)",
    r"|(bestätigungs|anmelde|sicherheits)code",
    r"|验证码|登录码",
);

static DEFAULT_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::new("password-reset-request", Category::Irrelevant)
            .subject(RESET_REQUEST_SUBJECT)
            .and_then(|rule| rule.body(RESET_REQUEST_LINK))
            .expect("valid regex"),
        Rule::new("password-changed", Category::PasswordChanged)
            .subject(PASSWORD_CHANGED_SUBJECT)
            .and_then(|rule| rule.body(PASSWORD_CHANGED_LINK))
            .expect("valid regex"),
        Rule::new("forced-password-change", Category::PasswordChanged)
            .body(FORCED_CHANGE_LINK)
            .expect("valid regex"),
        Rule::new("verification-code", Category::VerificationCode)
            .subject(VERIFICATION_SIGNAL)
            .and_then(|rule| rule.body(VERIFICATION_SIGNAL))
            .expect("valid regex")
            .extract(CodeMatcher::new(4, 8)),
    ]
});
