//! Page map of the target web application.
//!
//! The orchestrator only knows *steps*; which URL to open and which CSS
//! selector to type into lives here, so a template change on the site is a
//! configuration change rather than a code change.

/// URLs and CSS selectors the reset flow drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteProfile {
    /// Sign-in page.
    pub login_url: String,
    /// Account identifier input on the sign-in page.
    pub login_identifier: String,
    /// Password input on the sign-in page.
    pub login_password: String,
    /// Sign-in submit button.
    pub login_submit: String,
    /// Error banner shown when sign-in is rejected.
    pub login_error: String,
    /// Element only present once signed in.
    pub signed_in_marker: String,

    /// Element announcing a secondary verification step.
    pub challenge_prompt: String,
    /// Input receiving the one-time code.
    pub code_input: String,
    /// Button submitting the one-time code.
    pub code_submit: String,
    /// Error shown when the submitted code is rejected.
    pub code_error: String,

    /// Password-change form.
    pub change_password_url: String,
    /// Path fragment the browser must be on while changing the password.
    pub change_password_path: String,
    /// Current password input.
    pub current_password: String,
    /// New password input.
    pub new_password: String,
    /// New password confirmation input.
    pub confirm_password: String,
    /// Optional "sign out of all devices" toggle clicked before saving.
    pub sign_out_everywhere: Option<String>,
    /// Save button of the change form.
    pub change_submit: String,
    /// Error shown when the new password was used before.
    pub password_reused_error: String,

    /// URL fragment of the page shown after a successful change.
    pub success_url_fragment: String,
    /// Banner shown after a successful change.
    pub success_banner: Option<String>,
}

impl SiteProfile {
    /// Page map of the streaming service the sentinel was built for.
    #[must_use]
    pub fn netflix() -> Self {
        Self {
            login_url: "https://www.netflix.com/login".into(),
            login_identifier: "#id_userLoginId".into(),
            login_password: "#id_password".into(),
            login_submit: "button.login-button".into(),
            login_error: "div.ui-message-contents".into(),
            signed_in_marker: r#"a[data-uia="header-signout-link"], div.profile-gate-container"#
                .into(),

            challenge_prompt: r#"input[autocomplete="one-time-code"]"#.into(),
            code_input: r#"input[autocomplete="one-time-code"]"#.into(),
            code_submit: r#"button[type="submit"]"#.into(),
            code_error: r#"[data-uia="otp-error"]"#.into(),

            change_password_url: "https://www.netflix.com/password".into(),
            change_password_path: "/password".into(),
            current_password: "#id_currentPassword".into(),
            new_password: "#id_newPassword".into(),
            confirm_password: "#id_confirmNewPassword".into(),
            sign_out_everywhere: Some(
                r#"li[data-uia="field-requireAllDevicesSignIn+wrapper"]"#.into(),
            ),
            change_submit: "#btn-save".into(),
            password_reused_error: r#"div[data-uia="field-newPassword+error"]"#.into(),

            success_url_fragment: "YourAccount?confirm=password".into(),
            success_banner: None,
        }
    }
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self::netflix()
    }
}
