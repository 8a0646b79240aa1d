//! Browser automation capability.
//!
//! The reset flow drives a browser only through [`AutomationDriver`]. Sessions
//! come from a [`DriverFactory`] and are wrapped in a [`DriverSession`], which
//! puts a timeout on every step and closes the browser on every exit path.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Operations the reset flow needs from a browser.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Loads `url` in the current tab.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Waits until `selector` matches an element; `Ok(false)` once `timeout` passes.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Replaces the content of the input matched by `selector`.
    async fn fill(&self, selector: &str, text: &str) -> Result<()>;

    /// Clicks the element matched by `selector`.
    async fn click(&self, selector: &str) -> Result<()>;

    /// URL the browser is currently on.
    async fn current_url(&self) -> Result<String>;

    /// Ends the browser session.
    async fn close(&self) -> Result<()>;
}

/// Opens browser sessions.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Opens a fresh session.
    async fn open(&self) -> Result<Box<dyn AutomationDriver>>;
}

/// One browser session owned by a reset attempt.
///
/// Every call is bounded by the step timeout; elapsing yields
/// [`Error::DriverTimeout`], which is retryable. Call [`close`](Self::close)
/// when done; a session dropped without it is closed in the background.
pub struct DriverSession {
    driver: Option<Box<dyn AutomationDriver>>,
    step_timeout: Duration,
}

impl DriverSession {
    /// Opens a session from `factory`, bounded by `step_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DriverTimeout`] if opening takes longer than `step_timeout`,
    /// or the factory's error.
    pub async fn open(factory: &dyn DriverFactory, step_timeout: Duration) -> Result<Self> {
        let driver = tokio::time::timeout(step_timeout, factory.open())
            .await
            .map_err(|_| Error::DriverTimeout {
                action: "open".into(),
                timeout: step_timeout,
            })??;

        debug!("Browser session opened");

        Ok(Self {
            driver: Some(driver),
            step_timeout,
        })
    }

    /// Timeout applied to each step.
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    fn driver(&self) -> Result<&dyn AutomationDriver> {
        self.driver.as_deref().ok_or(Error::DriverClosed)
    }

    async fn bounded<T>(&self, action: &str, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.step_timeout, step)
            .await
            .map_err(|_| Error::DriverTimeout {
                action: action.to_string(),
                timeout: self.step_timeout,
            })?
    }

    /// Loads `url`.
    ///
    /// # Errors
    ///
    /// Returns the driver's error, [`Error::DriverTimeout`] or [`Error::DriverClosed`].
    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.bounded("navigate", self.driver()?.navigate(url)).await
    }

    /// Returns whether `selector` appears within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the driver's error or [`Error::DriverClosed`].
    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let driver = self.driver()?;
        // The driver polls up to `timeout`; the outer bound only guards a hung transport.
        match tokio::time::timeout(timeout + self.step_timeout, driver.wait_for(selector, timeout))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::DriverTimeout {
                action: format!("wait_for {selector}"),
                timeout,
            }),
        }
    }

    /// Waits for `selector` for one step timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ElementMissing`] if the element never appears.
    pub async fn require(&self, selector: &str) -> Result<()> {
        if self.wait_for(selector, self.step_timeout).await? {
            Ok(())
        } else {
            Err(Error::ElementMissing {
                selector: selector.to_string(),
            })
        }
    }

    /// Types `text` into `selector`.
    ///
    /// # Errors
    ///
    /// Returns the driver's error, [`Error::DriverTimeout`] or [`Error::DriverClosed`].
    pub async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.bounded("fill", self.driver()?.fill(selector, text)).await
    }

    /// Clicks `selector`.
    ///
    /// # Errors
    ///
    /// Returns the driver's error, [`Error::DriverTimeout`] or [`Error::DriverClosed`].
    pub async fn click(&self, selector: &str) -> Result<()> {
        self.bounded("click", self.driver()?.click(selector)).await
    }

    /// Current browser URL.
    ///
    /// # Errors
    ///
    /// Returns the driver's error, [`Error::DriverTimeout`] or [`Error::DriverClosed`].
    pub async fn current_url(&self) -> Result<String> {
        self.bounded("current_url", self.driver()?.current_url()).await
    }

    /// Closes the browser. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the driver's error or [`Error::DriverTimeout`].
    pub async fn close(&mut self) -> Result<()> {
        let Some(driver) = self.driver.take() else {
            return Ok(());
        };
        let result = tokio::time::timeout(self.step_timeout, driver.close())
            .await
            .map_err(|_| Error::DriverTimeout {
                action: "close".into(),
                timeout: self.step_timeout,
            })?;
        debug!("Browser session closed");
        result
    }

    /// Returns `true` once the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("open", &self.driver.is_some())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        let close_timeout = self.step_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match tokio::time::timeout(close_timeout, driver.close()).await {
                        Ok(Ok(())) => debug!("Browser session closed on drop"),
                        Ok(Err(e)) => warn!(error = %e, "Browser session close failed"),
                        Err(_) => warn!(
                            timeout_secs = close_timeout.as_secs(),
                            "Browser session close timed out"
                        ),
                    }
                });
            }
            Err(_) => {
                warn!(
                    "DriverSession dropped outside of tokio runtime context. \
                     The browser session may stay open until the driver reaps it."
                );
            }
        }
    }
}
