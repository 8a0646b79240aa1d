//! [`AutomationDriver`] over the W3C WebDriver protocol (fantoccini).
//!
//! Needs a running WebDriver server (chromedriver, geckodriver, selenium).

use crate::driver::{AutomationDriver, DriverFactory};
use crate::error::{Error, Result};
use async_trait::async_trait;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::map::Map as JsonMap;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

const CHROME_ARGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--window-size=1280,900",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-translate",
    "--mute-audio",
    "--log-level=1",
];

/// Opens Chrome sessions on a WebDriver server.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    webdriver_url: String,
    headless: bool,
    user_agent: Option<String>,
}

impl WebDriverFactory {
    /// Uses the WebDriver server at `webdriver_url` (e.g. `http://localhost:9515`).
    #[must_use]
    pub fn new(webdriver_url: impl Into<String>) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
            headless: true,
            user_agent: None,
        }
    }

    /// Shows the browser window.
    #[must_use]
    pub fn headed(mut self) -> Self {
        self.headless = false;
        self
    }

    /// Overrides the browser's user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn capabilities(&self) -> JsonMap<String, serde_json::Value> {
        let mut args: Vec<String> = CHROME_ARGS
            .iter()
            .filter(|arg| self.headless || !arg.starts_with("--headless"))
            .map(|arg| (*arg).to_string())
            .collect();
        if let Some(agent) = &self.user_agent {
            args.push(format!("--user-agent={agent}"));
        }

        let mut chrome_opts = JsonMap::new();
        chrome_opts.insert("args".to_string(), serde_json::json!(args));

        let mut caps = JsonMap::new();
        caps.insert("browserName".to_string(), serde_json::json!("chrome"));
        caps.insert(
            "goog:chromeOptions".to_string(),
            serde_json::Value::Object(chrome_opts),
        );
        caps
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    #[instrument(name = "WebDriverFactory::open", skip(self), fields(url = %self.webdriver_url))]
    async fn open(&self) -> Result<Box<dyn AutomationDriver>> {
        let caps = self.capabilities();
        trace!(?caps, "WebDriver capabilities");

        let mut builder = ClientBuilder::native();
        builder.capabilities(caps);

        match builder.connect(&self.webdriver_url).await {
            Ok(client) => {
                debug!("WebDriver client connected");
                Ok(Box::new(WebDriver { client }))
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to WebDriver");
                Err(Error::DriverSession {
                    message: e.to_string(),
                })
            }
        }
    }
}

/// One WebDriver browser session.
#[derive(Debug)]
pub struct WebDriver {
    client: Client,
}

impl WebDriver {
    /// Wraps an already connected client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_cmd(action: &str, selector: Option<&str>, error: CmdError) -> Error {
    match selector {
        Some(selector) if error.is_no_such_element() => Error::ElementMissing {
            selector: selector.to_string(),
        },
        _ if error.is_no_such_window() => Error::DriverClosed,
        _ => Error::DriverTransport {
            action: action.to_string(),
            message: error.to_string(),
        },
    }
}

#[async_trait]
impl AutomationDriver for WebDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.client
            .goto(url)
            .await
            .map_err(|e| map_cmd("navigate", None, e))
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        match self
            .client
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(selector))
            .await
        {
            Ok(_) => Ok(true),
            Err(CmdError::WaitTimeout) => Ok(false),
            Err(e) => Err(map_cmd("wait_for", Some(selector), e)),
        }
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .client
            .find(Locator::Css(selector))
            .await
            .map_err(|e| map_cmd("fill", Some(selector), e))?;
        element
            .clear()
            .await
            .map_err(|e| map_cmd("fill", Some(selector), e))?;
        element
            .send_keys(text)
            .await
            .map_err(|e| map_cmd("fill", Some(selector), e))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .client
            .find(Locator::Css(selector))
            .await
            .map_err(|e| map_cmd("click", Some(selector), e))?;
        element
            .click()
            .await
            .map_err(|e| map_cmd("click", Some(selector), e))
    }

    async fn current_url(&self) -> Result<String> {
        self.client
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(|e| map_cmd("current_url", None, e))
    }

    async fn close(&self) -> Result<()> {
        self.client
            .clone()
            .close()
            .await
            .map_err(|e| map_cmd("close", None, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fantoccini::error::ErrorStatus;

    #[test]
    fn test_capabilities() {
        let caps = WebDriverFactory::new("http://localhost:9515")
            .user_agent("Sentinel/1.0")
            .capabilities();

        assert_eq!(caps["browserName"], "chrome");
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|arg| arg.as_str() == Some("--headless=new")));
        assert!(args.iter().any(|arg| arg.as_str() == Some("--user-agent=Sentinel/1.0")));
    }

    #[test]
    fn test_headed_drops_headless_flag() {
        let caps = WebDriverFactory::new("http://localhost:9515")
            .headed()
            .capabilities();

        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(!args.iter().any(|arg| arg.as_str() == Some("--headless=new")));
    }

    fn standard(status: ErrorStatus) -> CmdError {
        CmdError::Standard(fantoccini::error::WebDriver::new(status, "from driver"))
    }

    #[test]
    fn test_map_cmd_classifies_driver_errors() {
        let missing = map_cmd("find", Some("#password"), standard(ErrorStatus::NoSuchElement));
        assert!(
            matches!(&missing, Error::ElementMissing { selector } if selector == "#password"),
            "{missing:?}"
        );

        let closed = map_cmd("click", None, standard(ErrorStatus::NoSuchWindow));
        assert!(matches!(closed, Error::DriverClosed), "{closed:?}");

        // Without a selector a missing element is just a failed command
        let unscoped = map_cmd("source", None, standard(ErrorStatus::NoSuchElement));
        assert!(
            matches!(&unscoped, Error::DriverTransport { action, .. } if action == "source"),
            "{unscoped:?}"
        );

        let timed_out = map_cmd("wait", Some("#code"), CmdError::WaitTimeout);
        assert!(matches!(timed_out, Error::DriverTransport { .. }), "{timed_out:?}");
    }
}
