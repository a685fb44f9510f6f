//! W3C WebDriver client used as the production `BrowserDriver`.
//!
//! Speaks the JSON wire protocol to a driver process (chromedriver,
//! geckodriver) at `webdriver_url`. One browser session per client.

use crate::api::endpoint_url;
use crate::browser::BrowserDriver;
use crate::error::{BackendError, Result};
use crate::state::Cookie;
use async_trait::async_trait;
use cadence_core::config::BrowserBackendConfig;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Extra room on top of the script timeout so the driver reports a script
/// timeout before the HTTP request gives up.
const HTTP_GRACE_MS: u64 = 5_000;

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

pub struct WebDriverClient {
    config: BrowserBackendConfig,
    http: Client,
    session_id: RwLock<Option<String>>,
}

impl WebDriverClient {
    pub fn new(config: BrowserBackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms + HTTP_GRACE_MS))
            .build()
            .map_err(|e| BackendError::Configuration {
                message: format!("Failed to create WebDriver HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            http,
            session_id: RwLock::new(None),
        })
    }

    /// Capabilities for `POST /session`.
    pub fn capabilities(&self) -> Value {
        let mut args = vec!["--no-first-run", "--disable-gpu"];
        if self.config.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }

    async fn session(&self) -> Result<String> {
        self.session_id
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::NotInitialized {
                backend: "webdriver".to_string(),
            })
    }

    async fn command(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
        command: &str,
    ) -> Result<Value> {
        let url = endpoint_url(&self.config.webdriver_url, segments)?;
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::http(command, e))?;
        let status = response.status();
        let reply: WireReply = response
            .json()
            .await
            .map_err(|e| BackendError::http(command, e))?;

        if status.is_success() {
            Ok(reply.value)
        } else {
            Err(wire_error(command, &reply.value, self.config.timeout_ms))
        }
    }

    async fn session_command(
        &self,
        method: Method,
        path: &[&str],
        body: Option<Value>,
        command: &str,
    ) -> Result<Value> {
        let id = self.session().await?;
        let mut segments = vec!["session", id.as_str()];
        segments.extend_from_slice(path);
        self.command(method, &segments, body, command).await
    }
}

/// Translate a W3C error body into a backend error.
fn wire_error(command: &str, value: &Value, timeout_ms: u64) -> BackendError {
    match serde_json::from_value::<WireError>(value.clone()) {
        Ok(err) if err.error == "script timeout" || err.error == "timeout" => {
            BackendError::Timeout {
                operation: command.to_string(),
                timeout_ms,
            }
        }
        Ok(err) => BackendError::WebDriver {
            command: command.to_string(),
            message: format!("{}: {}", err.error, err.message),
        },
        Err(_) => BackendError::WebDriver {
            command: command.to_string(),
            message: "driver returned an unrecognized error".to_string(),
        },
    }
}

#[async_trait]
impl BrowserDriver for WebDriverClient {
    async fn start(&self) -> Result<()> {
        let mut session = self.session_id.write().await;
        if session.is_some() {
            return Ok(());
        }

        let value = self
            .command(
                Method::POST,
                &["session"],
                Some(self.capabilities()),
                "new_session",
            )
            .await?;
        let created: NewSession = serde_json::from_value(value)?;

        let timeouts = json!({ "script": self.config.timeout_ms });
        self.command(
            Method::POST,
            &["session", created.session_id.as_str(), "timeouts"],
            Some(timeouts),
            "set_timeouts",
        )
        .await?;

        info!(session_id = %created.session_id, "WebDriver session started");
        *session = Some(created.session_id);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.session_command(Method::POST, &["url"], Some(json!({ "url": url })), "navigate")
            .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let value = self
            .session_command(Method::GET, &["url"], None, "current_url")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn execute_async(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.session_command(
            Method::POST,
            &["execute", "async"],
            Some(json!({ "script": script, "args": args })),
            "execute_async",
        )
        .await
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let value = self
            .session_command(Method::GET, &["cookie"], None, "get_cookies")
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn add_cookie(&self, cookie: &Cookie) -> Result<()> {
        self.session_command(
            Method::POST,
            &["cookie"],
            Some(json!({ "cookie": cookie })),
            "add_cookie",
        )
        .await?;
        Ok(())
    }

    async fn delete_cookies(&self) -> Result<()> {
        self.session_command(Method::DELETE, &["cookie"], None, "delete_cookies")
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(id) = self.session_id.write().await.take() else {
            return Ok(());
        };
        if let Err(e) = self
            .command(Method::DELETE, &["session", id.as_str()], None, "delete_session")
            .await
        {
            warn!(session_id = %id, error = %e, "Failed to end WebDriver session");
            return Err(e);
        }
        debug!(session_id = %id, "WebDriver session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ErrorKind;

    fn client(headless: bool) -> WebDriverClient {
        WebDriverClient::new(BrowserBackendConfig {
            headless,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_headless_capabilities() {
        let caps = client(true).capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));

        let caps = client(false).capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(!args.iter().any(|a| a == "--headless=new"));
    }

    #[test]
    fn test_wire_errors() {
        let timeout = wire_error(
            "execute_async",
            &json!({"error": "script timeout", "message": "took too long"}),
            30_000,
        );
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let missing = wire_error(
            "navigate",
            &json!({"error": "invalid session id", "message": "gone"}),
            30_000,
        );
        assert!(missing.to_string().contains("invalid session id"));
        assert_eq!(missing.kind(), ErrorKind::BackendUnavailable);

        let garbled = wire_error("navigate", &json!("oops"), 30_000);
        assert!(matches!(garbled, BackendError::WebDriver { .. }));
    }

    #[tokio::test]
    async fn test_commands_without_session_fail() {
        let driver = client(true);
        let err = driver.current_url().await.unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized { .. }));
        driver.close().await.unwrap();
    }
}
