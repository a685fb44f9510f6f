//! Opaque session state exchanged between backends and the vault.
//!
//! Shape: `{"cookies": [{"name", "value", ...}], "token": "..."}`. Both
//! fields are optional; the browser backend produces cookies, a token login
//! may produce either.

use crate::error::{BackendError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A browser cookie in W3C WebDriver shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, rename = "httpOnly", skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: Some("/".to_string()),
            secure: None,
            http_only: None,
            expiry: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SessionState {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| BackendError::InvalidSession {
            message: e.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.token.is_none()
    }

    /// `Cookie` request header value, if any cookies are present.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_webdriver_cookies() {
        let state = SessionState::from_value(&json!({
            "cookies": [
                {"name": "sid", "value": "abc", "domain": ".example.com", "httpOnly": true, "sameSite": "Lax"},
                {"name": "theme", "value": "dark"}
            ]
        }))
        .unwrap();

        assert_eq!(state.cookies.len(), 2);
        assert_eq!(state.cookies[0].http_only, Some(true));
        assert_eq!(state.cookie_header().unwrap(), "sid=abc; theme=dark");
        assert!(state.token.is_none());
    }

    #[test]
    fn test_token_only_state() {
        let state = SessionState::from_value(&json!({"token": "t0k"})).unwrap();
        assert!(state.cookie_header().is_none());
        assert_eq!(state.token.as_deref(), Some("t0k"));
        assert!(!state.is_empty());
    }

    #[test]
    fn test_malformed_state_is_invalid_session() {
        let err = SessionState::from_value(&json!({"cookies": "nope"})).unwrap_err();
        assert!(matches!(err, BackendError::InvalidSession { .. }));
    }
}
