use crate::error::{CadenceError, ErrorKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PLACEHOLDER_USER_ID: &str = "unknown";
pub const PLACEHOLDER_USER_NAME: &str = "Creator";

/// Non-secret identity of the authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    /// Stand-in used when a login succeeded but identity extraction did not.
    pub fn placeholder() -> Self {
        Self::new(PLACEHOLDER_USER_ID, PLACEHOLDER_USER_NAME)
    }

    pub fn is_placeholder(&self) -> bool {
        self.user_id == PLACEHOLDER_USER_ID
    }
}

/// Persisted proof of authentication, owned exclusively by the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Backend-specific serialized cookies/storage.
    pub session_blob: serde_json::Value,
    pub user_id: String,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_blob: serde_json::Value, identity: &UserIdentity) -> Self {
        let now = Utc::now();
        Self {
            session_blob,
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the blob and identity, keeping the original creation time.
    pub fn refreshed(&self, session_blob: serde_json::Value, identity: &UserIdentity) -> Self {
        Self {
            session_blob,
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.user_id.clone(), self.user_name.clone())
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethodKind {
    Interactive,
    Credentials,
    SessionToken,
}

impl LoginMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethodKind::Interactive => "interactive",
            LoginMethodKind::Credentials => "credentials",
            LoginMethodKind::SessionToken => "token",
        }
    }
}

impl fmt::Display for LoginMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginMethodKind {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "interactive" | "browser" => Ok(LoginMethodKind::Interactive),
            "credentials" | "password" => Ok(LoginMethodKind::Credentials),
            "token" | "session_token" | "session-token" => Ok(LoginMethodKind::SessionToken),
            other => Err(CadenceError::Config {
                message: format!("Unknown login method '{}'", other),
            }),
        }
    }
}

/// Supported login mechanisms. The authenticator decides which it drives.
#[derive(Clone, PartialEq, Eq)]
pub enum LoginMethod {
    /// A human completes the platform's own login page.
    Interactive,
    Credentials { username: String, password: String },
    SessionToken { token: String },
}

impl LoginMethod {
    pub fn kind(&self) -> LoginMethodKind {
        match self {
            LoginMethod::Interactive => LoginMethodKind::Interactive,
            LoginMethod::Credentials { .. } => LoginMethodKind::Credentials,
            LoginMethod::SessionToken { .. } => LoginMethodKind::SessionToken,
        }
    }
}

impl fmt::Debug for LoginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginMethod::Interactive => f.write_str("Interactive"),
            LoginMethod::Credentials { username, .. } => f
                .debug_struct("Credentials")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            LoginMethod::SessionToken { .. } => f
                .debug_struct("SessionToken")
                .field("token", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// Skip the vault fast path and always run the login flow.
    pub force: bool,
    pub method: LoginMethod,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            force: false,
            method: LoginMethod::Interactive,
        }
    }
}

/// What a backend login flow hands back to the session manager.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub success: bool,
    /// Opaque state the backend needs persisted to skip the next login.
    pub session_state: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl LoginOutcome {
    pub fn succeeded(session_state: serde_json::Value) -> Self {
        Self {
            success: true,
            session_state: Some(session_state),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_state: None,
            error: Some(error.into()),
        }
    }
}

/// Final answer of `SessionManager::login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    pub user: Option<UserIdentity>,
    /// True when the vault fast path was taken and no login flow ran.
    pub restored: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl AuthResult {
    pub fn authenticated(user: UserIdentity, restored: bool) -> Self {
        Self {
            success: true,
            user: Some(user),
            restored,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            restored: false,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// Login capability of an authentication-capable backend.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &str;

    fn supported_methods(&self) -> Vec<LoginMethodKind>;

    /// Drive the login flow to completion. Bounded by the caller's timeout.
    async fn login(&self, method: &LoginMethod) -> Result<LoginOutcome>;

    /// Best-effort identity lookup for the live session.
    async fn extract_identity(&self) -> Result<UserIdentity>;

    /// Current exportable session state, if a session is live.
    async fn export_session(&self) -> Result<Option<serde_json::Value>>;

    /// Local check only; must not touch the network.
    async fn has_live_session(&self) -> bool;

    async fn logout(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refreshed_keeps_created_at() {
        let identity = UserIdentity::new("42", "Ada");
        let record = SessionRecord::new(json!({"cookies": []}), &identity);
        let renamed = UserIdentity::new("42", "Ada L.");
        let refreshed = record.refreshed(json!({"cookies": [{"name": "sid"}]}), &renamed);

        assert_eq!(refreshed.created_at, record.created_at);
        assert!(refreshed.updated_at >= record.updated_at);
        assert_eq!(refreshed.user_name, "Ada L.");
    }

    #[test]
    fn test_login_method_debug_redacts_secrets() {
        let method = LoginMethod::Credentials {
            username: "ada".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", method);
        assert!(debug.contains("ada"));
        assert!(!debug.contains("hunter2"));

        let token = LoginMethod::SessionToken {
            token: "abc123".to_string(),
        };
        assert!(!format!("{:?}", token).contains("abc123"));
    }

    #[test]
    fn test_login_method_kind_parsing() {
        assert_eq!(
            "token".parse::<LoginMethodKind>().unwrap(),
            LoginMethodKind::SessionToken
        );
        assert_eq!(
            "Interactive".parse::<LoginMethodKind>().unwrap(),
            LoginMethodKind::Interactive
        );
        assert!("oauth".parse::<LoginMethodKind>().is_err());
    }

    #[test]
    fn test_placeholder_identity() {
        let identity = UserIdentity::placeholder();
        assert!(identity.is_placeholder());
        assert!(!UserIdentity::new("7", "Bo").is_placeholder());
    }

    #[test]
    fn test_session_record_serialization() {
        let record = SessionRecord::new(json!({"token": "t"}), &UserIdentity::new("1", "A"));
        let serialized = serde_json::to_string(&record).unwrap();
        let deserialized: SessionRecord = serde_json::from_str(&serialized).unwrap();
        assert_eq!(record, deserialized);
    }
}
