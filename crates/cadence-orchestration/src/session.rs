use crate::router::ExecutionRouter;
use cadence_core::config::AuthConfig;
use cadence_core::{
    AuthResult, Authenticator, CadenceError, ErrorKind, LoginMethod, LoginOptions, Result,
    SessionRecord, UserIdentity,
};
use cadence_security::CredentialVault;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Owns the "are we logged in" decision and the vault.
///
/// Login first tries the vault; only when no usable record exists does it
/// run the authenticator's flow. Identity lookup and persistence after a
/// successful flow are best effort and never turn a login into a failure.
pub struct SessionManager {
    config: AuthConfig,
    vault: Arc<CredentialVault>,
    authenticator: Arc<dyn Authenticator>,
    router: Option<Arc<ExecutionRouter>>,
    current_user: RwLock<Option<UserIdentity>>,
}

impl SessionManager {
    pub fn new(
        config: AuthConfig,
        vault: Arc<CredentialVault>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            vault,
            authenticator,
            router: None,
            current_user: RwLock::new(None),
        }
    }

    /// Backends behind `router` receive the session blob after every
    /// restore or login and have it cleared on logout.
    pub fn with_router(mut self, router: Arc<ExecutionRouter>) -> Self {
        self.router = Some(router);
        self
    }

    #[instrument(skip(self), fields(force = options.force, method = %options.method.kind()))]
    pub async fn login(&self, options: LoginOptions) -> Result<AuthResult> {
        if !options.force {
            if let Some(user) = self.restore_from_vault().await {
                info!(user_id = %user.user_id, "Restored session from vault");
                return Ok(AuthResult::authenticated(user, true));
            }
        }

        let method = options.method;
        if !self
            .authenticator
            .supported_methods()
            .contains(&method.kind())
        {
            return Err(CadenceError::UnsupportedLoginMethod {
                method: method.kind().to_string(),
                backend: self.authenticator.name().to_string(),
            });
        }

        info!(authenticator = self.authenticator.name(), "Running login flow");
        let timeout = self.config.login_timeout();
        let outcome = match tokio::time::timeout(timeout, self.authenticator.login(&method)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e @ CadenceError::UnsupportedLoginMethod { .. })) => return Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "Login flow failed");
                return Ok(AuthResult::failed(e.kind(), e.to_string()));
            }
            Err(_) => {
                warn!(timeout_ms = self.config.login_timeout_ms, "Login flow timed out");
                return Ok(AuthResult::failed(
                    ErrorKind::Timeout,
                    format!("login did not complete within {}ms", timeout.as_millis()),
                ));
            }
        };

        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "login was not completed".to_string());
            warn!(error = %reason, "Login rejected");
            return Ok(AuthResult::failed(ErrorKind::AuthFailed, reason));
        }

        let user = self.identify().await;
        let state = match outcome.session_state {
            Some(state) => Some(state),
            None => self.export_quietly().await,
        };
        match state {
            Some(state) => {
                self.hydrate(&state).await;
                self.persist(SessionRecord::new(state, &user)).await;
            }
            None => warn!("Login produced no session state; nothing persisted"),
        }

        *self.current_user.write().await = Some(user.clone());
        info!(user_id = %user.user_id, "Login succeeded");
        Ok(AuthResult::authenticated(user, false))
    }

    /// Local check only: a live backend session or a stored record.
    pub async fn is_authenticated(&self) -> bool {
        self.authenticator.has_live_session().await || self.vault.has_record().await
    }

    /// Tear down the live session and purge the vault. The vault is purged
    /// even when the backend logout fails.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.authenticator.logout().await {
            warn!(error = %e, "Backend logout failed");
        }
        if let Some(router) = &self.router {
            if let Err(e) = router.clear_session().await {
                warn!(error = %e, "Failed to clear backend sessions");
            }
        }
        *self.current_user.write().await = None;
        self.vault.clear().await?;
        info!("Logged out");
        Ok(())
    }

    /// Re-export the live session and persist it, keeping the original
    /// creation time.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<UserIdentity> {
        let state = self
            .authenticator
            .export_session()
            .await?
            .ok_or_else(|| CadenceError::AuthRequired {
                message: "no live session to refresh".to_string(),
            })?;

        let user = match self.current_user.read().await.clone() {
            Some(user) if !user.is_placeholder() => user,
            _ => self.identify().await,
        };
        let record = match self.vault.load().await {
            Ok(Some(existing)) => existing.refreshed(state.clone(), &user),
            Ok(None) => SessionRecord::new(state.clone(), &user),
            Err(e) => {
                warn!(error = %e, "Could not read existing record, writing a new one");
                SessionRecord::new(state.clone(), &user)
            }
        };

        self.vault.save(&record).await?;
        self.hydrate(&state).await;
        *self.current_user.write().await = Some(user.clone());
        debug!(user_id = %user.user_id, "Session refreshed");
        Ok(user)
    }

    /// Identity from memory, else from the plaintext cache.
    pub async fn current_user(&self) -> Option<UserIdentity> {
        if let Some(user) = self.current_user.read().await.clone() {
            return Some(user);
        }
        self.vault.cached_identity().await.map(|c| c.identity())
    }

    /// Make sure a session is in place before a backend call, restoring
    /// from the vault if needed. Never runs a login flow.
    pub async fn ensure_authenticated(&self) -> Result<UserIdentity> {
        if let Some(user) = self.current_user.read().await.clone() {
            return Ok(user);
        }
        if let Some(user) = self.restore_from_vault().await {
            return Ok(user);
        }
        if self.authenticator.has_live_session().await {
            return Ok(self.identify().await);
        }
        Err(CadenceError::AuthRequired {
            message: "not logged in; run `cadence login` first".to_string(),
        })
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    async fn restore_from_vault(&self) -> Option<UserIdentity> {
        let record = match self.vault.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Vault could not be read");
                return None;
            }
        };

        let user = record.identity();
        self.hydrate(&record.session_blob).await;
        *self.current_user.write().await = Some(user.clone());
        Some(user)
    }

    async fn identify(&self) -> UserIdentity {
        let timeout = self.config.login_timeout();
        match tokio::time::timeout(timeout, self.authenticator.extract_identity()).await {
            Ok(Ok(user)) => user,
            Ok(Err(e)) => {
                warn!(error = %e, "Identity lookup failed, using placeholder");
                UserIdentity::placeholder()
            }
            Err(_) => {
                warn!("Identity lookup timed out, using placeholder");
                UserIdentity::placeholder()
            }
        }
    }

    async fn export_quietly(&self) -> Option<Value> {
        match self.authenticator.export_session().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Could not export session state");
                None
            }
        }
    }

    async fn persist(&self, record: SessionRecord) {
        if let Err(e) = self.vault.save(&record).await {
            warn!(error = %e, "Failed to persist session; it stays usable for this process");
        }
    }

    async fn hydrate(&self, state: &Value) {
        if let Some(router) = &self.router {
            if let Err(e) = router.restore_session(state).await {
                warn!(error = %e, "Backends did not accept the session state");
            }
        }
    }
}
