use crate::crypto::{self, VaultCipher};
use crate::error::{Result, VaultError};
use crate::fs::{remove_if_exists, write_atomic};
use crate::passphrase::PassphraseSource;
use cadence_core::config::StorageConfig;
use cadence_core::{SessionRecord, UserIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Version of the decrypted JSON payload. Records carrying any other
/// version are treated as absent.
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct VaultPayload {
    version: u32,
    record: SessionRecord,
}

/// Plaintext, non-secret identity metadata kept next to the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIdentity {
    pub user_id: String,
    pub user_name: String,
    pub updated_at: DateTime<Utc>,
}

impl CachedIdentity {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.user_id.clone(), self.user_name.clone())
    }
}

/// Encrypted at-rest store for the single session record.
///
/// The vault is the only component that reads or writes the persisted
/// secret. A record that fails verification for any reason is deleted and
/// reported as absent.
pub struct CredentialVault {
    vault_path: PathBuf,
    cache_path: PathBuf,
    passphrase: String,
    cipher: VaultCipher,
    max_age_hours: Option<u64>,
    write_lock: Mutex<()>,
}

impl CredentialVault {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let source = PassphraseSource::from_config(config.passphrase.as_deref());
        debug!(source = ?source, "Resolving vault passphrase");
        Self::with_passphrase(config, source.resolve())
    }

    pub fn with_passphrase(config: &StorageConfig, passphrase: impl Into<String>) -> Result<Self> {
        Ok(Self {
            vault_path: config.vault_path(),
            cache_path: config.cache_path(),
            passphrase: passphrase.into(),
            cipher: VaultCipher::new(config.kdf_iterations)?,
            max_age_hours: config.max_session_age_hours,
            write_lock: Mutex::new(()),
        })
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Encrypt and persist `record`, replacing any previous one atomically.
    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        let payload = VaultPayload {
            version: PAYLOAD_VERSION,
            record: record.clone(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        let blob = self.seal(plaintext).await?;

        let _guard = self.write_lock.lock().await;
        write_atomic(&self.vault_path, crypto::encode(&blob).as_bytes()).await?;

        let cached = CachedIdentity {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            updated_at: record.updated_at,
        };
        if let Err(e) = self.write_cache(&cached).await {
            warn!(error = %e, "Failed to write session identity cache");
        }

        info!(user_id = %record.user_id, "Session saved to vault");
        Ok(())
    }

    /// Load the stored record. Corrupt, undecryptable, wrong-version and
    /// expired records are purged and reported as `None`.
    pub async fn load(&self) -> Result<Option<SessionRecord>> {
        match self.open().await {
            Ok(record) => Ok(record),
            Err(e) if e.is_integrity_failure() => {
                warn!(error = %e, "Vault record failed verification, purging");
                self.clear().await?;
                Ok(None)
            }
            Err(e @ VaultError::Expired { .. }) => {
                info!(error = %e, "Stored session expired, purging");
                self.clear().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Structural check only: a file exists and is long enough to hold a
    /// record. Does not decrypt.
    pub async fn has_record(&self) -> bool {
        match tokio::fs::read_to_string(&self.vault_path).await {
            Ok(text) => crypto::decode(&text)
                .map(|blob| crypto::verify_integrity(&blob))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Delete the vault and the identity cache. Missing files are fine.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let removed = remove_if_exists(&self.vault_path).await?;
        remove_if_exists(&self.cache_path).await?;
        if removed {
            info!(path = %self.vault_path.display(), "Vault record removed");
        }
        Ok(())
    }

    /// Identity from the plaintext cache file, if present and readable.
    pub async fn cached_identity(&self) -> Option<CachedIdentity> {
        let text = tokio::fs::read_to_string(&self.cache_path).await.ok()?;
        match serde_json::from_str(&text) {
            Ok(cached) => Some(cached),
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable identity cache");
                None
            }
        }
    }

    async fn open(&self) -> Result<Option<SessionRecord>> {
        let text = match tokio::fs::read_to_string(&self.vault_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let blob = crypto::decode(&text)?;
        let plaintext = self.unseal(blob).await?;

        let value: serde_json::Value = serde_json::from_slice(&plaintext)?;
        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(0);
        if version != PAYLOAD_VERSION {
            return Err(VaultError::VersionMismatch {
                found: version,
                expected: PAYLOAD_VERSION,
            });
        }
        let payload: VaultPayload = serde_json::from_value(value)?;

        if let Some(max_hours) = self.max_age_hours {
            let age_hours = payload.record.age().num_hours();
            if age_hours >= max_hours as i64 {
                return Err(VaultError::Expired {
                    age_hours,
                    max_hours,
                });
            }
        }

        Ok(Some(payload.record))
    }

    async fn seal(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let cipher = self.cipher.clone();
        let passphrase = self.passphrase.clone();
        tokio::task::spawn_blocking(move || cipher.encrypt(&plaintext, &passphrase))
            .await
            .map_err(|e| VaultError::Crypto {
                message: format!("encryption task failed: {e}"),
            })?
    }

    async fn unseal(&self, blob: Vec<u8>) -> Result<Vec<u8>> {
        let cipher = self.cipher.clone();
        let passphrase = self.passphrase.clone();
        tokio::task::spawn_blocking(move || cipher.decrypt(&blob, &passphrase))
            .await
            .map_err(|e| VaultError::Crypto {
                message: format!("decryption task failed: {e}"),
            })?
    }

    async fn write_cache(&self, cached: &CachedIdentity) -> Result<()> {
        let json = serde_json::to_vec_pretty(cached)?;
        write_atomic(&self.cache_path, &json).await
    }
}
