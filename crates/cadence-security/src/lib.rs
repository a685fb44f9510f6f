pub mod crypto;
pub mod error;
mod fs;
pub mod passphrase;
pub mod vault;

pub use crypto::{verify_integrity, VaultCipher, DEFAULT_KDF_ITERATIONS, HEADER_LEN};
pub use error::{Result, VaultError};
pub use passphrase::{machine_passphrase, PassphraseSource};
pub use vault::{CachedIdentity, CredentialVault, PAYLOAD_VERSION};
