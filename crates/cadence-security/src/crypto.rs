//! Authenticated encryption for vault records.
//!
//! Blob layout: `salt(64) || iv(16) || tag(16) || ciphertext`. The key is
//! derived with PBKDF2-HMAC-SHA512 from the passphrase and a fresh salt, and
//! the payload is sealed with AES-256-GCM using a 16-byte IV.

use crate::error::{Result, VaultError};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

pub const SALT_LEN: usize = 64;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Encrypts and decrypts vault blobs with a fixed KDF iteration count.
///
/// Both directions run the full key derivation and are CPU-bound; async
/// callers should move them off the runtime workers.
#[derive(Clone)]
pub struct VaultCipher {
    iterations: NonZeroU32,
    rng: SystemRandom,
}

impl VaultCipher {
    pub fn new(iterations: u32) -> Result<Self> {
        let iterations = NonZeroU32::new(iterations).ok_or_else(|| VaultError::Config {
            message: "KDF iteration count must be non-zero".to_string(),
        })?;
        Ok(Self {
            iterations,
            rng: SystemRandom::new(),
        })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.get()
    }

    /// Seal `plaintext`. Salt and IV are drawn fresh on every call.
    pub fn encrypt(&self, plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        self.fill_random(&mut salt)?;
        self.fill_random(&mut iv)?;

        let cipher = self.cipher_for(&salt, passphrase)?;
        let mut ciphertext = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut ciphertext)
            .map_err(|_| VaultError::Crypto {
                message: "encryption failed".to_string(),
            })?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a blob produced by [`VaultCipher::encrypt`]. A tag mismatch
    /// (tampering or wrong passphrase) yields `IntegrityCheckFailed` and no
    /// plaintext at all.
    pub fn decrypt(&self, blob: &[u8], passphrase: &str) -> Result<Vec<u8>> {
        if !verify_integrity(blob) {
            return Err(VaultError::Truncated { len: blob.len() });
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let cipher = self.cipher_for(salt, passphrase)?;
        let mut plaintext = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(iv),
                b"",
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| VaultError::IntegrityCheckFailed)?;

        Ok(plaintext)
    }

    fn cipher_for(&self, salt: &[u8], passphrase: &str) -> Result<Aes256Gcm16> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA512,
            self.iterations,
            salt,
            passphrase.as_bytes(),
            &mut key,
        );
        let cipher = Aes256Gcm16::new_from_slice(&key).map_err(|_| VaultError::Crypto {
            message: "derived key has the wrong length".to_string(),
        });
        key.fill(0);
        cipher
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        self.rng.fill(buf).map_err(|_| VaultError::Crypto {
            message: "system random number generator unavailable".to_string(),
        })
    }
}

/// Cheap structural pre-check run before attempting a full decryption.
pub fn verify_integrity(blob: &[u8]) -> bool {
    blob.len() >= HEADER_LEN
}

pub fn encode(blob: &[u8]) -> String {
    hex::encode(blob)
}

pub fn decode(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|e| VaultError::Encoding {
        message: e.to_string(),
    })
}
