//! AES-256-GCM envelope for signing keys at rest.
//!
//! Blob layout: `base64(nonce[12] || ciphertext+tag)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::SigningKey;

const NONCE_LEN: usize = 12;

/// Process-wide key wrapping every per-user and per-bot signing key.
#[derive(Clone)]
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl MasterKey {
    pub fn new(key: &[u8; 32]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("invalid master key length"))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("key encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob. Fails on a wrong key or any tampering.
    pub fn open(&self, blob: &str) -> Result<Vec<u8>> {
        let raw = BASE64.decode(blob.trim()).context("key blob is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("key blob too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("key blob does not open under this master key"))
    }

    pub fn seal_signing_key(&self, key: &SigningKey) -> Result<String> {
        self.seal(&key.to_bytes())
    }

    pub fn open_signing_key(&self, blob: &str) -> Result<SigningKey> {
        let bytes = self.open(blob)?;
        SigningKey::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}
