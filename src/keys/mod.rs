//! Signing-key custody: envelope encryption, the decrypted-key cache and
//! master-key rotation.
//!
//! Plaintext keys only exist inside [`SigningKey`], whose `Debug` output is
//! redacted. Everything persisted or sent across tasks is the sealed blob.

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey as SolPubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::fmt;
use std::sync::Arc;

pub mod envelope;
pub mod vault;

pub use envelope::MasterKey;
pub use vault::{rotate_master_key, KeyVault, SignerDirectory};

/// A decrypted ed25519 keypair.
#[derive(Clone)]
pub struct SigningKey {
    keypair: Arc<Keypair>,
}

impl SigningKey {
    pub fn generate() -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
        }
    }

    /// Build from the 64-byte secret+public encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let keypair = Keypair::from_bytes(bytes).context("malformed keypair bytes")?;
        Ok(Self {
            keypair: Arc::new(keypair),
        })
    }

    /// Build from a base-58 encoded 64-byte keypair (the common wallet export format).
    pub fn from_base58(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded.trim())
            .into_vec()
            .context("signing key is not valid base58")?;
        Self::from_bytes(&bytes)
    }

    pub fn pubkey(&self) -> SolPubkey {
        self.keypair.pubkey()
    }

    /// Base-58 address of this key.
    pub fn address(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign_message(message)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub(crate) fn to_bytes(&self) -> [u8; 64] {
        self.keypair.to_bytes()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("address", &self.address())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let key = SigningKey::generate();
        let secret = bs58::encode(key.to_bytes()).into_string();
        let debug = format!("{:?}", key);
        assert!(debug.contains(&key.address()));
        assert!(!debug.contains(&secret));
    }

    #[test]
    fn test_base58_import() {
        let key = SigningKey::generate();
        let exported = bs58::encode(key.to_bytes()).into_string();
        let imported = SigningKey::from_base58(&exported).unwrap();
        assert_eq!(imported.address(), key.address());
        assert!(SigningKey::from_base58("not-base58-0OIl").is_err());
    }
}
