//! Decrypted-key cache and key resolution.

use anyhow::{anyhow, Context, Result};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{MasterKey, SigningKey};
use crate::storage::Store;
use crate::types::OwnerKind;

/// Decrypts sealed blobs and keeps the result for a hard TTL, keyed by wallet.
///
/// Concurrent misses for the same wallet share one decryption.
#[derive(Clone)]
pub struct KeyVault {
    master: MasterKey,
    cache: Cache<String, SigningKey>,
}

impl KeyVault {
    pub fn new(master: MasterKey, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { master, cache }
    }

    pub fn master(&self) -> &MasterKey {
        &self.master
    }

    /// Decrypted key for `wallet`, opening `blob` on a cache miss.
    pub async fn signing_key(&self, wallet: &str, blob: &str) -> Result<SigningKey> {
        let master = self.master.clone();
        let blob = blob.to_string();
        let expected = wallet.to_string();
        self.cache
            .try_get_with(wallet.to_string(), async move {
                debug!("Decrypting signing key for {}", expected);
                let key = master.open_signing_key(&blob)?;
                if key.address() != expected {
                    return Err(anyhow!("key blob does not belong to {}", expected));
                }
                Ok::<_, anyhow::Error>(key)
            })
            .await
            .map_err(|e| anyhow!("failed to open signing key for {}: {:#}", wallet, e))
    }

    /// Generate a new keypair and return it with its sealed blob.
    pub fn generate(&self) -> Result<(SigningKey, String)> {
        let key = SigningKey::generate();
        let blob = self.master.seal_signing_key(&key)?;
        Ok((key, blob))
    }

    pub fn seal(&self, key: &SigningKey) -> Result<String> {
        self.master.seal_signing_key(key)
    }

    pub async fn invalidate(&self, wallet: &str) {
        self.cache.invalidate(wallet).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

/// Re-seal every stored key blob from `old` to `new`. Returns how many were rotated.
///
/// Blobs that already open under `new` are left untouched, so the sweep can be
/// re-run after a partial failure.
#[instrument(skip_all)]
pub async fn rotate_master_key(store: &dyn Store, old: &MasterKey, new: &MasterKey) -> Result<usize> {
    let mut rotated = 0;

    for user in store.list_users().await? {
        let Some(blob) = user.encrypted_key.as_deref() else {
            continue;
        };
        if new.open(blob).is_ok() {
            continue;
        }
        let plaintext = old
            .open(blob)
            .with_context(|| format!("user {} key opens under neither master key", user.wallet))?;
        store.update_user_key(&user.wallet, &new.seal(&plaintext)?).await?;
        rotated += 1;
    }

    for wallet in store.all_bot_wallets().await? {
        if new.open(&wallet.encrypted_key).is_ok() {
            continue;
        }
        match old.open(&wallet.encrypted_key) {
            Ok(plaintext) => {
                store
                    .update_bot_wallet_key(wallet.id, &new.seal(&plaintext)?)
                    .await?;
                rotated += 1;
            }
            Err(e) => {
                warn!("Bot wallet {} key could not be rotated: {}", wallet.address, e);
            }
        }
    }

    info!("Master key rotation complete: {} blobs re-sealed", rotated);
    Ok(rotated)
}

/// Resolves the signing key for a position owner by address.
#[derive(Clone)]
pub struct SignerDirectory {
    store: Arc<dyn Store>,
    vault: KeyVault,
}

impl SignerDirectory {
    pub fn new(store: Arc<dyn Store>, vault: KeyVault) -> Self {
        Self { store, vault }
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub async fn resolve(&self, kind: OwnerKind, address: &str) -> Result<SigningKey> {
        let blob = match kind {
            OwnerKind::User => self
                .store
                .get_user(address)
                .await?
                .and_then(|u| u.encrypted_key)
                .with_context(|| format!("no signing key on file for user {}", address))?,
            OwnerKind::BotWallet => self
                .store
                .get_bot_wallet_by_address(address)
                .await?
                .map(|w| w.encrypted_key)
                .with_context(|| format!("unknown bot wallet {}", address))?,
        };
        self.vault.signing_key(address, &blob).await
    }
}
