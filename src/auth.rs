//! Wallet authentication by signed nonce.
//!
//! A nonce is a random UTF-8 string stored under `nonce:{wallet}` with a TTL.
//! Verification consumes it, so each nonce authenticates at most once.

use rand::distributions::Alphanumeric;
use rand::Rng;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use solana_sdk::signature::Signature;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ephemeral::EphemeralStore;
use crate::error::{PipelineError, PipelineResult};

const NONCE_LEN: usize = 32;

pub struct NonceAuthority {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl NonceAuthority {
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(wallet: &str) -> String {
        format!("nonce:{}", wallet)
    }

    /// The exact message a wallet must sign for `nonce`.
    pub fn message(nonce: &str) -> String {
        format!("Sign in to launchsnipe: {}", nonce)
    }

    /// Issue a fresh nonce for `wallet`, replacing any outstanding one.
    pub async fn issue(&self, wallet: &str) -> PipelineResult<String> {
        SolPubkey::from_str(wallet)
            .map_err(|_| PipelineError::validation(format!("'{}' is not a valid address", wallet)))?;

        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        self.store.set(&Self::key(wallet), &nonce, self.ttl).await?;
        debug!("Issued nonce for {}", wallet);
        Ok(Self::message(&nonce))
    }

    /// Check a base-58 signature over the issued message. The nonce is consumed either way.
    pub async fn verify(&self, wallet: &str, signature_b58: &str) -> PipelineResult<()> {
        let pubkey = SolPubkey::from_str(wallet)
            .map_err(|_| PipelineError::auth("invalid wallet address"))?;
        let nonce = self
            .store
            .take(&Self::key(wallet))
            .await?
            .ok_or_else(|| PipelineError::auth("nonce expired or never issued"))?;
        let signature = Signature::from_str(signature_b58)
            .map_err(|_| PipelineError::auth("malformed signature"))?;

        if !signature.verify(pubkey.as_ref(), Self::message(&nonce).as_bytes()) {
            warn!("Signature verification failed for {}", wallet);
            return Err(PipelineError::auth("bad signature"));
        }
        debug!("Wallet {} authenticated", wallet);
        Ok(())
    }
}
