//! Chain-facing seams: RPC reads, bundle submission, transaction building
//! and swaps.
//!
//! The launch coordinator, bot pool, sniper and position monitor only ever
//! talk to these traits. Production adapters live in [`rpc`], [`jito`] and
//! [`portal`]; tests plug in-memory fakes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keys::SigningKey;
use crate::types::{Lamports, LaunchMetadata, Pubkey, TradeSide, Venue, LAMPORTS_PER_SOL};

pub mod jito;
pub mod portal;
pub mod rpc;

pub use jito::JitoBlockBuilder;
pub use portal::{PortalSwapExecutor, PortalTransactionFactory};
pub use rpc::RpcChainClient;

/// A fully signed transaction ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTx {
    /// First signature, base-58; doubles as the transaction id.
    pub signature: String,
    /// Fee payer address.
    pub signer: Pubkey,
    /// Wire encoding (bincode).
    pub wire: Vec<u8>,
}

impl SignedTx {
    pub fn from_versioned(tx: &VersionedTransaction) -> Result<Self> {
        let signature = tx
            .signatures
            .first()
            .context("transaction carries no signature")?
            .to_string();
        let signer = tx
            .message
            .static_account_keys()
            .first()
            .context("transaction has no fee payer")?
            .to_string();
        let wire = bincode::serialize(tx).context("failed to serialize transaction")?;
        Ok(Self {
            signature,
            signer,
            wire,
        })
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.wire).into_string()
    }
}

/// A signature observed in a confirmed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inclusion {
    pub signature: String,
    pub slot: u64,
    /// False when the transaction landed but its execution failed.
    pub success: bool,
}

/// Executed amounts of a landed swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub tx_id: String,
    pub slot: Option<u64>,
    /// Lamports spent (buy) or received (sell), network fee excluded.
    pub quote_amount: Lamports,
    /// Raw token units bought or sold.
    pub token_amount: u64,
    /// SOL per whole token.
    pub unit_price: f64,
    pub fee: Lamports,
}

impl FillReport {
    /// Derive the unit price from raw amounts and the mint's decimals.
    pub fn price_of(quote_amount: Lamports, token_amount: u64, decimals: u8) -> f64 {
        if token_amount == 0 {
            return 0.0;
        }
        let sol = quote_amount as f64 / LAMPORTS_PER_SOL as f64;
        let tokens = token_amount as f64 / 10f64.powi(i32::from(decimals));
        sol / tokens
    }
}

/// One swap against the venue aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub mint: Pubkey,
    pub side: TradeSide,
    /// Lamports for buys, raw token units for sells.
    pub amount: u64,
    pub slippage_bps: u16,
    pub venue: Venue,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn balance(&self, address: &str) -> Result<Lamports>;

    /// Recent blockhash, base-58.
    async fn latest_blockhash(&self) -> Result<String>;

    /// Confirmed inclusion per signature, `None` when not (yet) seen.
    async fn inclusions(&self, signatures: &[String]) -> Result<Vec<Option<Inclusion>>>;

    /// Executed amounts of `signature` for `owner` trading `mint`.
    async fn fill(&self, signature: &str, owner: &str, mint: &str) -> Result<FillReport>;
}

#[async_trait]
pub trait BlockBuilder: Send + Sync {
    /// Submit an ordered bundle; returns the builder's bundle id.
    async fn send_bundle(&self, transactions: &[SignedTx]) -> Result<String>;
}

/// Builds signed transactions. All transactions of one bundle share `blockhash`.
#[async_trait]
pub trait TransactionFactory: Send + Sync {
    async fn create_token(
        &self,
        creator: &SigningKey,
        mint: &SigningKey,
        metadata: &LaunchMetadata,
        venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx>;

    async fn buy(
        &self,
        buyer: &SigningKey,
        mint: &str,
        amount: Lamports,
        slippage_bps: u16,
        venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx>;

    /// One transaction carrying every transfer, so funding is all-or-nothing.
    async fn fund(
        &self,
        payer: &SigningKey,
        transfers: &[(Pubkey, Lamports)],
        blockhash: &str,
    ) -> Result<SignedTx>;

    /// Block-builder tip, appended as the last transaction of a bundle.
    async fn tip(&self, payer: &SigningKey, amount: Lamports, blockhash: &str) -> Result<SignedTx>;
}

#[async_trait]
pub trait SwapExecutor: Send + Sync {
    /// Execute and confirm one swap, returning what actually filled.
    async fn swap(&self, signer: &SigningKey, request: &SwapRequest) -> Result<FillReport>;
}

/// Polls for inclusion of a submitted bundle.
#[derive(Debug, Clone, Copy)]
pub struct LandingWatch {
    pub window: Duration,
    pub poll: Duration,
}

impl LandingWatch {
    pub fn new(window: Duration, poll: Duration) -> Self {
        Self { window, poll }
    }

    /// Wait until any of `signatures` is observed, or `None` once the window passes.
    ///
    /// After the first sighting one more poll lets the rest of the block's
    /// transactions show up before the result is final.
    pub async fn wait(
        &self,
        chain: &dyn ChainClient,
        signatures: &[String],
    ) -> Option<Vec<Option<Inclusion>>> {
        let deadline = Instant::now() + self.window;
        loop {
            match chain.inclusions(signatures).await {
                Ok(first) if first.iter().any(Option::is_some) => {
                    tokio::time::sleep(self.poll).await;
                    let settled = match chain.inclusions(signatures).await {
                        Ok(settled) => settled,
                        Err(e) => {
                            warn!("Settle poll failed, keeping first observation: {:#}", e);
                            first.clone()
                        }
                    };
                    let merged = first
                        .into_iter()
                        .zip(settled)
                        .map(|(a, b)| b.or(a))
                        .collect();
                    return Some(merged);
                }
                Ok(_) => debug!("No inclusion yet for {} signatures", signatures.len()),
                Err(e) => warn!("Inclusion poll failed: {:#}", e),
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::signature::Signer;
    use solana_sdk::system_instruction;
    use solana_sdk::transaction::Transaction;

    #[test]
    fn test_price_of() {
        // 0.5 SOL for 1,000 whole tokens with 6 decimals.
        let price = FillReport::price_of(500_000_000, 1_000_000_000, 6);
        assert!((price - 0.0005).abs() < 1e-12);
        assert_eq!(FillReport::price_of(1, 0, 6), 0.0);
    }

    #[test]
    fn test_signed_tx_from_versioned() {
        let payer = SigningKey::generate();
        let ix = system_instruction::transfer(&payer.pubkey(), &solana_sdk::pubkey::Pubkey::new_unique(), 10);
        let tx = Transaction::new_signed_with_payer(&[ix], Some(&payer.pubkey()), &[payer.keypair()], Hash::default());
        let expected = tx.signatures[0].to_string();
        let signed = SignedTx::from_versioned(&VersionedTransaction::from(tx)).unwrap();
        assert_eq!(signed.signature, expected);
        assert_eq!(signed.signer, payer.keypair().pubkey().to_string());
        assert!(!signed.to_base58().is_empty());
    }
}
