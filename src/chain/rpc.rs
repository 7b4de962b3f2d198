//! Solana JSON-RPC adapter.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::{UiTransactionEncoding, UiTransactionTokenBalance};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{ChainClient, FillReport, Inclusion};
use crate::types::Lamports;

pub struct RpcChainClient {
    rpc: Arc<RpcClient>,
}

impl RpcChainClient {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> Arc<RpcClient> {
        self.rpc.clone()
    }
}

/// Token holdings of one owner/mint pair inside a transaction's balance list.
struct TokenHolding {
    raw: u64,
    decimals: Option<u8>,
}

fn holding(balances: &[UiTransactionTokenBalance], owner: &str, mint: &str) -> TokenHolding {
    let mut holding = TokenHolding { raw: 0, decimals: None };
    for balance in balances.iter().filter(|b| b.mint == mint) {
        let balance_owner: Option<String> = balance.owner.clone().into();
        if balance_owner.as_deref() != Some(owner) {
            continue;
        }
        holding.raw += balance.ui_token_amount.amount.parse::<u64>().unwrap_or(0);
        holding.decimals = Some(balance.ui_token_amount.decimals);
    }
    holding
}

/// Fill from the fee payer's SOL movement and the owner's token movement.
///
/// Buys spend SOL and gain tokens; sells the reverse. The network fee is
/// reported separately and excluded from `quote_amount`.
pub fn compute_fill(
    signature: &str,
    slot: u64,
    fee: Lamports,
    sol_before: Lamports,
    sol_after: Lamports,
    tokens_before: u64,
    tokens_after: u64,
    decimals: u8,
) -> FillReport {
    let token_amount = tokens_after.abs_diff(tokens_before);
    let quote_amount = if tokens_after >= tokens_before {
        sol_before.saturating_sub(sol_after).saturating_sub(fee)
    } else {
        (sol_after + fee).saturating_sub(sol_before)
    };
    FillReport {
        tx_id: signature.to_string(),
        slot: Some(slot),
        quote_amount,
        token_amount,
        unit_price: FillReport::price_of(quote_amount, token_amount, decimals),
        fee,
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn balance(&self, address: &str) -> Result<Lamports> {
        let key = SolPubkey::from_str(address).context("invalid address")?;
        self.rpc
            .get_balance(&key)
            .await
            .with_context(|| format!("Failed to fetch balance of {}", address))
    }

    async fn latest_blockhash(&self) -> Result<String> {
        let hash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("Failed to fetch latest blockhash")?;
        Ok(hash.to_string())
    }

    async fn inclusions(&self, signatures: &[String]) -> Result<Vec<Option<Inclusion>>> {
        let parsed = signatures
            .iter()
            .map(|s| Signature::from_str(s).with_context(|| format!("invalid signature {}", s)))
            .collect::<Result<Vec<_>>>()?;
        let statuses = self
            .rpc
            .get_signature_statuses(&parsed)
            .await
            .context("Failed to fetch signature statuses")?
            .value;

        Ok(signatures
            .iter()
            .zip(statuses)
            .map(|(signature, status)| {
                let status = status?;
                if !status.satisfies_commitment(CommitmentConfig::confirmed()) {
                    return None;
                }
                Some(Inclusion {
                    signature: signature.clone(),
                    slot: status.slot,
                    success: status.err.is_none(),
                })
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn fill(&self, signature: &str, owner: &str, mint: &str) -> Result<FillReport> {
        let sig = Signature::from_str(signature).context("invalid signature")?;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .rpc
            .get_transaction_with_config(&sig, config)
            .await
            .with_context(|| format!("Failed to fetch transaction {}", signature))?;
        let meta = tx
            .transaction
            .meta
            .ok_or_else(|| anyhow!("transaction {} has no status meta", signature))?;

        let pre_tokens: Option<Vec<UiTransactionTokenBalance>> = meta.pre_token_balances.into();
        let post_tokens: Option<Vec<UiTransactionTokenBalance>> = meta.post_token_balances.into();
        let before = holding(&pre_tokens.unwrap_or_default(), owner, mint);
        let after = holding(&post_tokens.unwrap_or_default(), owner, mint);
        let decimals = after
            .decimals
            .or(before.decimals)
            .ok_or_else(|| anyhow!("transaction {} moved no {} for {}", signature, mint, owner))?;

        // Index 0 is the fee payer, which is the trading wallet.
        let sol_before = meta.pre_balances.first().copied().unwrap_or(0);
        let sol_after = meta.post_balances.first().copied().unwrap_or(0);

        let fill = compute_fill(
            signature, tx.slot, meta.fee, sol_before, sol_after, before.raw, after.raw, decimals,
        );
        debug!(
            "Fill {}: {} lamports for {} tokens at {:.10}",
            signature, fill.quote_amount, fill.token_amount, fill.unit_price
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_fill_buy() {
        // Paid 0.05 SOL + 5000 fee for 100 whole tokens (6 decimals).
        let fill = compute_fill("sig", 7, 5_000, 1_000_000_000, 949_995_000, 0, 100_000_000, 6);
        assert_eq!(fill.quote_amount, 50_000_000);
        assert_eq!(fill.token_amount, 100_000_000);
        assert_eq!(fill.slot, Some(7));
        assert!((fill.unit_price - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_compute_fill_sell() {
        let fill = compute_fill("sig", 9, 5_000, 949_995_000, 1_029_990_000, 100_000_000, 0, 6);
        assert_eq!(fill.quote_amount, 80_000_000);
        assert_eq!(fill.token_amount, 100_000_000);
        assert!((fill.unit_price - 0.0008).abs() < 1e-12);
    }
}
