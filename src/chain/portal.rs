//! Transaction building through the swap API's local-signing endpoint.
//!
//! The API returns an unsigned transaction for create/buy/sell; we pin the
//! blockhash ourselves so every transaction of a bundle shares one, then sign
//! locally. Plain transfers (funding, tips) are built directly.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::system_instruction;
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::jito::random_tip_account;
use super::{ChainClient, FillReport, SignedTx, SwapExecutor, SwapRequest, TransactionFactory};
use crate::keys::SigningKey;
use crate::types::{lamports_to_sol, Lamports, LaunchMetadata, Pubkey, TradeSide, Venue};

/// Decimals of bonding-curve tokens; sell amounts are sent in whole tokens.
pub const CURVE_TOKEN_DECIMALS: u8 = 6;

const DEFAULT_PRIORITY_FEE_SOL: f64 = 0.000_05;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenMetadataBody<'a> {
    name: &'a str,
    symbol: &'a str,
    uri: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradeLocalBody<'a> {
    public_key: String,
    action: &'static str,
    mint: &'a str,
    amount: f64,
    denominated_in_sol: &'static str,
    slippage: f64,
    priority_fee: f64,
    pool: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_metadata: Option<TokenMetadataBody<'a>>,
}

fn pool_name(venue: Venue) -> &'static str {
    match venue {
        Venue::PumpFun => "pump",
        Venue::PumpSwap => "pump-amm",
        Venue::Raydium => "raydium",
        Venue::Meteora | Venue::Orca | Venue::Unknown => "auto",
    }
}

fn parse_blockhash(blockhash: &str) -> Result<Hash> {
    Hash::from_str(blockhash).map_err(|e| anyhow!("invalid blockhash {}: {}", blockhash, e))
}

/// Shared client for the `trade-local` endpoint.
#[derive(Clone)]
struct PortalClient {
    http: reqwest::Client,
    base_url: String,
    priority_fee_sol: f64,
}

impl PortalClient {
    async fn unsigned(&self, body: &TradeLocalBody<'_>) -> Result<VersionedTransaction> {
        let url = format!("{}/trade-local", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} request for {} failed", body.action, body.mint))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("swap api returned {} for {}: {}", status, body.action, text));
        }
        let bytes = response.bytes().await.context("failed to read swap api body")?;
        bincode::deserialize(&bytes).context("swap api returned an undecodable transaction")
    }

    /// Fetch, pin to `blockhash` and sign with every key in `signers`.
    async fn signed(
        &self,
        body: &TradeLocalBody<'_>,
        blockhash: Hash,
        signers: &[&Keypair],
    ) -> Result<VersionedTransaction> {
        let unsigned = self.unsigned(body).await?;
        let mut message = unsigned.message;
        message.set_recent_blockhash(blockhash);
        VersionedTransaction::try_new(message, signers)
            .map_err(|e| anyhow!("failed to sign {} transaction: {}", body.action, e))
    }

    fn trade_body<'a>(
        &self,
        signer: &SigningKey,
        side: TradeSide,
        mint: &'a str,
        amount: u64,
        slippage_bps: u16,
        venue: Venue,
    ) -> TradeLocalBody<'a> {
        let (amount, denominated_in_sol) = match side {
            TradeSide::Buy => (lamports_to_sol(amount), "true"),
            TradeSide::Sell => (
                amount as f64 / 10f64.powi(i32::from(CURVE_TOKEN_DECIMALS)),
                "false",
            ),
        };
        TradeLocalBody {
            public_key: signer.address(),
            action: side.as_str(),
            mint,
            amount,
            denominated_in_sol,
            slippage: f64::from(slippage_bps) / 100.0,
            priority_fee: self.priority_fee_sol,
            pool: pool_name(venue),
            token_metadata: None,
        }
    }
}

pub struct PortalTransactionFactory {
    client: PortalClient,
}

impl PortalTransactionFactory {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client: PortalClient {
                http,
                base_url: base_url.into(),
                priority_fee_sol: DEFAULT_PRIORITY_FEE_SOL,
            },
        }
    }
}

fn transfer_tx(payer: &SigningKey, transfers: &[(SolPubkey, Lamports)], blockhash: Hash) -> Result<SignedTx> {
    let instructions: Vec<_> = transfers
        .iter()
        .map(|(to, lamports)| system_instruction::transfer(&payer.pubkey(), to, *lamports))
        .collect();
    let tx = Transaction::new_signed_with_payer(
        &instructions,
        Some(&payer.pubkey()),
        &[payer.keypair()],
        blockhash,
    );
    SignedTx::from_versioned(&VersionedTransaction::from(tx))
}

#[async_trait]
impl TransactionFactory for PortalTransactionFactory {
    #[instrument(skip(self, creator, mint, metadata), fields(mint = %mint.address()))]
    async fn create_token(
        &self,
        creator: &SigningKey,
        mint: &SigningKey,
        metadata: &LaunchMetadata,
        venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx> {
        let mint_address = mint.address();
        let body = TradeLocalBody {
            public_key: creator.address(),
            action: "create",
            mint: &mint_address,
            amount: 0.0,
            denominated_in_sol: "true",
            slippage: 0.0,
            priority_fee: self.client.priority_fee_sol,
            pool: pool_name(venue),
            token_metadata: Some(TokenMetadataBody {
                name: &metadata.name,
                symbol: &metadata.symbol,
                uri: &metadata.metadata_uri,
            }),
        };
        let tx = self
            .client
            .signed(&body, parse_blockhash(blockhash)?, &[creator.keypair(), mint.keypair()])
            .await?;
        debug!("Built create transaction for {}", mint_address);
        SignedTx::from_versioned(&tx)
    }

    async fn buy(
        &self,
        buyer: &SigningKey,
        mint: &str,
        amount: Lamports,
        slippage_bps: u16,
        venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx> {
        let body = self
            .client
            .trade_body(buyer, TradeSide::Buy, mint, amount, slippage_bps, venue);
        let tx = self
            .client
            .signed(&body, parse_blockhash(blockhash)?, &[buyer.keypair()])
            .await?;
        SignedTx::from_versioned(&tx)
    }

    async fn fund(
        &self,
        payer: &SigningKey,
        transfers: &[(Pubkey, Lamports)],
        blockhash: &str,
    ) -> Result<SignedTx> {
        let transfers = transfers
            .iter()
            .map(|(to, lamports)| {
                SolPubkey::from_str(to)
                    .map(|key| (key, *lamports))
                    .map_err(|e| anyhow!("invalid funding target {}: {}", to, e))
            })
            .collect::<Result<Vec<_>>>()?;
        transfer_tx(payer, &transfers, parse_blockhash(blockhash)?)
    }

    async fn tip(&self, payer: &SigningKey, amount: Lamports, blockhash: &str) -> Result<SignedTx> {
        let tip_account = SolPubkey::from_str(random_tip_account())
            .map_err(|e| anyhow!("invalid tip account: {}", e))?;
        transfer_tx(payer, &[(tip_account, amount)], parse_blockhash(blockhash)?)
    }
}

/// Swaps outside a bundle: build, sign, send with confirmation, then read the fill.
pub struct PortalSwapExecutor {
    client: PortalClient,
    rpc: Arc<RpcClient>,
    chain: Arc<dyn ChainClient>,
}

impl PortalSwapExecutor {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        rpc: Arc<RpcClient>,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            client: PortalClient {
                http,
                base_url: base_url.into(),
                priority_fee_sol: DEFAULT_PRIORITY_FEE_SOL,
            },
            rpc,
            chain,
        }
    }
}

#[async_trait]
impl SwapExecutor for PortalSwapExecutor {
    #[instrument(skip(self, signer, request), fields(mint = %request.mint, side = %request.side))]
    async fn swap(&self, signer: &SigningKey, request: &SwapRequest) -> Result<FillReport> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("Failed to fetch blockhash for swap")?;
        let body = self.client.trade_body(
            signer,
            request.side,
            &request.mint,
            request.amount,
            request.slippage_bps,
            request.venue,
        );
        let tx = self
            .client
            .signed(&body, blockhash, &[signer.keypair()])
            .await?;
        let signature = self
            .rpc
            .send_and_confirm_transaction(&tx)
            .await
            .with_context(|| format!("{} of {} did not confirm", request.side, request.mint))?;
        info!("{} {} confirmed: {}", request.side, request.mint, signature);

        self.chain
            .fill(&signature.to_string(), &signer.address(), &request.mint)
            .await
    }
}
