//! Market and risk data providers.
//!
//! Every provider sits behind a [`ProviderGate`] that bounds concurrency,
//! paces requests and quarantines a provider that keeps failing. Gates do not
//! retry: the enrichment worker's staged backoff and the position monitor's
//! sell loop own retries for the entities they update.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use super::circuit_breaker::CircuitBreaker;
use super::rate_limit::AdaptiveRateLimiter;
use crate::config::ProviderConfig;
use crate::ingest::account_stream::WSOL_MINT;
use crate::metrics::{self, PipelineMetrics};
use crate::types::{try_from_millis, Venue};

/// Metaplex token metadata program.
const METADATA_PROGRAM_ID: &str = "metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s";

/// Market view of the deepest SOL-quoted pair for a mint.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    pub pair_address: String,
    /// Price in SOL per token.
    pub price: f64,
    pub market_cap: f64,
    /// Quote-side (SOL) liquidity of the pair.
    pub liquidity_sol: f64,
    pub volume_24h: f64,
    pub volume_6h: f64,
    pub volume_1h: f64,
    pub volume_5m: f64,
    pub price_change_5m: f64,
    pub price_change_1h: f64,
    pub price_change_6h: f64,
    pub price_change_24h: f64,
    pub pair_created_at: Option<NaiveDateTime>,
    pub venue: Venue,
    pub socials_present: bool,
}

/// Risk observations; each provider fills what it knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskData {
    pub supply: Option<u64>,
    pub decimals: Option<u8>,
    pub top10_holder_pct: Option<f64>,
    pub mint_authority_present: Option<bool>,
    pub freeze_authority_present: Option<bool>,
    pub honeypot: Option<bool>,
    pub liquidity_burnt: Option<bool>,
    pub immutable_metadata: Option<bool>,
    pub webacy_risk: Option<f64>,
}

impl RiskData {
    /// Fill gaps in `self` from `other`; fields already known win.
    pub fn merge(self, other: RiskData) -> RiskData {
        RiskData {
            supply: self.supply.or(other.supply),
            decimals: self.decimals.or(other.decimals),
            top10_holder_pct: self.top10_holder_pct.or(other.top10_holder_pct),
            mint_authority_present: self.mint_authority_present.or(other.mint_authority_present),
            freeze_authority_present: self.freeze_authority_present.or(other.freeze_authority_present),
            honeypot: self.honeypot.or(other.honeypot),
            liquidity_burnt: self.liquidity_burnt.or(other.liquidity_burnt),
            immutable_metadata: self.immutable_metadata.or(other.immutable_metadata),
            webacy_risk: self.webacy_risk.or(other.webacy_risk),
        }
    }
}

/// Current mark for an open position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price: f64,
    pub liquidity_sol: f64,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when no tradeable pair exists yet.
    async fn market_data(&self, mint: &str) -> Result<Option<MarketData>>;
}

#[async_trait]
pub trait RiskProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn risk_data(&self, mint: &str) -> Result<RiskData>;
}

/// Live price and liquidity, polled by position monitors.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn quote(&self, mint: &str) -> Result<PriceQuote>;
}

/// Concurrency, pacing, circuit breaking and a hard deadline for one provider.
pub struct ProviderGate {
    name: String,
    permits: Arc<Semaphore>,
    limiter: Mutex<AdaptiveRateLimiter>,
    breaker: Mutex<CircuitBreaker>,
    timeout: Duration,
    metrics: PipelineMetrics,
}

impl ProviderGate {
    pub fn new(name: impl Into<String>, config: &ProviderConfig, metrics: PipelineMetrics) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            limiter: Mutex::new(AdaptiveRateLimiter::new(config.requests_per_second, 20, 0.2)),
            breaker: Mutex::new(CircuitBreaker::new(
                config.circuit_failure_threshold,
                config.circuit_cooldown_secs,
                config.circuit_sample_size,
            )),
            timeout: Duration::from_millis(config.request_timeout_ms),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `call` once under the gate.
    pub async fn call<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.breaker.lock().await.is_available(&self.name) {
            bail!("provider {} is cooling down", self.name);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .context("provider semaphore closed")?;
        // Clone out of the lock so waiting never blocks quota adjustments.
        let limiter = self.limiter.lock().await.limiter();
        limiter.until_ready().await;

        let outcome = match tokio::time::timeout(self.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("provider {} timed out after {:?}", self.name, self.timeout)),
        };

        match &outcome {
            Ok(_) => {
                self.breaker.lock().await.record_success(&self.name);
                self.limiter.lock().await.record_success();
            }
            Err(e) => {
                warn!("Provider {} call failed: {:#}", self.name, e);
                self.breaker.lock().await.record_failure(&self.name);
                self.limiter.lock().await.record_failure();
                self.metrics
                    .increment_labeled(metrics::PROVIDER_ERRORS, "provider", &self.name)
                    .await;
            }
        }
        outcome
    }
}

/// A provider wrapped in its gate.
pub struct Gated<P: ?Sized> {
    inner: Arc<P>,
    gate: ProviderGate,
}

impl<P: ?Sized> Gated<P> {
    pub fn new(inner: Arc<P>, gate: ProviderGate) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl<P: MarketDataProvider + ?Sized> MarketDataProvider for Gated<P> {
    fn name(&self) -> &str {
        self.gate.name()
    }

    async fn market_data(&self, mint: &str) -> Result<Option<MarketData>> {
        self.gate.call(|| self.inner.market_data(mint)).await
    }
}

#[async_trait]
impl<P: RiskProvider + ?Sized> RiskProvider for Gated<P> {
    fn name(&self) -> &str {
        self.gate.name()
    }

    async fn risk_data(&self, mint: &str) -> Result<RiskData> {
        self.gate.call(|| self.inner.risk_data(mint)).await
    }
}

#[async_trait]
impl<P: PriceSource + ?Sized> PriceSource for Gated<P> {
    async fn quote(&self, mint: &str) -> Result<PriceQuote> {
        self.gate.call(|| self.inner.quote(mint)).await
    }
}

// --- DexScreener ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DexTokensResponse {
    pairs: Option<Vec<DexPair>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DexPair {
    chain_id: String,
    dex_id: String,
    pair_address: String,
    base_token: DexToken,
    quote_token: DexToken,
    price_native: Option<String>,
    volume: DexWindows,
    price_change: DexWindows,
    liquidity: Option<DexLiquidity>,
    market_cap: Option<f64>,
    fdv: Option<f64>,
    pair_created_at: Option<i64>,
    info: Option<DexInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DexToken {
    address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DexWindows {
    m5: f64,
    h1: f64,
    h6: f64,
    h24: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DexLiquidity {
    quote: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DexInfo {
    websites: Vec<serde_json::Value>,
    socials: Vec<serde_json::Value>,
}

impl DexPair {
    fn liquidity_sol(&self) -> f64 {
        self.liquidity.as_ref().map(|l| l.quote).unwrap_or(0.0)
    }

    fn into_market_data(self) -> MarketData {
        let price = self
            .price_native
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);
        let socials_present = self
            .info
            .as_ref()
            .map(|i| !i.socials.is_empty() || !i.websites.is_empty())
            .unwrap_or(false);
        MarketData {
            liquidity_sol: self.liquidity_sol(),
            pair_address: self.pair_address,
            price,
            market_cap: self.market_cap.or(self.fdv).unwrap_or(0.0),
            volume_24h: self.volume.h24,
            volume_6h: self.volume.h6,
            volume_1h: self.volume.h1,
            volume_5m: self.volume.m5,
            price_change_5m: self.price_change.m5,
            price_change_1h: self.price_change.h1,
            price_change_6h: self.price_change.h6,
            price_change_24h: self.price_change.h24,
            pair_created_at: self.pair_created_at.and_then(try_from_millis),
            venue: Venue::from_dex_id(&self.dex_id),
            socials_present,
        }
    }
}

/// Pick the deepest Solana pair that sells `mint` for wrapped SOL.
fn best_sol_pair(mint: &str, pairs: Vec<DexPair>) -> Option<DexPair> {
    pairs
        .into_iter()
        .filter(|p| p.chain_id == "solana")
        .filter(|p| p.base_token.address == mint && p.quote_token.address == WSOL_MINT)
        .max_by(|a, b| a.liquidity_sol().total_cmp(&b.liquidity_sol()))
}

pub struct DexScreenerClient {
    http: Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_pair(&self, mint: &str) -> Result<Option<DexPair>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("DexScreener request failed")?;
        if !response.status().is_success() {
            bail!("DexScreener returned {}", response.status());
        }
        let body: DexTokensResponse = response
            .json()
            .await
            .context("Failed to parse DexScreener response")?;
        Ok(best_sol_pair(mint, body.pairs.unwrap_or_default()))
    }
}

#[async_trait]
impl MarketDataProvider for DexScreenerClient {
    fn name(&self) -> &str {
        "dexscreener"
    }

    #[instrument(skip(self))]
    async fn market_data(&self, mint: &str) -> Result<Option<MarketData>> {
        let pair = self.fetch_pair(mint).await?;
        if pair.is_none() {
            debug!("No SOL pair listed for {}", mint);
        }
        Ok(pair.map(DexPair::into_market_data))
    }
}

#[async_trait]
impl PriceSource for DexScreenerClient {
    async fn quote(&self, mint: &str) -> Result<PriceQuote> {
        let pair = self
            .fetch_pair(mint)
            .await?
            .ok_or_else(|| anyhow!("no SOL pair for {}", mint))?;
        let data = pair.into_market_data();
        Ok(PriceQuote {
            price: data.price,
            liquidity_sol: data.liquidity_sol,
        })
    }
}

// --- Solana RPC ---

/// Fields of an SPL mint account.
#[derive(Debug, Clone, PartialEq)]
pub struct MintInfo {
    pub mint_authority: Option<SolPubkey>,
    pub supply: u64,
    pub decimals: u8,
    pub freeze_authority: Option<SolPubkey>,
}

fn read_coption_pubkey(data: &[u8], offset: usize) -> Result<Option<SolPubkey>> {
    let tag = data
        .get(offset..offset + 4)
        .context("mint account truncated")?;
    if tag == [0, 0, 0, 0] {
        return Ok(None);
    }
    let key: [u8; 32] = data
        .get(offset + 4..offset + 36)
        .context("mint account truncated")?
        .try_into()
        .context("bad pubkey width")?;
    Ok(Some(SolPubkey::new_from_array(key)))
}

/// Parse the 82-byte SPL mint layout (Token-2022 extensions follow and are ignored).
pub fn parse_mint_account(data: &[u8]) -> Result<MintInfo> {
    if data.len() < 82 {
        bail!("Invalid mint account data length {}", data.len());
    }
    let supply = u64::from_le_bytes(data[36..44].try_into().context("Invalid supply data")?);
    Ok(MintInfo {
        mint_authority: read_coption_pubkey(data, 0)?,
        supply,
        decimals: data[44],
        freeze_authority: read_coption_pubkey(data, 46)?,
    })
}

/// Read `is_mutable` from a Metaplex metadata account.
pub fn parse_metadata_is_mutable(data: &[u8]) -> Option<bool> {
    // key, update authority, mint
    let mut cursor = 1 + 32 + 32;
    // name, symbol, uri: u32 length-prefixed strings
    for _ in 0..3 {
        let len = u32::from_le_bytes(data.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
        cursor += 4 + len;
    }
    // seller fee bps
    cursor += 2;
    // Option<Vec<Creator>>, 34 bytes per creator
    match *data.get(cursor)? {
        0 => cursor += 1,
        _ => {
            let count = u32::from_le_bytes(data.get(cursor + 1..cursor + 5)?.try_into().ok()?) as usize;
            cursor += 5 + count * 34;
        }
    }
    // primary_sale_happened
    cursor += 1;
    data.get(cursor).map(|b| *b != 0)
}

/// Authorities, supply, holder concentration and metadata mutability via RPC.
pub struct RpcRiskProvider {
    rpc: Arc<RpcClient>,
}

impl RpcRiskProvider {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc }
    }

    async fn top10_pct(&self, mint: &SolPubkey, supply: u64) -> Result<f64> {
        let largest = self
            .rpc
            .get_token_largest_accounts(mint)
            .await
            .context("Failed to fetch token largest accounts")?;
        let held: u128 = largest
            .iter()
            .take(10)
            .filter_map(|a| a.amount.amount.parse::<u64>().ok())
            .map(u128::from)
            .sum();
        Ok(held as f64 / supply as f64 * 100.0)
    }

    async fn metadata_mutable(&self, mint: &SolPubkey) -> Result<Option<bool>> {
        let program = SolPubkey::from_str(METADATA_PROGRAM_ID).context("invalid metadata program id")?;
        let (address, _) = SolPubkey::find_program_address(
            &[b"metadata", program.as_ref(), mint.as_ref()],
            &program,
        );
        let account = self
            .rpc
            .get_account(&address)
            .await
            .context("Failed to fetch metadata account")?;
        Ok(parse_metadata_is_mutable(&account.data))
    }
}

#[async_trait]
impl RiskProvider for RpcRiskProvider {
    fn name(&self) -> &str {
        "rpc"
    }

    #[instrument(skip(self))]
    async fn risk_data(&self, mint: &str) -> Result<RiskData> {
        let key = SolPubkey::from_str(mint).context("invalid mint address")?;
        let account = self
            .rpc
            .get_account(&key)
            .await
            .context("Failed to fetch mint account")?;
        let info = parse_mint_account(&account.data)?;

        let top10_holder_pct = if info.supply > 0 {
            match self.top10_pct(&key, info.supply).await {
                Ok(pct) => Some(pct),
                Err(e) => {
                    debug!("Holder distribution unavailable for {}: {:#}", mint, e);
                    None
                }
            }
        } else {
            None
        };
        let immutable_metadata = match self.metadata_mutable(&key).await {
            Ok(mutable) => mutable.map(|m| !m),
            Err(e) => {
                debug!("Metadata account unavailable for {}: {:#}", mint, e);
                None
            }
        };

        Ok(RiskData {
            supply: Some(info.supply),
            decimals: Some(info.decimals),
            top10_holder_pct,
            mint_authority_present: Some(info.mint_authority.is_some()),
            freeze_authority_present: Some(info.freeze_authority.is_some()),
            immutable_metadata,
            ..RiskData::default()
        })
    }
}

// --- Webacy ---

pub struct WebacyClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl WebacyClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

/// Extract risk fields from a Webacy token report.
pub fn parse_webacy_report(report: &serde_json::Value) -> RiskData {
    let tags: HashSet<String> = report
        .get("issues")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|issue| issue.get("tags").and_then(|t| t.as_array()))
        .flatten()
        .filter_map(|tag| tag.get("key").and_then(|k| k.as_str()))
        .map(|k| k.to_ascii_lowercase())
        .collect();

    let has = |key: &str| tags.contains(key);
    RiskData {
        webacy_risk: report.get("overallRisk").and_then(|v| v.as_f64()),
        honeypot: Some(has("is_honeypot") || has("honeypot")),
        liquidity_burnt: if has("liquidity_not_burnt") || has("unlocked_liquidity") {
            Some(false)
        } else if has("liquidity_burnt") {
            Some(true)
        } else {
            None
        },
        immutable_metadata: if has("mutable_metadata") { Some(false) } else { None },
        ..RiskData::default()
    }
}

#[async_trait]
impl RiskProvider for WebacyClient {
    fn name(&self) -> &str {
        "webacy"
    }

    #[instrument(skip(self))]
    async fn risk_data(&self, mint: &str) -> Result<RiskData> {
        let url = format!("{}/tokens/{}?chain=sol", self.base_url, mint);
        let response = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .context("Webacy request failed")?;
        if !response.status().is_success() {
            bail!("Webacy returned {}", response.status());
        }
        let report: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Webacy response")?;
        Ok(parse_webacy_report(&report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINT: &str = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr";

    fn mint_account(authority: Option<SolPubkey>, supply: u64, freeze: Option<SolPubkey>) -> Vec<u8> {
        let mut data = vec![0u8; 82];
        if let Some(a) = authority {
            data[0..4].copy_from_slice(&1u32.to_le_bytes());
            data[4..36].copy_from_slice(a.as_ref());
        }
        data[36..44].copy_from_slice(&supply.to_le_bytes());
        data[44] = 6;
        data[45] = 1;
        if let Some(f) = freeze {
            data[46..50].copy_from_slice(&1u32.to_le_bytes());
            data[50..82].copy_from_slice(f.as_ref());
        }
        data
    }

    #[test]
    fn test_parse_mint_account() {
        let authority = SolPubkey::new_unique();
        let revoked = parse_mint_account(&mint_account(None, 1_000_000, None)).unwrap();
        assert_eq!(revoked.supply, 1_000_000);
        assert_eq!(revoked.decimals, 6);
        assert!(revoked.mint_authority.is_none());
        assert!(revoked.freeze_authority.is_none());

        let live = parse_mint_account(&mint_account(Some(authority), 5, Some(authority))).unwrap();
        assert_eq!(live.mint_authority, Some(authority));
        assert_eq!(live.freeze_authority, Some(authority));

        assert!(parse_mint_account(&[0u8; 40]).is_err());
    }

    #[test]
    fn test_parse_metadata_is_mutable() {
        let mut data = vec![4u8];
        data.extend_from_slice(&[0u8; 64]);
        for field in ["Token", "TKN", "https://x"] {
            data.extend_from_slice(&(field.len() as u32).to_le_bytes());
            data.extend_from_slice(field.as_bytes());
        }
        data.extend_from_slice(&0u16.to_le_bytes());
        data.push(1);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 34]);
        data.push(0);
        data.push(0);
        assert_eq!(parse_metadata_is_mutable(&data), Some(false));

        let last = data.len() - 1;
        data[last] = 1;
        assert_eq!(parse_metadata_is_mutable(&data), Some(true));
        assert_eq!(parse_metadata_is_mutable(&data[..20]), None);
    }

    #[test]
    fn test_best_sol_pair_prefers_deepest() {
        let body = serde_json::json!({
            "pairs": [
                {"chainId": "solana", "dexId": "raydium", "pairAddress": "shallow",
                 "baseToken": {"address": MINT}, "quoteToken": {"address": WSOL_MINT},
                 "priceNative": "0.0001", "liquidity": {"quote": 12.0}},
                {"chainId": "solana", "dexId": "pumpswap", "pairAddress": "deep",
                 "baseToken": {"address": MINT}, "quoteToken": {"address": WSOL_MINT},
                 "priceNative": "0.0002", "liquidity": {"quote": 40.0},
                 "volume": {"m5": 1.0, "h1": 2.0, "h6": 3.0, "h24": 4.0},
                 "pairCreatedAt": 1700000000000i64,
                 "info": {"socials": [{"type": "twitter", "url": "https://x.com/t"}]}},
                {"chainId": "solana", "dexId": "orca", "pairAddress": "usdc",
                 "baseToken": {"address": MINT}, "quoteToken": {"address": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"},
                 "liquidity": {"quote": 900.0}}
            ]
        });
        let parsed: DexTokensResponse = serde_json::from_value(body).unwrap();
        let data = best_sol_pair(MINT, parsed.pairs.unwrap()).unwrap().into_market_data();
        assert_eq!(data.pair_address, "deep");
        assert_eq!(data.venue, Venue::PumpSwap);
        assert_eq!(data.liquidity_sol, 40.0);
        assert_eq!(data.price, 0.0002);
        assert_eq!(data.volume_24h, 4.0);
        assert!(data.socials_present);
        assert_eq!(data.pair_created_at, try_from_millis(1_700_000_000_000));
    }

    #[test]
    fn test_webacy_report_tags() {
        let report = serde_json::json!({
            "overallRisk": 61.5,
            "issues": [{"tags": [{"key": "is_honeypot"}, {"key": "mutable_metadata"}]}]
        });
        let risk = parse_webacy_report(&report);
        assert_eq!(risk.webacy_risk, Some(61.5));
        assert_eq!(risk.honeypot, Some(true));
        assert_eq!(risk.immutable_metadata, Some(false));
        assert_eq!(risk.liquidity_burnt, None);
    }

    #[test]
    fn test_risk_merge_keeps_known_fields() {
        let rpc = RiskData {
            supply: Some(10),
            mint_authority_present: Some(false),
            ..RiskData::default()
        };
        let webacy = RiskData {
            supply: Some(99),
            honeypot: Some(false),
            ..RiskData::default()
        };
        let merged = rpc.merge(webacy);
        assert_eq!(merged.supply, Some(10));
        assert_eq!(merged.honeypot, Some(false));
        assert_eq!(merged.mint_authority_present, Some(false));
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RiskProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn risk_data(&self, _mint: &str) -> Result<RiskData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("upstream 500")
        }
    }

    #[tokio::test]
    async fn test_gate_opens_circuit_and_stops_calling() {
        let config = ProviderConfig {
            circuit_failure_threshold: 1,
            requests_per_second: 100,
            ..ProviderConfig::default()
        };
        let metrics_sink = PipelineMetrics::new();
        let inner = Arc::new(Flaky { calls: AtomicUsize::new(0) });
        let gated = Gated::new(inner.clone(), ProviderGate::new("flaky", &config, metrics_sink.clone()));

        // Healthy -> degraded -> cooling down after two failures.
        assert!(gated.risk_data(MINT).await.is_err());
        assert!(gated.risk_data(MINT).await.is_err());
        let err = gated.risk_data(MINT).await.unwrap_err();
        assert!(err.to_string().contains("cooling down"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        let snapshot = metrics_sink.snapshot().await;
        assert_eq!(snapshot.counters["provider_errors_total{provider=\"flaky\"}"], 2);
    }

    struct Slow;

    #[async_trait]
    impl PriceSource for Slow {
        async fn quote(&self, _mint: &str) -> Result<PriceQuote> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PriceQuote { price: 1.0, liquidity_sol: 1.0 })
        }
    }

    #[tokio::test]
    async fn test_gate_enforces_deadline() {
        let config = ProviderConfig {
            request_timeout_ms: 20,
            ..ProviderConfig::default()
        };
        let gated = Gated::new(Arc::new(Slow), ProviderGate::new("slow", &config, PipelineMetrics::new()));
        let err = gated.quote(MINT).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
