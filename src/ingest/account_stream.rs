//! Discovery from on-chain account updates.
//!
//! Subscribes to a program's accounts with data-size and memcmp filters and
//! turns each new matching pool account into a [`NewTokenEvent`].

use anyhow::{Context, Result};
use futures::StreamExt;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{EventTimestamp, IngestOutcome, NewTokenEvent, TokenIngestor};
use crate::config::IngestConfig;
use crate::types::{now_naive, to_millis};

const PUBKEY_LEN: usize = 32;

/// Wrapped SOL mint, the quote side of every pool we care about.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Bit-level account filter, applied server-side and re-checked locally.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFilter {
    pub program: SolPubkey,
    pub data_size: Option<u64>,
    pub memcmp: Vec<(usize, Vec<u8>)>,
}

impl AccountFilter {
    pub fn new(program: SolPubkey) -> Self {
        Self {
            program,
            data_size: None,
            memcmp: Vec::new(),
        }
    }

    pub fn with_data_size(mut self, size: u64) -> Self {
        self.data_size = Some(size);
        self
    }

    pub fn with_memcmp(mut self, offset: usize, bytes: impl Into<Vec<u8>>) -> Self {
        self.memcmp.push((offset, bytes.into()));
        self
    }

    /// True when `data` satisfies the size constraint and every memcmp.
    pub fn matches(&self, data: &[u8]) -> bool {
        if let Some(size) = self.data_size {
            if data.len() as u64 != size {
                return false;
            }
        }
        self.memcmp.iter().all(|(offset, bytes)| {
            data.get(*offset..offset + bytes.len())
                .map(|window| window == bytes.as_slice())
                .unwrap_or(false)
        })
    }

    pub fn rpc_filters(&self) -> Vec<RpcFilterType> {
        let mut filters = Vec::with_capacity(self.memcmp.len() + 1);
        if let Some(size) = self.data_size {
            filters.push(RpcFilterType::DataSize(size));
        }
        for (offset, bytes) in &self.memcmp {
            filters.push(RpcFilterType::Memcmp(Memcmp::new_raw_bytes(*offset, bytes.clone())));
        }
        filters
    }
}

/// Where the interesting pubkeys live inside a pool account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAccountLayout {
    pub mint_offset: usize,
    pub creator_offset: Option<usize>,
}

impl PoolAccountLayout {
    /// AMM pool layout: 8-byte discriminator, bump, u16 index, creator, base mint, quote mint.
    pub fn amm_pool() -> Self {
        Self {
            mint_offset: 43,
            creator_offset: Some(11),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            mint_offset: config.stream_mint_offset,
            creator_offset: Some(config.stream_creator_offset),
        }
    }

    fn read_pubkey(data: &[u8], offset: usize) -> Option<SolPubkey> {
        let bytes: [u8; PUBKEY_LEN] = data.get(offset..offset + PUBKEY_LEN)?.try_into().ok()?;
        Some(SolPubkey::new_from_array(bytes))
    }

    /// Decode `(mint, creator)` from account data.
    pub fn decode(&self, data: &[u8]) -> Option<(SolPubkey, Option<SolPubkey>)> {
        let mint = Self::read_pubkey(data, self.mint_offset)?;
        if mint == SolPubkey::default() {
            return None;
        }
        let creator = self
            .creator_offset
            .and_then(|offset| Self::read_pubkey(data, offset));
        Some((mint, creator))
    }

    /// Build the discovery event for an account observed at `slot`.
    pub fn to_event(&self, account: &str, slot: u64, data: &[u8]) -> Option<NewTokenEvent> {
        let (mint, creator) = self.decode(data)?;
        Some(NewTokenEvent {
            mint: mint.to_string(),
            name: None,
            symbol: None,
            uri: None,
            bonding_curve: Some(account.to_string()),
            creator: creator.map(|c| c.to_string()),
            signature: format!("account:{}@{}", account, slot),
            timestamp: Some(EventTimestamp::Millis(to_millis(now_naive()))),
        })
    }
}

pub struct AccountStreamIngestor {
    ws_url: String,
    filter: AccountFilter,
    layout: PoolAccountLayout,
    ingestor: Arc<TokenIngestor>,
}

impl AccountStreamIngestor {
    pub fn new(
        ws_url: impl Into<String>,
        filter: AccountFilter,
        layout: PoolAccountLayout,
        ingestor: Arc<TokenIngestor>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            filter,
            layout,
            ingestor,
        }
    }

    /// Filter for AMM pools quoted in wrapped SOL, built from config.
    pub fn filter_from_config(config: &IngestConfig) -> Result<Option<AccountFilter>> {
        let Some(program) = &config.stream_program else {
            return Ok(None);
        };
        let program = SolPubkey::from_str(program).context("invalid ingest.stream_program")?;
        let wsol = SolPubkey::from_str(WSOL_MINT).context("invalid WSOL mint constant")?;
        let quote_offset = config.stream_mint_offset + PUBKEY_LEN;
        let mut filter = AccountFilter::new(program).with_memcmp(quote_offset, wsol.to_bytes().to_vec());
        if let Some(size) = config.stream_data_size {
            filter = filter.with_data_size(size);
        }
        Ok(Some(filter))
    }

    /// Run one decoded account through the filter and the ingestor.
    pub async fn handle_account(&self, account: &str, slot: u64, data: &[u8]) -> Result<Option<IngestOutcome>> {
        if !self.filter.matches(data) {
            return Ok(None);
        }
        let Some(event) = self.layout.to_event(account, slot, data) else {
            debug!("Account {} matched filter but did not decode", account);
            return Ok(None);
        };
        let outcome = self.ingestor.ingest(event).await?;
        Ok(Some(outcome))
    }

    /// Subscribe and ingest until shutdown, reconnecting with capped backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_millis(500);
        loop {
            tokio::select! {
                result = self.subscribe_once() => {
                    match result {
                        Ok(()) => {
                            info!("Account stream closed, reconnecting");
                            backoff = Duration::from_millis(500);
                        }
                        Err(e) => warn!("Account stream error: {:#}; retrying in {:?}", e, backoff),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Account stream shutting down");
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    async fn subscribe_once(&self) -> Result<()> {
        let client = PubsubClient::new(&self.ws_url)
            .await
            .context("Failed to connect account stream")?;
        let config = RpcProgramAccountsConfig {
            filters: Some(self.filter.rpc_filters()),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(CommitmentConfig::confirmed()),
                ..Default::default()
            },
            with_context: Some(true),
            ..Default::default()
        };
        let (mut stream, unsubscribe) = client
            .program_subscribe(&self.filter.program, Some(config))
            .await
            .context("program subscription failed")?;
        info!("Subscribed to accounts of program {}", self.filter.program);

        while let Some(update) = stream.next().await {
            let slot = update.context.slot;
            let account = update.value.pubkey;
            let Some(data) = update.value.account.data.decode() else {
                continue;
            };
            if let Err(e) = self.handle_account(&account, slot, &data).await {
                warn!("Failed to ingest account {}: {:#}", account, e);
            }
        }

        unsubscribe().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;
    use crate::storage::{SqliteStore, Store};

    fn pool_account(creator: &SolPubkey, mint: &SolPubkey, quote: &SolPubkey) -> Vec<u8> {
        let mut data = vec![0u8; 211];
        data[11..43].copy_from_slice(creator.as_ref());
        data[43..75].copy_from_slice(mint.as_ref());
        data[75..107].copy_from_slice(quote.as_ref());
        data
    }

    fn wsol() -> SolPubkey {
        SolPubkey::from_str(WSOL_MINT).unwrap()
    }

    #[test]
    fn test_filter_matches_memcmp_and_size() {
        let program = SolPubkey::new_unique();
        let filter = AccountFilter::new(program)
            .with_data_size(211)
            .with_memcmp(75, wsol().to_bytes().to_vec());

        let good = pool_account(&SolPubkey::new_unique(), &SolPubkey::new_unique(), &wsol());
        let wrong_quote = pool_account(&SolPubkey::new_unique(), &SolPubkey::new_unique(), &SolPubkey::new_unique());
        assert!(filter.matches(&good));
        assert!(!filter.matches(&wrong_quote));
        assert!(!filter.matches(&good[..100]));
        assert_eq!(filter.rpc_filters().len(), 2);
    }

    #[test]
    fn test_layout_decodes_event() {
        let creator = SolPubkey::new_unique();
        let mint = SolPubkey::new_unique();
        let data = pool_account(&creator, &mint, &wsol());
        let event = PoolAccountLayout::amm_pool().to_event("PoolAcct", 42, &data).unwrap();
        assert_eq!(event.mint, mint.to_string());
        assert_eq!(event.creator, Some(creator.to_string()));
        assert_eq!(event.signature, "account:PoolAcct@42");
    }

    #[tokio::test]
    async fn test_handle_account_ingests_once() -> Result<()> {
        let store = SqliteStore::in_memory().await?;
        let ingestor = Arc::new(TokenIngestor::new(store.clone(), PipelineMetrics::new()));
        let config = IngestConfig {
            stream_program: Some(SolPubkey::new_unique().to_string()),
            ..IngestConfig::default()
        };
        let filter = AccountStreamIngestor::filter_from_config(&config)?.unwrap();
        let stream = AccountStreamIngestor::new(
            "ws://unused",
            filter,
            PoolAccountLayout::from_config(&config),
            ingestor,
        );

        let mint = SolPubkey::new_unique();
        let data = pool_account(&SolPubkey::new_unique(), &mint, &wsol());
        assert_eq!(stream.handle_account("Pool1", 1, &data).await?, Some(IngestOutcome::Inserted));
        assert_eq!(stream.handle_account("Pool1", 2, &data).await?, Some(IngestOutcome::Skipped));
        assert!(store.get_new_token(&mint.to_string()).await?.is_some());

        let unrelated = pool_account(&SolPubkey::new_unique(), &mint, &SolPubkey::new_unique());
        assert_eq!(stream.handle_account("Pool2", 3, &unrelated).await?, None);
        Ok(())
    }
}
