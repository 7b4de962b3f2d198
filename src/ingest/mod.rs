//! Token feed ingestion.
//!
//! Discovery events arrive from the indexer webhook or are synthesized from
//! on-chain account updates ([`account_stream`]). Either way they end up as a
//! single `pending` queue row per mint. Ingestion never waits on enrichment.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey as SolPubkey;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{self, PipelineMetrics};
use crate::storage::Store;
use crate::types::{now_naive, try_from_millis, NewToken, TokenStatus};

pub mod account_stream;

pub use account_stream::{AccountFilter, AccountStreamIngestor, PoolAccountLayout};

/// Source-provided discovery time: unix millis or an ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    Millis(i64),
    Text(String),
}

impl EventTimestamp {
    /// Normalize to naive UTC.
    pub fn to_naive_utc(&self) -> PipelineResult<NaiveDateTime> {
        match self {
            EventTimestamp::Millis(ms) => millis_to_naive(*ms),
            EventTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(ms) = text.parse::<i64>() {
                    return millis_to_naive(ms);
                }
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    return Ok(dt.naive_utc());
                }
                // Offset-less ISO strings are taken as UTC.
                for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                    if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                        return Ok(naive);
                    }
                }
                Err(PipelineError::validation(format!("unparseable timestamp '{}'", text)))
            }
        }
    }
}

fn millis_to_naive(ms: i64) -> PipelineResult<NaiveDateTime> {
    try_from_millis(ms).ok_or_else(|| PipelineError::validation(format!("timestamp {} out of range", ms)))
}

/// New-token discovery event as delivered by the indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTokenEvent {
    pub mint: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub bonding_curve: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    pub signature: String,
    #[serde(default)]
    pub timestamp: Option<EventTimestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted,
    Skipped,
}

pub struct TokenIngestor {
    store: Arc<dyn Store>,
    metrics: PipelineMetrics,
}

impl TokenIngestor {
    pub fn new(store: Arc<dyn Store>, metrics: PipelineMetrics) -> Self {
        Self { store, metrics }
    }

    /// Write a `pending` queue row for the event's mint, or skip if it is known.
    #[instrument(skip(self, event), fields(mint = %event.mint))]
    pub async fn ingest(&self, event: NewTokenEvent) -> PipelineResult<IngestOutcome> {
        let token = Self::to_new_token(event)?;

        let inserted = self.store.insert_new_token(&token).await.map_err(|e| {
            error!("Failed to persist discovery of {}: {:#}", token.mint, e);
            PipelineError::Internal(e)
        })?;

        if inserted {
            self.metrics.increment(metrics::TOKENS_INGESTED).await;
            info!("Queued new token {} for enrichment", token.mint);
            Ok(IngestOutcome::Inserted)
        } else {
            self.metrics.increment(metrics::TOKENS_SKIPPED).await;
            debug!("Token {} already known, skipping", token.mint);
            Ok(IngestOutcome::Skipped)
        }
    }

    fn to_new_token(event: NewTokenEvent) -> PipelineResult<NewToken> {
        SolPubkey::from_str(&event.mint)
            .map_err(|_| PipelineError::validation(format!("invalid mint address '{}'", event.mint)))?;
        if event.signature.trim().is_empty() {
            return Err(PipelineError::validation("missing discovery signature"));
        }

        let now = now_naive();
        let discovered_at = match &event.timestamp {
            Some(ts) => ts.to_naive_utc()?,
            None => now,
        };

        Ok(NewToken {
            mint: event.mint,
            signature: event.signature,
            name: event.name,
            symbol: event.symbol,
            uri: event.uri,
            bonding_curve: event.bonding_curve,
            creator: event.creator,
            discovered_at,
            status: TokenStatus::Pending,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            market_fetched: false,
            risk_fetched: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use anyhow::Result;

    const MINT: &str = "So11111111111111111111111111111111111111112";

    fn event(timestamp: Option<EventTimestamp>) -> NewTokenEvent {
        NewTokenEvent {
            mint: MINT.to_string(),
            name: Some("Test".to_string()),
            symbol: Some("TST".to_string()),
            uri: None,
            bonding_curve: None,
            creator: None,
            signature: "5sig".to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_timestamp_normalization() {
        let ms = EventTimestamp::Millis(1_700_000_000_000).to_naive_utc().unwrap();
        let iso = EventTimestamp::Text("2023-11-14T22:13:20Z".to_string()).to_naive_utc().unwrap();
        let offset = EventTimestamp::Text("2023-11-15T00:13:20+02:00".to_string()).to_naive_utc().unwrap();
        let bare = EventTimestamp::Text("2023-11-14T22:13:20".to_string()).to_naive_utc().unwrap();
        assert_eq!(ms, iso);
        assert_eq!(iso, offset);
        assert_eq!(iso, bare);
        assert!(EventTimestamp::Text("yesterday".to_string()).to_naive_utc().is_err());
    }

    #[test]
    fn test_out_of_range_timestamp_is_rejected() {
        let err = EventTimestamp::Millis(i64::MAX).to_naive_utc().unwrap_err();
        assert_eq!(err.reason_code(), "validation");
        let err = EventTimestamp::Text("99999999999999999".to_string()).to_naive_utc().unwrap_err();
        assert_eq!(err.reason_code(), "validation");
        assert!(EventTimestamp::Millis(i64::MIN).to_naive_utc().is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_is_not_queued() -> Result<()> {
        let store = SqliteStore::in_memory().await?;
        let ingestor = TokenIngestor::new(store.clone(), PipelineMetrics::new());

        let err = ingestor.ingest(event(Some(EventTimestamp::Millis(i64::MAX)))).await.unwrap_err();
        assert_eq!(err.reason_code(), "validation");
        assert!(store.get_new_token(MINT).await?.is_none());
        Ok(())
    }

    #[test]
    fn test_timestamp_accepts_number_or_string_json() {
        let a: NewTokenEvent = serde_json::from_str(
            r#"{"mint":"So11111111111111111111111111111111111111112","signature":"s","timestamp":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(a.timestamp, Some(EventTimestamp::Millis(1_700_000_000_000)));
    }

    #[tokio::test]
    async fn test_ingest_dedupes_by_mint() -> Result<()> {
        let store = SqliteStore::in_memory().await?;
        let counters = PipelineMetrics::new();
        let ingestor = TokenIngestor::new(store.clone(), counters.clone());

        let first = ingestor.ingest(event(Some(EventTimestamp::Millis(1_000)))).await?;
        let second = ingestor.ingest(event(None)).await?;
        assert_eq!(first, IngestOutcome::Inserted);
        assert_eq!(second, IngestOutcome::Skipped);

        let row = store.get_new_token(MINT).await?.unwrap();
        assert_eq!(row.status, TokenStatus::Pending);
        assert_eq!(Some(row.discovered_at), try_from_millis(1_000));
        assert!(row.next_attempt_at <= now_naive());
        assert_eq!(counters.counter(metrics::TOKENS_SKIPPED).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_mint_rejected() -> Result<()> {
        let store = SqliteStore::in_memory().await?;
        let ingestor = TokenIngestor::new(store, PipelineMetrics::new());
        let mut bad = event(None);
        bad.mint = "not-a-mint".to_string();
        let err = ingestor.ingest(bad).await.unwrap_err();
        assert_eq!(err.reason_code(), "validation");
        Ok(())
    }
}
