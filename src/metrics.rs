//! Named counters and gauges for the pipeline, exposed as a JSON snapshot.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::now_naive;

pub const TOKENS_INGESTED: &str = "tokens_ingested_total";
pub const TOKENS_SKIPPED: &str = "tokens_skipped_total";
pub const TOKENS_ENRICHED: &str = "tokens_enriched_total";
pub const TOKENS_REJECTED: &str = "tokens_rejected_total";
pub const TOKENS_SCORED: &str = "tokens_scored_total";
pub const ENRICHMENT_RETRIES: &str = "enrichment_retries_total";
pub const PROVIDER_ERRORS: &str = "provider_errors_total";
pub const SNIPER_BUYS: &str = "sniper_buys_total";
pub const SNIPER_FILTERED: &str = "sniper_filtered_total";
pub const OPEN_POSITIONS: &str = "open_positions";
pub const ACTIVE_SNIPERS: &str = "active_snipers";

/// Shared metrics collector; clones share state.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    inner: Arc<RwLock<InternalMetrics>>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

/// Snapshot of current metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub taken_at: NaiveDateTime,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, name: &str) {
        self.add(name, 1).await;
    }

    pub async fn add(&self, name: &str, value: u64) {
        let mut metrics = self.inner.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += value;
        debug!("Incremented counter {} by {}", name, value);
    }

    /// Counter with a label suffix, e.g. `launches_total{outcome="landed"}`.
    pub async fn increment_labeled(&self, name: &str, label: &str, value: &str) {
        self.add(&format!("{}{{{}=\"{}\"}}", name, label, value), 1).await;
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut metrics = self.inner.write().await;
        metrics.gauges.insert(name.to_string(), value);
    }

    pub async fn adjust_gauge(&self, name: &str, delta: f64) {
        let mut metrics = self.inner.write().await;
        *metrics.gauges.entry(name.to_string()).or_insert(0.0) += delta;
    }

    pub async fn counter(&self, name: &str) -> u64 {
        self.inner.read().await.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.inner.read().await;
        MetricsSnapshot {
            counters: metrics.counters.clone(),
            gauges: metrics.gauges.clone(),
            taken_at: now_naive(),
        }
    }
}
