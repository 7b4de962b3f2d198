//! Enrichment worker.
//!
//! Pulls due `pending` tokens oldest-first, gathers market and risk data, and
//! either defers the token with staged backoff, rejects it once the retry
//! budget is spent, or persists the enrichment and scores it.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use dashmap::DashMap;
use nonempty::NonEmpty;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::providers::{MarketData, MarketDataProvider, RiskData, RiskProvider};
use crate::config::EnrichmentConfig;
use crate::error::PipelineError;
use crate::metrics::{self, PipelineMetrics};
use crate::scoring::ScoringEngine;
use crate::storage::Store;
use crate::types::{now_naive, EnrichedToken, NewToken, ScoredMint, TokenStatus};

const SCORED_CHANNEL_CAPACITY: usize = 1_024;

/// What happened to one token on one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentStep {
    Deferred,
    Rejected,
    Scored,
}

/// Why a token is not ready yet; persisted as `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotReady {
    NoPair,
    LowLiquidity,
    SupplyUnknown,
    TooYoung,
}

impl NotReady {
    fn as_str(&self) -> &'static str {
        match self {
            NotReady::NoPair => "no_pair",
            NotReady::LowLiquidity => "low_liquidity",
            NotReady::SupplyUnknown => "supply_unknown",
            NotReady::TooYoung => "pair_too_young",
        }
    }
}

pub struct EnrichmentWorker {
    store: Arc<dyn Store>,
    market: Arc<dyn MarketDataProvider>,
    /// Merged in order; the on-chain provider is always first.
    risk: NonEmpty<Arc<dyn RiskProvider>>,
    scoring: ScoringEngine,
    config: EnrichmentConfig,
    metrics: PipelineMetrics,
    scored_tx: broadcast::Sender<ScoredMint>,
    in_flight: DashMap<String, ()>,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn Store>,
        market: Arc<dyn MarketDataProvider>,
        risk: NonEmpty<Arc<dyn RiskProvider>>,
        scoring: ScoringEngine,
        config: EnrichmentConfig,
        metrics: PipelineMetrics,
    ) -> Arc<Self> {
        let (scored_tx, _) = broadcast::channel(SCORED_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            market,
            risk,
            scoring,
            config,
            metrics,
            scored_tx,
            in_flight: DashMap::new(),
        })
    }

    /// Stream of freshly scored mints.
    pub fn subscribe(&self) -> broadcast::Receiver<ScoredMint> {
        self.scored_tx.subscribe()
    }

    /// Poll for due tokens until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Enrichment worker started (concurrency {}, batch {})",
            self.config.max_concurrency, self.config.batch_size
        );
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.run_once().await {
                Ok(0) => {}
                Ok(n) => debug!("Enrichment pass handled {} tokens", n),
                Err(e) => error!("Enrichment pass failed: {:#}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("Enrichment worker shutting down");
                    return;
                }
            }
        }
    }

    /// One scheduler tick: process every due token, oldest discovery first.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize> {
        let due = self
            .store
            .due_tokens(now_naive(), self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for token in due {
            if self.in_flight.insert(token.mint.clone(), ()).is_some() {
                continue;
            }
            // Permits are taken in queue order so older tokens start first.
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("enrichment semaphore closed")?;
            let worker = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let mint = token.mint.clone();
                let result = worker.process(token).await;
                worker.in_flight.remove(&mint);
                (mint, result)
            });
        }

        let mut handled = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => handled += 1,
                Ok((mint, Err(e))) => error!("Enrichment of {} failed: {:#}", mint, e),
                Err(e) => error!("Enrichment task panicked: {}", e),
            }
        }
        Ok(handled)
    }

    #[instrument(skip(self, token), fields(mint = %token.mint, retry = token.retry_count))]
    async fn process(&self, mut token: NewToken) -> Result<EnrichmentStep> {
        let now = now_naive();
        let mut provider_error = None;

        let market = match self.market.market_data(&token.mint).await {
            Ok(market) => market,
            Err(e) => {
                provider_error = Some(format!("{}: {}", self.market.name(), e));
                None
            }
        };
        token.market_fetched = market.is_some();

        let mut risk = RiskData::default();
        for provider in self.risk.iter() {
            match provider.risk_data(&token.mint).await {
                Ok(data) => risk = risk.merge(data),
                Err(e) => {
                    debug!("Risk provider {} failed for {}: {:#}", provider.name(), token.mint, e);
                    provider_error.get_or_insert_with(|| format!("{}: {}", provider.name(), e));
                }
            }
        }
        token.risk_fetched = risk.supply.is_some();

        match self.check_ready(&token, market.as_ref(), &risk, now) {
            Ok(pair_age_secs) => {
                let market = market.context("ready token without market data")?;
                self.complete(token, market, risk, pair_age_secs, now).await
            }
            Err(not_ready) => {
                let reason = provider_error.unwrap_or_else(|| not_ready.as_str().to_string());
                self.defer(token, reason, now).await
            }
        }
    }

    /// Pair present, liquidity at threshold, supply non-zero, pair old enough.
    fn check_ready(
        &self,
        token: &NewToken,
        market: Option<&MarketData>,
        risk: &RiskData,
        now: NaiveDateTime,
    ) -> std::result::Result<u64, NotReady> {
        let market = market.ok_or(NotReady::NoPair)?;
        if market.liquidity_sol < self.config.min_liquidity_sol {
            return Err(NotReady::LowLiquidity);
        }
        if risk.supply.unwrap_or(0) == 0 {
            return Err(NotReady::SupplyUnknown);
        }
        let created = market.pair_created_at.unwrap_or(token.discovered_at);
        let age = (now - created).num_seconds().max(0) as u64;
        if age < self.config.min_pair_age_secs {
            return Err(NotReady::TooYoung);
        }
        Ok(age)
    }

    async fn defer(&self, mut token: NewToken, reason: String, now: NaiveDateTime) -> Result<EnrichmentStep> {
        let delay = self.config.backoff_for(token.retry_count);
        token.retry_count += 1;
        let elapsed = (now - token.discovered_at).num_seconds().max(0) as u64;

        if token.retry_count >= self.config.max_attempts || elapsed >= self.config.max_age_secs {
            let timeout = PipelineError::EnrichmentTimeout {
                mint: token.mint.clone(),
                attempts: token.retry_count,
            };
            warn!("{} (last: {})", timeout, reason);
            token.advance(TokenStatus::Rejected)?;
            token.last_error = Some(timeout.reason_code().to_string());
            self.store.update_new_token(&token).await?;
            self.metrics.increment(metrics::TOKENS_REJECTED).await;
            return Ok(EnrichmentStep::Rejected);
        }

        let delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        token.next_attempt_at = now + delay;
        token.last_error = Some(reason);
        debug!(
            "Token {} not ready ({}), attempt {} deferred until {}",
            token.mint,
            token.last_error.as_deref().unwrap_or_default(),
            token.retry_count,
            token.next_attempt_at
        );
        self.store.update_new_token(&token).await?;
        self.metrics.increment(metrics::ENRICHMENT_RETRIES).await;
        Ok(EnrichmentStep::Deferred)
    }

    async fn complete(
        &self,
        mut token: NewToken,
        market: MarketData,
        risk: RiskData,
        pair_age_secs: u64,
        now: NaiveDateTime,
    ) -> Result<EnrichmentStep> {
        let confidence = confidence(&risk);
        let mut enriched = EnrichedToken {
            mint: token.mint.clone(),
            price: market.price,
            market_cap: market.market_cap,
            liquidity_sol: market.liquidity_sol,
            volume_24h: market.volume_24h,
            volume_6h: market.volume_6h,
            volume_1h: market.volume_1h,
            volume_5m: market.volume_5m,
            price_change_5m: market.price_change_5m,
            price_change_1h: market.price_change_1h,
            price_change_6h: market.price_change_6h,
            price_change_24h: market.price_change_24h,
            pair_age_secs,
            venue: market.venue,
            socials_present: market.socials_present,
            // Unknown risk facts take their worst value.
            top10_holder_pct: risk.top10_holder_pct.unwrap_or(100.0),
            mint_authority_present: risk.mint_authority_present.unwrap_or(true),
            freeze_authority_present: risk.freeze_authority_present.unwrap_or(true),
            honeypot: risk.honeypot.unwrap_or(false),
            liquidity_burnt: risk.liquidity_burnt.unwrap_or(false),
            immutable_metadata: risk.immutable_metadata.unwrap_or(false),
            webacy_risk: risk.webacy_risk,
            risk_score: 0,
            moon_potential: 0,
            confidence,
            enriched_at: now,
        };
        enriched.risk_score = risk_score(&enriched);
        enriched.moon_potential = moon_potential(&enriched);

        self.store.save_enriched(&enriched).await?;
        token.advance(TokenStatus::Enriched)?;
        token.last_error = None;
        self.store.update_new_token(&token).await?;
        self.metrics.increment(metrics::TOKENS_ENRICHED).await;

        let scored = self.scoring.score(&enriched);
        self.store.save_score(&scored).await?;
        token.advance(TokenStatus::Scored)?;
        self.store.update_new_token(&token).await?;
        self.metrics.increment(metrics::TOKENS_SCORED).await;

        info!(
            "Scored {}: {} {} (risk {}, moon {})",
            token.mint, scored.score, scored.recommendation, enriched.risk_score, enriched.moon_potential
        );
        // No subscribers is fine; snipers may not be running.
        let _ = self.scored_tx.send(ScoredMint {
            token: enriched,
            scored,
        });
        Ok(EnrichmentStep::Scored)
    }
}

/// Heuristic rug risk, raised to the Webacy score when that is higher.
fn risk_score(token: &EnrichedToken) -> u8 {
    if token.honeypot {
        return 100;
    }
    let mut risk: f64 = 0.0;
    if token.mint_authority_present {
        risk += 25.0;
    }
    if token.freeze_authority_present {
        risk += 20.0;
    }
    if token.top10_holder_pct > 50.0 {
        risk += 20.0;
    } else if token.top10_holder_pct > 30.0 {
        risk += 10.0;
    }
    if !token.liquidity_burnt {
        risk += 10.0;
    }
    if !token.immutable_metadata {
        risk += 5.0;
    }
    if let Some(webacy) = token.webacy_risk {
        risk = risk.max(webacy);
    }
    risk.round().clamp(0.0, 100.0) as u8
}

/// Early-momentum estimate for small, young, socially-backed pairs.
fn moon_potential(token: &EnrichedToken) -> u8 {
    let mut moon = token.price_change_1h.clamp(0.0, 200.0) / 200.0 * 40.0;
    moon += token.price_change_5m.clamp(0.0, 50.0) / 50.0 * 20.0;
    if token.pair_age_secs < 3_600 {
        moon += 15.0;
    }
    if token.market_cap > 0.0 && token.market_cap < 100_000.0 {
        moon += 15.0;
    } else if token.market_cap < 1_000_000.0 {
        moon += 8.0;
    }
    if token.socials_present {
        moon += 10.0;
    }
    moon.round().clamp(0.0, 100.0) as u8
}

/// Share of risk facts actually observed; market and supply are known once ready.
fn confidence(risk: &RiskData) -> f64 {
    let mut points: u32 = 70;
    if risk.top10_holder_pct.is_some() {
        points += 10;
    }
    if risk.webacy_risk.is_some() {
        points += 10;
    }
    if risk.immutable_metadata.is_some() {
        points += 5;
    }
    if risk.liquidity_burnt.is_some() {
        points += 5;
    }
    f64::from(points.min(100)) / 100.0
}
