//! Launch coordinator: one spawned state machine per launch.
//!
//! draft → queued → submitting → landed, with any error before `landed`
//! ending in `failed` after the bot wallets are released. The machine runs
//! on its own task, so dropping the caller's future never interrupts a
//! bundle that is already in flight.

use anyhow::anyhow;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, error, info, instrument, warn};

use super::request::LaunchRequest;
use crate::bot_pool::{BotWalletPool, Reservation};
use crate::chain::{BlockBuilder, ChainClient, FillReport, LandingWatch, SignedTx, TransactionFactory};
use crate::config::LaunchConfig;
use crate::control::{ControlChannel, ControlEvent};
use crate::enrichment::PriceSource;
use crate::error::{PipelineError, PipelineResult};
use crate::keys::{KeyVault, SigningKey};
use crate::metrics::PipelineMetrics;
use crate::positions::{open_from_fill, trade_from_fill, Holder, PositionMonitor};
use crate::storage::Store;
use crate::types::{
    now_naive, ExitPolicy, LaunchState, OwnerKind, Position, Pubkey, Trade, TokenLaunch, TradeSide, User,
};

/// Final view of a launch that reached `landed`.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub launch: TokenLaunch,
    pub positions: Vec<Position>,
    pub trades: Vec<Trade>,
}

pub struct LaunchCoordinator {
    store: Arc<dyn Store>,
    pool: Arc<BotWalletPool>,
    vault: KeyVault,
    chain: Arc<dyn ChainClient>,
    builder: Arc<dyn BlockBuilder>,
    factory: Arc<dyn TransactionFactory>,
    prices: Arc<dyn PriceSource>,
    monitor: Arc<PositionMonitor>,
    control: ControlChannel,
    metrics: PipelineMetrics,
    config: LaunchConfig,
}

impl LaunchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<BotWalletPool>,
        vault: KeyVault,
        chain: Arc<dyn ChainClient>,
        builder: Arc<dyn BlockBuilder>,
        factory: Arc<dyn TransactionFactory>,
        prices: Arc<dyn PriceSource>,
        monitor: Arc<PositionMonitor>,
        control: ControlChannel,
        metrics: PipelineMetrics,
        config: LaunchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            vault,
            chain,
            builder,
            factory,
            prices,
            monitor,
            control,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    fn landing_watch(&self) -> LandingWatch {
        LandingWatch::new(
            Duration::from_secs(self.config.landing_timeout_secs),
            Duration::from_millis(self.config.landing_poll_ms),
        )
    }

    /// Run a launch to completion and report how it ended.
    ///
    /// Shape errors return before anything is persisted; every later failure
    /// is recorded on the launch row with its reason code.
    #[instrument(skip(self, request), fields(creator = %request.creator, bots = request.bot_count))]
    pub async fn launch(self: &Arc<Self>, request: LaunchRequest) -> PipelineResult<LaunchOutcome> {
        request.validate(&self.config)?;

        let creator = self
            .store
            .get_user(&request.creator)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("unknown creator {}", request.creator)))?;
        if !creator.role.can_launch() {
            return Err(PipelineError::validation(format!(
                "{} is registered as {} and cannot launch",
                creator.wallet, creator.role
            )));
        }
        let blob = creator
            .encrypted_key
            .clone()
            .ok_or_else(|| PipelineError::auth("no signing key on file"))?;
        let creator_key = self
            .vault
            .signing_key(&creator.wallet, &blob)
            .await
            .map_err(|e| PipelineError::auth(format!("{:#}", e)))?;

        let now = now_naive();
        let mut launch = TokenLaunch {
            id: 0,
            creator: creator.wallet.clone(),
            mint: None,
            metadata: request.metadata.clone(),
            bot_count: request.bot_count,
            per_bot_buy: request.per_bot_buy,
            pre_fund_amount: request.pre_fund(&self.config),
            creator_buy: request.creator_buy,
            venue: request.venue,
            sell_strategy_id: request.sell_strategy_id.clone(),
            state: LaunchState::Draft,
            bundle_id: None,
            landed_slot: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        launch.id = self.store.insert_launch(&launch).await?;
        info!("Launch {} drafted", launch.id);

        let run = LaunchRun {
            c: self.clone(),
            request,
            launch,
            creator,
            creator_key,
            reservation: None,
        };
        tokio::spawn(run.drive())
            .await
            .map_err(|e| PipelineError::Internal(anyhow!("launch task aborted: {}", e)))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegKind {
    Create,
    CreatorBuy,
    BotBuy,
    Tip,
}

/// One transaction of the launch bundle.
#[derive(Debug, Clone)]
struct Leg {
    kind: LegKind,
    signature: String,
    wallet: Pubkey,
}

struct Submitted {
    bundle_id: String,
    mint: Pubkey,
    legs: Vec<Leg>,
}

struct Landing {
    positions: Vec<Position>,
    trades: Vec<Trade>,
    landed_bots: usize,
}

enum Step {
    Draft,
    Queued,
    Submitting(Submitted),
    Landed(Landing),
}

/// State of one launch as it moves through the machine.
struct LaunchRun {
    c: Arc<LaunchCoordinator>,
    request: LaunchRequest,
    launch: TokenLaunch,
    creator: User,
    creator_key: SigningKey,
    reservation: Option<Reservation>,
}

impl LaunchRun {
    async fn drive(mut self) -> PipelineResult<LaunchOutcome> {
        let mut step = Step::Draft;
        loop {
            let result = match step {
                Step::Draft => self.draft().await.map(|()| Step::Queued),
                Step::Queued => self.queued().await.map(Step::Submitting),
                Step::Submitting(submitted) => self.submitting(submitted).await.map(Step::Landed),
                Step::Landed(landing) => {
                    return match self.landed(landing).await {
                        Ok(outcome) => Ok(outcome),
                        Err(e) => Err(self.fail(e).await),
                    }
                }
            };
            step = match result {
                Ok(next) => next,
                Err(e) => return Err(self.fail(e).await),
            };
        }
    }

    async fn transition(&mut self, state: LaunchState) -> PipelineResult<()> {
        self.launch.state = state;
        self.launch.updated_at = now_naive();
        self.c.store.update_launch(&self.launch).await?;
        self.c.control.publish(
            &self.launch.creator,
            ControlEvent::launch_status(self.launch.id, state.as_str(), None, None),
        );
        debug!("Launch {} -> {}", self.launch.id, state);
        Ok(())
    }

    /// Affordability, then reserve and pre-fund the bot wallets.
    async fn draft(&mut self) -> PipelineResult<()> {
        let required = self.request.estimated_cost(&self.c.config)?;
        let available = self.c.chain.balance(&self.creator.wallet).await?;
        if available < required {
            return Err(PipelineError::InsufficientBalance { required, available });
        }

        let reservation = self
            .c
            .pool
            .reserve(&self.creator.wallet, self.request.bot_count as usize)
            .await?;
        let reservation = self.reservation.insert(reservation);
        if !reservation.is_empty() {
            self.c
                .pool
                .pre_fund(
                    reservation,
                    &self.creator_key,
                    self.launch.pre_fund_amount,
                    self.request.per_bot_buy,
                )
                .await?;
        }

        self.transition(LaunchState::Queued).await
    }

    /// Build the bundle on one blockhash and hand it to the block builder.
    async fn queued(&mut self) -> PipelineResult<Submitted> {
        let config = &self.c.config;
        let venue = self.request.venue;
        let mint_key = SigningKey::generate();
        let mint = mint_key.address();
        let blockhash = self.c.chain.latest_blockhash().await?;

        let mut txs: Vec<SignedTx> = Vec::with_capacity(self.request.bundle_len(config));
        let mut legs = Vec::new();
        let mut push = |kind: LegKind, wallet: &str, tx: SignedTx| {
            legs.push(Leg {
                kind,
                signature: tx.signature.clone(),
                wallet: wallet.to_string(),
            });
            txs.push(tx);
        };

        let create = self
            .c
            .factory
            .create_token(&self.creator_key, &mint_key, &self.request.metadata, venue, &blockhash)
            .await?;
        push(LegKind::Create, &self.creator.wallet, create);

        if self.request.creator_buy > 0 {
            let buy = self
                .c
                .factory
                .buy(
                    &self.creator_key,
                    &mint,
                    self.request.creator_buy,
                    config.slippage_bps,
                    venue,
                    &blockhash,
                )
                .await?;
            push(LegKind::CreatorBuy, &self.creator.wallet, buy);
        }

        let wallets = self
            .reservation
            .as_ref()
            .map(|r| r.wallets.clone())
            .unwrap_or_default();
        for wallet in &wallets {
            let key = self.c.pool.signing_key(wallet).await?;
            let buy = self
                .c
                .factory
                .buy(&key, &mint, self.request.per_bot_buy, config.slippage_bps, venue, &blockhash)
                .await?;
            push(LegKind::BotBuy, &wallet.address, buy);
        }

        if config.tip_lamports > 0 {
            let tip = self
                .c
                .factory
                .tip(&self.creator_key, config.tip_lamports, &blockhash)
                .await?;
            push(LegKind::Tip, &self.creator.wallet, tip);
        }

        if let Some(reservation) = self.reservation.as_mut() {
            self.c.pool.consume(self.launch.id, reservation).await?;
        }

        let bundle_id = self
            .c
            .builder
            .send_bundle(&txs)
            .await
            .map_err(|e| PipelineError::BundleRejected(format!("{:#}", e)))?;
        info!("Launch {} bundle {} accepted ({} txs)", self.launch.id, bundle_id, txs.len());

        self.launch.mint = Some(mint.clone());
        self.launch.bundle_id = Some(bundle_id.clone());
        self.transition(LaunchState::Submitting).await?;
        Ok(Submitted { bundle_id, mint, legs })
    }

    /// Wait for inclusion and book every buy that landed.
    async fn submitting(&mut self, submitted: Submitted) -> PipelineResult<Landing> {
        let Submitted { bundle_id, mint, legs } = submitted;
        let signatures: Vec<String> = legs.iter().map(|l| l.signature.clone()).collect();
        let watch = self.c.landing_watch();

        let inclusions = watch
            .wait(self.c.chain.as_ref(), &signatures)
            .await
            .ok_or_else(|| PipelineError::BundleNotLanded {
                bundle_id: bundle_id.clone(),
                window_secs: watch.window.as_secs(),
            })?;

        let create_landed = legs
            .iter()
            .zip(&inclusions)
            .any(|(leg, inc)| leg.kind == LegKind::Create && inc.as_ref().is_some_and(|i| i.success));
        if !create_landed {
            return Err(PipelineError::BundleNotLanded {
                bundle_id,
                window_secs: watch.window.as_secs(),
            });
        }

        let entry_liquidity = self.entry_liquidity(&mint).await;

        let mut landing = Landing {
            positions: Vec::new(),
            trades: Vec::new(),
            landed_bots: 0,
        };
        let mut spent = Vec::new();

        for (leg, inclusion) in legs.iter().zip(&inclusions) {
            let Some(inclusion) = inclusion.as_ref().filter(|i| i.success) else {
                continue;
            };
            if leg.kind == LegKind::Create {
                self.launch.landed_slot = Some(inclusion.slot);
            }
            self.c.control.publish(
                &self.launch.creator,
                ControlEvent::bot_log(
                    format!("launch:{}:inclusion:{}", self.launch.id, leg.signature),
                    "info",
                    format!("{:?} transaction {} included in slot {}", leg.kind, leg.signature, inclusion.slot),
                ),
            );
            if !matches!(leg.kind, LegKind::CreatorBuy | LegKind::BotBuy) {
                continue;
            }

            if leg.kind == LegKind::BotBuy {
                landing.landed_bots += 1;
                spent.push(leg.wallet.clone());
            }
            let Some(fill) = self.read_fill(leg, &mint).await else {
                continue;
            };

            let holder = match leg.kind {
                LegKind::BotBuy => Holder {
                    owner: leg.wallet.clone(),
                    owner_kind: OwnerKind::BotWallet,
                    user: self.creator.wallet.clone(),
                },
                _ => Holder {
                    owner: self.creator.wallet.clone(),
                    owner_kind: OwnerKind::User,
                    user: self.creator.wallet.clone(),
                },
            };

            let position_id = if leg.kind == LegKind::BotBuy {
                let mut position = open_from_fill(&holder, &mint, Some(self.launch.id), &fill, entry_liquidity);
                position.id = self.c.store.insert_position(&position).await?;
                let id = position.id;
                landing.positions.push(position);
                Some(id)
            } else {
                None
            };

            let mut trade = trade_from_fill(
                &holder,
                &mint,
                TradeSide::Buy,
                &fill,
                Some(bundle_id.clone()),
                Some(self.launch.id),
                position_id,
            );
            trade.id = self.c.store.insert_trade(&trade).await?;
            self.c.control.publish(&self.launch.creator, ControlEvent::trade(&trade));
            landing.trades.push(trade);
        }

        if let Some(reservation) = self.reservation.as_mut() {
            self.c.pool.mark_consumed(reservation, &spent).await?;
        }

        if landing.landed_bots == self.request.bot_count as usize {
            self.transition(LaunchState::Landed).await?;
        } else {
            warn!(
                "Launch {} partially filled: {} of {} bot buys landed",
                self.launch.id, landing.landed_bots, self.request.bot_count
            );
        }
        Ok(landing)
    }

    /// Hand positions to the monitor; a partial fill still ends as a failure.
    async fn landed(&mut self, landing: Landing) -> PipelineResult<LaunchOutcome> {
        let policy = self.bot_exit_policy();
        let interval = self.c.monitor.scan_interval(Some(&self.creator));
        for position in &landing.positions {
            if let Err(e) = self.c.monitor.track(position.clone(), policy.clone(), interval) {
                error!("Position {} not monitored: {}", position.id, e);
            }
        }
        if !landing.positions.is_empty() {
            self.c.control.publish(
                &self.launch.creator,
                ControlEvent::launch_status(
                    self.launch.id,
                    "positions_opened",
                    None,
                    Some(format!("{} positions opened", landing.positions.len())),
                ),
            );
        }

        let expected = self.request.bot_count as usize;
        if landing.landed_bots < expected {
            return Err(PipelineError::PartialFill {
                landed: landing.landed_bots,
                expected,
            });
        }

        self.c
            .metrics
            .increment_labeled("launches_total", "outcome", LaunchState::Landed.as_str())
            .await;
        Ok(LaunchOutcome {
            launch: self.launch.clone(),
            positions: landing.positions,
            trades: landing.trades,
        })
    }

    fn bot_exit_policy(&self) -> ExitPolicy {
        self.c
            .config
            .sell_strategies
            .get(&self.request.sell_strategy_id)
            .cloned()
            .unwrap_or_else(|| self.creator.exit_policy.clone())
    }

    async fn entry_liquidity(&self, mint: &str) -> f64 {
        match tokio::time::timeout(Duration::from_secs(5), self.c.prices.quote(mint)).await {
            Ok(Ok(quote)) => quote.liquidity_sol,
            Ok(Err(e)) => {
                warn!("No entry liquidity for {}: {:#}", mint, e);
                0.0
            }
            Err(_) => {
                warn!("Entry liquidity quote for {} timed out", mint);
                0.0
            }
        }
    }

    async fn read_fill(&self, leg: &Leg, mint: &str) -> Option<FillReport> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(2))
            .take(3);
        match Retry::spawn(strategy, || self.c.chain.fill(&leg.signature, &leg.wallet, mint)).await {
            Ok(fill) => Some(fill),
            Err(e) => {
                warn!("Buy {} landed but its fill is unreadable: {:#}", leg.signature, e);
                self.c.control.publish(
                    &self.launch.creator,
                    ControlEvent::bot_log(
                        format!("launch:{}:unreadable:{}", self.launch.id, leg.signature),
                        "warn",
                        format!("buy {} landed for {} but could not be booked", leg.signature, leg.wallet),
                    ),
                );
                None
            }
        }
    }

    /// Release the pool, record the failure and tell the creator.
    async fn fail(&mut self, error: PipelineError) -> PipelineError {
        let reason = error.reason_code();
        warn!("Launch {} failed ({}): {}", self.launch.id, reason, error);

        if let Some(reservation) = self.reservation.as_mut() {
            let pool = &self.c.pool;
            let released = match pool.unbind(reservation).await {
                Ok(()) => pool.release(reservation).await,
                Err(e) => Err(e),
            };
            if let Err(e) = released {
                error!("Failed to release wallets of launch {}: {}", self.launch.id, e);
            }
        }

        self.launch.state = LaunchState::Failed;
        self.launch.failure_reason = Some(reason.to_string());
        self.launch.updated_at = now_naive();
        if let Err(e) = self.c.store.update_launch(&self.launch).await {
            error!("Failed to persist failure of launch {}: {:#}", self.launch.id, e);
        }
        self.c.control.publish(
            &self.launch.creator,
            ControlEvent::launch_status(
                self.launch.id,
                LaunchState::Failed.as_str(),
                Some(reason),
                Some(error.to_string()),
            ),
        );
        self.c
            .metrics
            .increment_labeled("launches_total", "outcome", reason)
            .await;
        error
    }
}
