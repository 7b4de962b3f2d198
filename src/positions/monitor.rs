//! One cooperative task per open position.
//!
//! The owning task is the only writer of its position, so exit evaluation is
//! totally ordered and at most one sell is ever in flight per position.

use anyhow::{anyhow, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, error, info, instrument, warn};

use super::exit::{evaluate_exit, ExitAction, Observation};
use super::{apply_sell, trade_from_fill, Holder};
use crate::chain::{SwapExecutor, SwapRequest};
use crate::config::MonitorConfig;
use crate::control::ControlChannel;
use crate::control::ControlEvent;
use crate::enrichment::PriceSource;
use crate::error::{PipelineError, PipelineResult};
use crate::keys::SignerDirectory;
use crate::metrics::{PipelineMetrics, OPEN_POSITIONS};
use crate::storage::Store;
use crate::types::{
    now_naive, ExitPolicy, ExitReason, LaunchState, Position, PositionState, TradeSide, User, Venue,
};

pub struct PositionMonitor {
    store: Arc<dyn Store>,
    prices: Arc<dyn PriceSource>,
    swaps: Arc<dyn SwapExecutor>,
    signers: SignerDirectory,
    control: ControlChannel,
    metrics: PipelineMetrics,
    config: MonitorConfig,
    owned: DashMap<i64, ()>,
    shutdown: watch::Receiver<bool>,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        prices: Arc<dyn PriceSource>,
        swaps: Arc<dyn SwapExecutor>,
        signers: SignerDirectory,
        control: ControlChannel,
        metrics: PipelineMetrics,
        config: MonitorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            prices,
            swaps,
            signers,
            control,
            metrics,
            config,
            owned: DashMap::new(),
            shutdown,
        })
    }

    pub fn is_tracking(&self, position_id: i64) -> bool {
        self.owned.contains_key(&position_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.owned.len()
    }

    /// Poll cadence for positions of `user`.
    pub fn scan_interval(&self, user: Option<&User>) -> Duration {
        let ms = user
            .map(|u| u.sniper_policy.scan_interval_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(self.config.default_scan_interval_ms);
        Duration::from_millis(ms.max(1))
    }

    /// Take ownership of `position` and start its task.
    pub fn track(self: &Arc<Self>, position: Position, policy: ExitPolicy, interval: Duration) -> PipelineResult<()> {
        if !matches!(position.state, PositionState::Open | PositionState::Exiting) {
            return Err(PipelineError::validation(format!(
                "position {} is {} and cannot be monitored",
                position.id, position.state
            )));
        }
        match self.owned.entry(position.id) {
            Entry::Occupied(_) => {
                return Err(PipelineError::validation(format!(
                    "position {} already has a monitor",
                    position.id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            let id = position.id;
            monitor.metrics.adjust_gauge(OPEN_POSITIONS, 1.0).await;
            monitor.run(position, policy, interval).await;
            monitor.owned.remove(&id);
            monitor.metrics.adjust_gauge(OPEN_POSITIONS, -1.0).await;
        });
        Ok(())
    }

    #[instrument(skip_all, fields(position = position.id, mint = %position.mint))]
    async fn run(&self, mut position: Position, policy: ExitPolicy, interval: Duration) {
        let mut shutdown = self.shutdown.clone();
        debug!("Monitoring every {:?}", interval);
        loop {
            let stopping = if *shutdown.borrow() {
                true
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => false,
                    changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                }
            };

            match self.tick(&mut position, &policy).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("Position {} check failed: {:#}", position.id, e),
            }

            if stopping {
                info!("Shutdown: position {} left open after final check", position.id);
                return;
            }
        }
    }

    async fn observe(&self, mint: &str) -> Result<Observation> {
        let deadline = Duration::from_millis(self.config.quote_timeout_ms);
        let quote = tokio::time::timeout(deadline, self.prices.quote(mint))
            .await
            .map_err(|_| anyhow!("quote for {} timed out", mint))??;
        Ok(Observation {
            price: quote.price,
            liquidity: quote.liquidity_sol,
            at: now_naive(),
        })
    }

    /// One observation and decision. Returns `true` once the position needs no more monitoring.
    async fn tick(&self, position: &mut Position, policy: &ExitPolicy) -> Result<bool> {
        let observation = self.observe(&position.mint).await?;
        if observation.price > position.high_water_price {
            position.high_water_price = observation.price;
            self.store.update_position(position).await?;
        }

        match evaluate_exit(position, policy, &observation) {
            ExitAction::Hold => Ok(false),
            ExitAction::Sell { reason, fraction } => {
                info!(
                    "Position {} exit: {} ({:.0}%) at {:.10}",
                    position.id,
                    reason,
                    fraction * 100.0,
                    observation.price
                );
                self.exit(position, policy, reason, fraction).await
            }
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // Doubling from the base delay.
        ExponentialBackoff::from_millis(2)
            .factor((self.config.exit_backoff_base_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.config.exit_backoff_cap_ms))
            .take(self.config.exit_max_retries)
    }

    async fn exit(
        &self,
        position: &mut Position,
        policy: &ExitPolicy,
        reason: ExitReason,
        fraction: f64,
    ) -> Result<bool> {
        position.state = PositionState::Exiting;
        self.store.update_position(position).await?;

        let amount = if fraction >= 1.0 {
            position.remaining_tokens
        } else {
            ((position.remaining_tokens as f64 * fraction).floor() as u64).max(1)
        };
        let request = SwapRequest {
            mint: position.mint.clone(),
            side: TradeSide::Sell,
            amount,
            slippage_bps: policy.sell_slippage_bps,
            venue: Venue::Unknown,
        };

        let signer = match self.signers.resolve(position.owner_kind, &position.owner).await {
            Ok(signer) => signer,
            Err(e) => {
                error!("No signer for position {}: {:#}", position.id, e);
                self.escalate(position, reason, 0).await?;
                return Ok(true);
            }
        };

        let position_id = position.id;
        let fill = Retry::spawn(self.retry_strategy(), || async {
            self.swaps.swap(&signer, &request).await.map_err(|e| {
                warn!("Sell attempt for position {} failed: {:#}", position_id, e);
                e
            })
        })
        .await;
        let fill = match fill {
            Ok(fill) => fill,
            Err(_) => {
                self.escalate(position, reason, self.config.exit_max_retries + 1).await?;
                return Ok(true);
            }
        };

        let pnl = apply_sell(position, &fill);
        let closed = fraction >= 1.0 || position.remaining_tokens == 0;
        if closed {
            position.state = PositionState::Closed;
            position.exit_reason = Some(reason);
            position.closed_at = Some(now_naive());
        } else {
            position.state = PositionState::Open;
            position.take_profit_taken = true;
        }
        self.store.update_position(position).await?;

        let holder = Holder {
            owner: position.owner.clone(),
            owner_kind: position.owner_kind,
            user: position.user.clone(),
        };
        let mut trade = trade_from_fill(
            &holder,
            &position.mint,
            TradeSide::Sell,
            &fill,
            None,
            position.launch_id,
            Some(position.id),
        );
        trade.id = self.store.insert_trade(&trade).await?;
        self.control.publish(&position.user, ControlEvent::trade(&trade));
        self.metrics
            .increment_labeled("exits_total", "reason", reason.as_str())
            .await;

        let state = if closed { "closed" } else { "partial_exit" };
        self.control.publish(
            &position.user,
            ControlEvent::position_status(
                position.id,
                state,
                Some(reason.as_str()),
                Some(format!("realized {} lamports", pnl)),
            ),
        );

        if closed {
            if let Some(launch_id) = position.launch_id {
                self.finish_launch_if_done(launch_id).await?;
            }
        }
        Ok(closed)
    }

    /// Give up on automatic exit; the user has to act.
    async fn escalate(&self, position: &mut Position, reason: ExitReason, attempts: usize) -> Result<()> {
        let failure = PipelineError::ExitFailedManual {
            position_id: position.id,
            attempts,
        };
        error!("{}", failure);
        position.state = PositionState::Manual;
        position.exit_reason = Some(reason);
        self.store.update_position(position).await?;
        self.metrics
            .increment_labeled("exits_total", "reason", failure.reason_code())
            .await;
        self.control.publish(
            &position.user,
            ControlEvent::position_status(
                position.id,
                PositionState::Manual.as_str(),
                Some(failure.reason_code()),
                Some(failure.to_string()),
            ),
        );
        Ok(())
    }

    async fn finish_launch_if_done(&self, launch_id: i64) -> Result<()> {
        let positions = self.store.positions_for_launch(launch_id).await?;
        if positions.iter().any(|p| p.state != PositionState::Closed) {
            return Ok(());
        }
        let Some(mut launch) = self.store.get_launch(launch_id).await? else {
            return Ok(());
        };
        if launch.state != LaunchState::Landed {
            return Ok(());
        }
        launch.state = LaunchState::Exited;
        launch.updated_at = now_naive();
        self.store.update_launch(&launch).await?;
        info!("Launch {} exited: all positions closed", launch_id);
        self.control.publish(
            &launch.creator,
            ControlEvent::launch_status(launch_id, LaunchState::Exited.as_str(), None, None),
        );
        Ok(())
    }

    /// Restart monitors for every persisted open or exiting position.
    ///
    /// Launch positions use their launch's sell strategy; everything else the
    /// owner's exit policy.
    pub async fn resume_open_positions(
        self: &Arc<Self>,
        sell_strategies: &HashMap<String, ExitPolicy>,
    ) -> Result<usize> {
        let mut resumed = 0;
        for mut position in self.store.active_positions().await? {
            if self.is_tracking(position.id) {
                continue;
            }
            let user = self.store.get_user(&position.user).await?;
            let mut policy = user.as_ref().map(|u| u.exit_policy.clone()).unwrap_or_default();
            if let Some(launch_id) = position.launch_id {
                if let Some(launch) = self.store.get_launch(launch_id).await? {
                    if let Some(strategy) = sell_strategies.get(&launch.sell_strategy_id) {
                        policy = strategy.clone();
                    }
                }
            }
            if position.state == PositionState::Exiting {
                warn!("Position {} was exiting at shutdown; re-evaluating", position.id);
                position.state = PositionState::Open;
                self.store.update_position(&position).await?;
            }
            let interval = self.scan_interval(user.as_ref());
            self.track(position, policy, interval)?;
            resumed += 1;
        }
        info!("Resumed {} position monitors", resumed);
        Ok(resumed)
    }

    /// Wait until every monitor task has ended, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.owned.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("{} monitors still running at drain deadline", self.owned.len());
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}
