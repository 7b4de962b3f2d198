//! Per-user sniper tasks fed from the scored-mint stream.
//!
//! The supervisor owns one task per active sniper and forwards every scored
//! mint to each of them. A task filters against its user's policy, buys at
//! most once per mint and hands the resulting position to the monitor.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::filter::{evaluate, FilterDecision};
use crate::chain::{SwapExecutor, SwapRequest};
use crate::control::{ControlChannel, ControlEvent};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{PipelineMetrics, ACTIVE_SNIPERS, SNIPER_BUYS, SNIPER_FILTERED};
use crate::positions::{open_from_fill, trade_from_fill, Holder, PositionMonitor};
use crate::registry::{ActiveUser, ActiveUserRegistry};
use crate::storage::Store;
use crate::types::{OwnerKind, Position, ScoredMint, TradeSide};

const JOB_QUEUE: usize = 64;

/// A scored mint offered to one user, with that user's current view.
#[derive(Debug, Clone)]
pub struct SnipeJob {
    pub mint: ScoredMint,
    pub user: ActiveUser,
}

/// What a sniper task did with one offered mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnipeOutcome {
    Filtered(Vec<&'static str>),
    AlreadyBought,
    InsufficientBalance,
    Dispatched,
}

struct SniperShared {
    store: Arc<dyn Store>,
    registry: Arc<ActiveUserRegistry>,
    swaps: Arc<dyn SwapExecutor>,
    monitor: Arc<PositionMonitor>,
    control: ControlChannel,
    metrics: PipelineMetrics,
    per_user_concurrency: usize,
}

pub struct SniperSupervisor {
    shared: Arc<SniperShared>,
    users: HashMap<String, mpsc::Sender<SnipeJob>>,
}

impl SniperSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ActiveUserRegistry>,
        swaps: Arc<dyn SwapExecutor>,
        monitor: Arc<PositionMonitor>,
        control: ControlChannel,
        metrics: PipelineMetrics,
        per_user_concurrency: usize,
    ) -> Self {
        Self {
            shared: Arc::new(SniperShared {
                store,
                registry,
                swaps,
                monitor,
                control,
                metrics,
                per_user_concurrency,
            }),
            users: HashMap::new(),
        }
    }

    pub fn sniper_count(&self) -> usize {
        self.users.len()
    }

    /// Consume scored mints until shutdown or the stream closes.
    pub async fn run(mut self, mut scored: broadcast::Receiver<ScoredMint>, mut shutdown: watch::Receiver<bool>) {
        info!("Sniper supervisor started");
        loop {
            tokio::select! {
                received = scored.recv() => match received {
                    Ok(mint) => {
                        if let Err(e) = self.dispatch(mint).await {
                            error!("Sniper dispatch failed: {:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Sniper supervisor lagged, {} scored mints dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        for wallet in self.users.keys() {
            self.shared.registry.remove_task(wallet);
        }
        info!("Sniper supervisor stopped");
    }

    /// Offer one scored mint to every active sniper. Returns how many users got it.
    #[instrument(skip_all, fields(mint = %mint.token.mint))]
    pub async fn dispatch(&mut self, mint: ScoredMint) -> Result<usize> {
        self.prune().await;

        let snipers: Vec<ActiveUser> = self
            .shared
            .registry
            .list_active(0)
            .await?
            .into_iter()
            .filter(|a| a.user.role.can_snipe())
            .collect();

        let mut offered = 0;
        for user in snipers {
            let wallet = user.user.wallet.clone();
            let sender = self
                .users
                .entry(wallet.clone())
                .or_insert_with(|| spawn_sniper(self.shared.clone(), &wallet));
            let job = SnipeJob {
                mint: mint.clone(),
                user,
            };
            match sender.try_send(job) {
                Ok(()) => offered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Sniper queue for {} is full, skipping {}", wallet, mint.token.mint)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.users.remove(&wallet);
                }
            }
        }

        self.shared
            .metrics
            .set_gauge(ACTIVE_SNIPERS, self.users.len() as f64)
            .await;
        Ok(offered)
    }

    /// Stop tasks of users with neither a connection nor a heartbeat.
    async fn prune(&mut self) {
        let mut gone = Vec::new();
        for wallet in self.users.keys() {
            let presence = self.shared.registry.presence(wallet).await;
            if !presence.connected && !presence.heartbeat {
                gone.push(wallet.clone());
            }
        }
        for wallet in gone {
            debug!("Stopping sniper for {}", wallet);
            self.users.remove(&wallet);
            self.shared.registry.remove_task(&wallet);
        }
    }
}

fn spawn_sniper(shared: Arc<SniperShared>, wallet: &str) -> mpsc::Sender<SnipeJob> {
    let (tx, rx) = mpsc::channel(JOB_QUEUE);
    let sniper = UserSniper::new(shared.clone(), wallet);
    let handle = tokio::spawn(sniper.run(rx));
    shared.registry.register_task(wallet, handle.abort_handle());
    info!("Sniper started for {}", wallet);
    tx
}

/// One user's sniper loop.
struct UserSniper {
    shared: Arc<SniperShared>,
    wallet: String,
    permits: Arc<Semaphore>,
    bought: HashSet<String>,
    buys: JoinSet<PipelineResult<Position>>,
}

impl UserSniper {
    fn new(shared: Arc<SniperShared>, wallet: &str) -> Self {
        let permits = Arc::new(Semaphore::new(shared.per_user_concurrency.max(1)));
        Self {
            shared,
            wallet: wallet.to_string(),
            permits,
            bought: HashSet::new(),
            buys: JoinSet::new(),
        }
    }

    async fn run(mut self, mut jobs: mpsc::Receiver<SnipeJob>) {
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => {
                        let outcome = self.offer(job).await;
                        debug!("Sniper {}: {:?}", self.wallet, outcome);
                    }
                    None => break,
                },
                Some(done) = self.buys.join_next(), if !self.buys.is_empty() => self.settle(done),
            }
        }
        while let Some(done) = self.buys.join_next().await {
            self.settle(done);
        }
    }

    fn settle(&mut self, done: Result<PipelineResult<Position>, tokio::task::JoinError>) {
        match done {
            Ok(Ok(position)) => debug!("Sniper {} opened position {}", self.wallet, position.id),
            Ok(Err(e)) => warn!("Sniper {} buy failed: {}", self.wallet, e),
            Err(e) => error!("Sniper {} buy task ended abnormally: {}", self.wallet, e),
        }
    }

    async fn offer(&mut self, job: SnipeJob) -> SnipeOutcome {
        let SnipeJob { mint, user } = job;
        let address = mint.token.mint.clone();
        let policy = &user.user.sniper_policy;

        if let FilterDecision::Reject(reasons) = evaluate(user.user.premium, policy, &mint.token, &mint.scored) {
            self.shared.metrics.increment(SNIPER_FILTERED).await;
            self.shared.control.publish(
                &self.wallet,
                ControlEvent::bot_log(
                    format!("snipe:{}:filtered", address),
                    "info",
                    format!("skipped {}: {}", address, reasons.join(", ")),
                ),
            );
            return SnipeOutcome::Filtered(reasons);
        }
        if self.bought.contains(&address) {
            return SnipeOutcome::AlreadyBought;
        }
        if user.balance < policy.buy_amount {
            self.shared.control.publish(
                &self.wallet,
                ControlEvent::bot_log(
                    format!("snipe:{}:balance", address),
                    "warn",
                    format!(
                        "skipped {}: balance {} below buy amount {}",
                        address, user.balance, policy.buy_amount
                    ),
                ),
            );
            return SnipeOutcome::InsufficientBalance;
        }

        self.bought.insert(address);
        let shared = self.shared.clone();
        let permits = self.permits.clone();
        self.buys.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Internal(e.into()))?;
            buy(&shared, &user, &mint).await
        });
        SnipeOutcome::Dispatched
    }
}

/// Buy, book and start monitoring one position.
#[instrument(skip_all, fields(wallet = %user.user.wallet, mint = %mint.token.mint))]
async fn buy(shared: &SniperShared, user: &ActiveUser, mint: &ScoredMint) -> PipelineResult<Position> {
    let policy = &user.user.sniper_policy;
    let token = &mint.token;
    let request = SwapRequest {
        mint: token.mint.clone(),
        side: TradeSide::Buy,
        amount: policy.buy_amount,
        slippage_bps: policy.slippage_bps,
        venue: token.venue,
    };
    let fill = shared.swaps.swap(&user.signing_key, &request).await?;

    let holder = Holder {
        owner: user.user.wallet.clone(),
        owner_kind: OwnerKind::User,
        user: user.user.wallet.clone(),
    };
    let mut position = open_from_fill(&holder, &token.mint, None, &fill, token.liquidity_sol);
    position.id = shared.store.insert_position(&position).await?;

    let mut trade = trade_from_fill(&holder, &token.mint, TradeSide::Buy, &fill, None, None, Some(position.id));
    trade.id = shared.store.insert_trade(&trade).await?;
    if !shared.store.mark_token_consumed(&token.mint).await? {
        debug!("{} was already consumed", token.mint);
    }

    shared.metrics.increment(SNIPER_BUYS).await;
    shared.control.publish(&user.user.wallet, ControlEvent::trade(&trade));
    shared.control.publish(
        &user.user.wallet,
        ControlEvent::position_status(
            position.id,
            position.state.as_str(),
            None,
            Some(format!("bought {} at {:.10}", token.mint, fill.unit_price)),
        ),
    );
    info!(
        "Sniped {} for {} lamports ({} tokens)",
        token.mint, fill.quote_amount, fill.token_amount
    );

    let interval = shared.monitor.scan_interval(Some(&user.user));
    shared
        .monitor
        .track(position.clone(), user.user.exit_policy.clone(), interval)?;
    Ok(position)
}
