//! Per-user push channel for status, trade and bot-log events.
//!
//! Events are idempotent by `(type, id)`: publishing the same pair twice is a
//! no-op, and a reconnecting client gets the retained log replayed without
//! duplicates. Connection lifecycle belongs to the HTTP layer, which calls
//! [`ControlChannel::attach`] and [`ControlChannel::detach`].

use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace};

use crate::config::ControlConfig;
use crate::types::{now_naive, ExitPolicy, Lamports, SniperPolicy, Trade, TradeSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub launch_id: Option<i64>,
    pub position_id: Option<i64>,
    pub state: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLog {
    pub id: String,
    pub wallet: String,
    pub mint: String,
    pub side: TradeSide,
    pub quote_amount: Lamports,
    pub token_amount: u64,
    pub unit_price: f64,
    pub tx_id: String,
    pub position_id: Option<i64>,
    pub launch_id: Option<i64>,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotLog {
    pub id: String,
    pub level: String,
    pub message: String,
    pub timestamp: NaiveDateTime,
}

/// Server-to-client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    StatusUpdate(StatusUpdate),
    TradeLog(TradeLog),
    BotLog(BotLog),
    Ping { id: String },
    Pong { id: String },
}

impl ControlEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::StatusUpdate(_) => "status_update",
            ControlEvent::TradeLog(_) => "trade_log",
            ControlEvent::BotLog(_) => "bot_log",
            ControlEvent::Ping { .. } => "ping",
            ControlEvent::Pong { .. } => "pong",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ControlEvent::StatusUpdate(e) => &e.id,
            ControlEvent::TradeLog(e) => &e.id,
            ControlEvent::BotLog(e) => &e.id,
            ControlEvent::Ping { id } | ControlEvent::Pong { id } => id,
        }
    }

    /// Launch progress: `launch:{id}:{state}`.
    pub fn launch_status(launch_id: i64, state: &str, reason: Option<&str>, message: Option<String>) -> Self {
        ControlEvent::StatusUpdate(StatusUpdate {
            id: format!("launch:{}:{}", launch_id, state),
            launch_id: Some(launch_id),
            position_id: None,
            state: state.to_string(),
            reason: reason.map(str::to_string),
            message,
            timestamp: now_naive(),
        })
    }

    /// Position lifecycle: `position:{id}:{state}`.
    pub fn position_status(position_id: i64, state: &str, reason: Option<&str>, message: Option<String>) -> Self {
        ControlEvent::StatusUpdate(StatusUpdate {
            id: format!("position:{}:{}", position_id, state),
            launch_id: None,
            position_id: Some(position_id),
            state: state.to_string(),
            reason: reason.map(str::to_string),
            message,
            timestamp: now_naive(),
        })
    }

    /// Ledger entry: `trade:{tx_id}`.
    pub fn trade(trade: &Trade) -> Self {
        ControlEvent::TradeLog(TradeLog {
            id: format!("trade:{}", trade.tx_id),
            wallet: trade.wallet.clone(),
            mint: trade.mint.clone(),
            side: trade.side,
            quote_amount: trade.quote_amount,
            token_amount: trade.token_amount,
            unit_price: trade.unit_price,
            tx_id: trade.tx_id.clone(),
            position_id: trade.position_id,
            launch_id: trade.launch_id,
            timestamp: trade.timestamp,
        })
    }

    pub fn bot_log(id: impl Into<String>, level: &str, message: impl Into<String>) -> Self {
        ControlEvent::BotLog(BotLog {
            id: id.into(),
            level: level.to_string(),
            message: message.into(),
            timestamp: now_naive(),
        })
    }
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping { id: String },
    UpdateConfig {
        sniper_policy: Option<SniperPolicy>,
        exit_policy: Option<ExitPolicy>,
    },
}

type EventKey = (&'static str, String);

struct UserChannel {
    sender: broadcast::Sender<ControlEvent>,
    log: VecDeque<ControlEvent>,
    /// Outlives the replay log so an evicted id is still a duplicate.
    seen: HashSet<EventKey>,
    seen_order: VecDeque<EventKey>,
    connections: usize,
    last_activity: Instant,
}

impl UserChannel {
    fn is_idle(&self, retention: Duration) -> bool {
        self.connections == 0 && (self.log.is_empty() || self.last_activity.elapsed() >= retention)
    }
}

/// Live subscription handed to a connection.
pub struct Subscription {
    /// Retained events, oldest first.
    pub replay: Vec<ControlEvent>,
    pub receiver: broadcast::Receiver<ControlEvent>,
}

#[derive(Clone)]
pub struct ControlChannel {
    users: Arc<DashMap<String, UserChannel>>,
    replay_capacity: usize,
    channel_capacity: usize,
    dedupe_capacity: usize,
}

impl ControlChannel {
    pub fn new(replay_capacity: usize, channel_capacity: usize) -> Self {
        Self::from_config(&ControlConfig {
            replay_capacity,
            channel_capacity,
            ..ControlConfig::default()
        })
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        let replay_capacity = config.replay_capacity.max(1);
        Self {
            users: Arc::new(DashMap::new()),
            replay_capacity,
            channel_capacity: config.channel_capacity.max(1),
            dedupe_capacity: config.dedupe_capacity.max(replay_capacity),
        }
    }

    fn new_user_channel(&self) -> UserChannel {
        let (sender, _) = broadcast::channel(self.channel_capacity);
        UserChannel {
            sender,
            log: VecDeque::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            connections: 0,
            last_activity: Instant::now(),
        }
    }

    /// Publish an event to `user`. Returns `false` if `(type, id)` was already delivered.
    pub fn publish(&self, user: &str, event: ControlEvent) -> bool {
        let mut channel = self
            .users
            .entry(user.to_string())
            .or_insert_with(|| self.new_user_channel());

        let key = (event.kind(), event.id().to_string());
        if channel.seen.contains(&key) {
            trace!("Dropping duplicate {} {} for {}", key.0, key.1, user);
            return false;
        }

        channel.seen.insert(key.clone());
        channel.seen_order.push_back(key);
        while channel.seen_order.len() > self.dedupe_capacity {
            if let Some(forgotten) = channel.seen_order.pop_front() {
                channel.seen.remove(&forgotten);
            }
        }
        channel.log.push_back(event.clone());
        while channel.log.len() > self.replay_capacity {
            channel.log.pop_front();
        }
        channel.last_activity = Instant::now();

        // No receivers is fine: the event stays in the replay log.
        let _ = channel.sender.send(event);
        true
    }

    /// Attach a connection: replay retained events, then receive live ones.
    pub fn attach(&self, user: &str) -> Subscription {
        let mut channel = self
            .users
            .entry(user.to_string())
            .or_insert_with(|| self.new_user_channel());
        channel.connections += 1;
        debug!("Control channel attached for {} ({} connections)", user, channel.connections);
        Subscription {
            replay: channel.log.iter().cloned().collect(),
            receiver: channel.sender.subscribe(),
        }
    }

    pub fn detach(&self, user: &str) {
        if let Some(mut channel) = self.users.get_mut(user) {
            channel.connections = channel.connections.saturating_sub(1);
            channel.last_activity = Instant::now();
            debug!("Control channel detached for {} ({} left)", user, channel.connections);
        }
        self.users.remove_if(user, |_, channel| channel.connections == 0 && channel.log.is_empty());
    }

    /// Drop channels with no connections whose log is empty or older than `retention`.
    pub fn prune_idle(&self, retention: Duration) -> usize {
        let before = self.users.len();
        self.users.retain(|_, channel| !channel.is_idle(retention));
        before.saturating_sub(self.users.len())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Periodic idle-channel pruning until shutdown.
    pub async fn run_pruner(self, retention: Duration, mut shutdown: watch::Receiver<bool>) {
        let period = (retention / 4).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    let pruned = self.prune_idle(retention);
                    if pruned > 0 {
                        debug!("Pruned {} idle control channels", pruned);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Control channel pruner shutting down");
                    return;
                }
            }
        }
    }

    pub fn is_connected(&self, user: &str) -> bool {
        self.users
            .get(user)
            .map(|c| c.connections > 0)
            .unwrap_or(false)
    }

    /// Retained events for `user`, oldest first.
    pub fn history(&self, user: &str) -> Vec<ControlEvent> {
        self.users
            .get(user)
            .map(|c| c.log.iter().cloned().collect())
            .unwrap_or_default()
    }
}
