//! Storage abstraction layer for the pipeline.
//!
//! This module defines the formal contract for persistence, keeping the
//! coordinator, pool and monitor independent of the database engine.
//! Entities reference each other by ID only; lookups resolve on demand.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::types::{
    BotWallet, EnrichedToken, ExitPolicy, LaunchState, NewToken, Position, ScoredRecommendation,
    SniperPolicy, TokenLaunch, Trade, User,
};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Formal contract for persistent state.
#[async_trait]
pub trait Store: Send + Sync {
    // --- users ---

    /// Insert or replace a user record keyed by wallet.
    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, wallet: &str) -> Result<Option<User>>;

    async fn list_users(&self) -> Result<Vec<User>>;

    async fn update_user_policies(
        &self,
        wallet: &str,
        sniper: &SniperPolicy,
        exit: &ExitPolicy,
    ) -> Result<()>;

    async fn update_user_key(&self, wallet: &str, encrypted_key: &str) -> Result<()>;

    // --- discovery queue ---

    /// Insert a freshly discovered token. Returns `false` if the mint already exists.
    async fn insert_new_token(&self, token: &NewToken) -> Result<bool>;

    async fn get_new_token(&self, mint: &str) -> Result<Option<NewToken>>;

    /// Pending tokens whose `next_attempt_at` has passed, oldest discovery first.
    async fn due_tokens(&self, now: NaiveDateTime, limit: usize) -> Result<Vec<NewToken>>;

    async fn update_new_token(&self, token: &NewToken) -> Result<()>;

    /// Move a `scored` token to `consumed`. Returns `false` if it was not `scored`.
    async fn mark_token_consumed(&self, mint: &str) -> Result<bool>;

    async fn save_enriched(&self, token: &EnrichedToken) -> Result<()>;

    async fn get_enriched(&self, mint: &str) -> Result<Option<EnrichedToken>>;

    async fn save_score(&self, score: &ScoredRecommendation) -> Result<()>;

    async fn get_score(&self, mint: &str) -> Result<Option<ScoredRecommendation>>;

    // --- bot wallets ---

    async fn insert_bot_wallet(&self, owner: &str, address: &str, encrypted_key: &str)
        -> Result<BotWallet>;

    /// Wallets of `owner` eligible for reservation (pending/ready, unfunded, unreserved).
    async fn count_reservable_wallets(&self, owner: &str) -> Result<usize>;

    /// Atomically tag up to `n` reservable wallets with `reservation` and return them.
    async fn reserve_bot_wallets(
        &self,
        owner: &str,
        n: usize,
        reservation: &str,
    ) -> Result<Vec<BotWallet>>;

    /// Persist several wallet rows in one transaction; all or nothing.
    async fn update_bot_wallets(&self, wallets: &[BotWallet]) -> Result<()>;

    async fn update_bot_wallet_key(&self, id: i64, encrypted_key: &str) -> Result<()>;

    async fn get_bot_wallet(&self, id: i64) -> Result<Option<BotWallet>>;

    async fn get_bot_wallet_by_address(&self, address: &str) -> Result<Option<BotWallet>>;

    async fn wallets_for_reservation(&self, reservation: &str) -> Result<Vec<BotWallet>>;

    async fn wallets_for_launch(&self, launch_id: i64) -> Result<Vec<BotWallet>>;

    async fn list_bot_wallets(&self, owner: &str) -> Result<Vec<BotWallet>>;

    async fn all_bot_wallets(&self) -> Result<Vec<BotWallet>>;

    // --- launches ---

    /// Insert a launch and return its ID.
    async fn insert_launch(&self, launch: &TokenLaunch) -> Result<i64>;

    async fn update_launch(&self, launch: &TokenLaunch) -> Result<()>;

    async fn get_launch(&self, id: i64) -> Result<Option<TokenLaunch>>;

    async fn launches_in_state(&self, state: LaunchState) -> Result<Vec<TokenLaunch>>;

    // --- positions and trades ---

    async fn insert_position(&self, position: &Position) -> Result<i64>;

    async fn update_position(&self, position: &Position) -> Result<()>;

    async fn get_position(&self, id: i64) -> Result<Option<Position>>;

    /// Positions in `open` or `exiting` state.
    async fn active_positions(&self) -> Result<Vec<Position>>;

    async fn positions_for_launch(&self, launch_id: i64) -> Result<Vec<Position>>;

    async fn insert_trade(&self, trade: &Trade) -> Result<i64>;

    async fn trades_for_launch(&self, launch_id: i64) -> Result<Vec<Trade>>;

    async fn trades_for_position(&self, position_id: i64) -> Result<Vec<Trade>>;

    async fn trades_for_bundle(&self, bundle_id: &str) -> Result<Vec<Trade>>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}
