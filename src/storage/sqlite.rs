//! SQLite implementation of the [`Store`] contract.
//!
//! Money columns are INTEGER lamports, timestamps are INTEGER unix millis and
//! policy blobs are JSON text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::sync::Arc;
use tracing::{debug, info};

use super::Store;
use crate::types::{
    from_millis, now_naive, to_millis, BotWallet, EnrichedToken, ExitPolicy, LaunchMetadata,
    LaunchState, NewToken, Position, ScoredRecommendation, SniperPolicy, TokenLaunch, Trade, User,
    WalletState,
};

/// SQLite-backed store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

#[derive(FromRow)]
struct UserRow {
    wallet: String,
    encrypted_key: Option<String>,
    role: String,
    premium: bool,
    sniper_policy: String,
    exit_policy: String,
    tip_account: String,
}

#[derive(FromRow)]
struct NewTokenRow {
    mint: String,
    signature: String,
    name: Option<String>,
    symbol: Option<String>,
    uri: Option<String>,
    bonding_curve: Option<String>,
    creator: Option<String>,
    discovered_at: i64,
    status: String,
    retry_count: i64,
    next_attempt_at: i64,
    last_error: Option<String>,
    market_fetched: bool,
    risk_fetched: bool,
}

#[derive(FromRow)]
struct ScoreRow {
    mint: String,
    score: i64,
    confidence: i64,
    recommendation: String,
    reasons: String,
    axes: String,
    profile: String,
}

#[derive(FromRow)]
struct BotWalletRow {
    id: i64,
    owner: String,
    address: String,
    encrypted_key: String,
    state: String,
    prefunded_amount: i64,
    intended_buy: i64,
    balance: i64,
    funding_signature: Option<String>,
    launch_id: Option<i64>,
    reservation: Option<String>,
}

#[derive(FromRow)]
struct LaunchRow {
    id: i64,
    creator: String,
    mint: Option<String>,
    name: String,
    symbol: String,
    description: String,
    image_uri: String,
    metadata_uri: String,
    bot_count: i64,
    per_bot_buy: i64,
    pre_fund_amount: i64,
    creator_buy: i64,
    venue: String,
    sell_strategy_id: String,
    state: String,
    bundle_id: Option<String>,
    landed_slot: Option<i64>,
    failure_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(FromRow)]
struct PositionRow {
    id: i64,
    owner: String,
    owner_kind: String,
    user_wallet: String,
    mint: String,
    launch_id: Option<i64>,
    entry_price: f64,
    entry_quote: i64,
    token_amount: i64,
    remaining_tokens: i64,
    entry_liquidity: f64,
    high_water_price: f64,
    take_profit_taken: bool,
    state: String,
    exit_reason: Option<String>,
    realized_pnl: i64,
    opened_at: i64,
    closed_at: Option<i64>,
}

#[derive(FromRow)]
struct TradeRow {
    id: i64,
    user_wallet: String,
    wallet: String,
    mint: String,
    side: String,
    quote_amount: i64,
    token_amount: i64,
    unit_price: f64,
    fee: i64,
    tx_id: String,
    bundle_id: Option<String>,
    launch_id: Option<i64>,
    slot: Option<i64>,
    position_id: Option<i64>,
    timestamp: i64,
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            wallet TEXT PRIMARY KEY,
            encrypted_key TEXT,
            role TEXT NOT NULL,
            premium BOOLEAN NOT NULL DEFAULT FALSE,
            sniper_policy TEXT NOT NULL,
            exit_policy TEXT NOT NULL,
            tip_account TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        "new_tokens",
        r#"
        CREATE TABLE IF NOT EXISTS new_tokens (
            mint TEXT PRIMARY KEY,
            signature TEXT NOT NULL,
            name TEXT,
            symbol TEXT,
            uri TEXT,
            bonding_curve TEXT,
            creator TEXT,
            discovered_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            market_fetched BOOLEAN NOT NULL DEFAULT FALSE,
            risk_fetched BOOLEAN NOT NULL DEFAULT FALSE
        );
        "#,
    ),
    (
        "idx_new_tokens_due",
        "CREATE INDEX IF NOT EXISTS idx_new_tokens_due ON new_tokens (status, next_attempt_at);",
    ),
    (
        "enriched_tokens",
        r#"
        CREATE TABLE IF NOT EXISTS enriched_tokens (
            mint TEXT PRIMARY KEY,
            liquidity_sol REAL NOT NULL,
            risk_score INTEGER NOT NULL,
            payload TEXT NOT NULL,
            enriched_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        "token_scores",
        r#"
        CREATE TABLE IF NOT EXISTS token_scores (
            mint TEXT PRIMARY KEY,
            score INTEGER NOT NULL,
            confidence INTEGER NOT NULL,
            recommendation TEXT NOT NULL,
            reasons TEXT NOT NULL,
            axes TEXT NOT NULL,
            profile TEXT NOT NULL,
            scored_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        "bot_wallets",
        r#"
        CREATE TABLE IF NOT EXISTS bot_wallets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            address TEXT NOT NULL UNIQUE,
            encrypted_key TEXT NOT NULL,
            state TEXT NOT NULL,
            prefunded_amount INTEGER NOT NULL DEFAULT 0,
            intended_buy INTEGER NOT NULL DEFAULT 0,
            balance INTEGER NOT NULL DEFAULT 0,
            funding_signature TEXT,
            launch_id INTEGER,
            reservation TEXT,
            updated_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        "idx_bot_wallets_owner",
        "CREATE INDEX IF NOT EXISTS idx_bot_wallets_owner ON bot_wallets (owner, state);",
    ),
    (
        "launches",
        r#"
        CREATE TABLE IF NOT EXISTS launches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            creator TEXT NOT NULL,
            mint TEXT,
            name TEXT NOT NULL,
            symbol TEXT NOT NULL,
            description TEXT NOT NULL,
            image_uri TEXT NOT NULL,
            metadata_uri TEXT NOT NULL,
            bot_count INTEGER NOT NULL,
            per_bot_buy INTEGER NOT NULL,
            pre_fund_amount INTEGER NOT NULL,
            creator_buy INTEGER NOT NULL,
            venue TEXT NOT NULL,
            sell_strategy_id TEXT NOT NULL,
            state TEXT NOT NULL,
            bundle_id TEXT,
            landed_slot INTEGER,
            failure_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        "positions",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            owner_kind TEXT NOT NULL,
            user_wallet TEXT NOT NULL,
            mint TEXT NOT NULL,
            launch_id INTEGER,
            entry_price REAL NOT NULL,
            entry_quote INTEGER NOT NULL,
            token_amount INTEGER NOT NULL,
            remaining_tokens INTEGER NOT NULL,
            entry_liquidity REAL NOT NULL,
            high_water_price REAL NOT NULL,
            take_profit_taken BOOLEAN NOT NULL DEFAULT FALSE,
            state TEXT NOT NULL,
            exit_reason TEXT,
            realized_pnl INTEGER NOT NULL DEFAULT 0,
            opened_at INTEGER NOT NULL,
            closed_at INTEGER
        );
        "#,
    ),
    (
        "trades",
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_wallet TEXT NOT NULL,
            wallet TEXT NOT NULL,
            mint TEXT NOT NULL,
            side TEXT NOT NULL,
            quote_amount INTEGER NOT NULL,
            token_amount INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            fee INTEGER NOT NULL DEFAULT 0,
            tx_id TEXT NOT NULL,
            bundle_id TEXT,
            launch_id INTEGER,
            slot INTEGER,
            position_id INTEGER,
            timestamp INTEGER NOT NULL
        );
        "#,
    ),
];

impl SqliteStore {
    /// Connect and create the schema if it does not exist.
    ///
    /// In-memory databases live per connection, so they get a single pinned one.
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new();
        options = if in_memory {
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(5)
        };

        let pool = options
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to SQLite database {}", database_url))?;

        for (name, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .with_context(|| format!("Failed to create {}", name))?;
        }

        info!("SqliteStore initialized and connected to {}", database_url);

        Ok(Arc::new(Self { pool }))
    }

    /// Fresh in-memory store, used by tests and dry runs.
    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        debug!("Upserting user {}", user.wallet);
        sqlx::query(
            r#"
            INSERT INTO users (wallet, encrypted_key, role, premium, sniper_policy, exit_policy, tip_account, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(wallet) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                role = excluded.role,
                premium = excluded.premium,
                sniper_policy = excluded.sniper_policy,
                exit_policy = excluded.exit_policy,
                tip_account = excluded.tip_account;
            "#,
        )
        .bind(&user.wallet)
        .bind(&user.encrypted_key)
        .bind(user.role.as_str())
        .bind(user.premium)
        .bind(serde_json::to_string(&user.sniper_policy)?)
        .bind(serde_json::to_string(&user.exit_policy)?)
        .bind(serde_json::to_string(&user.tip_account)?)
        .bind(to_millis(now_naive()))
        .execute(&self.pool)
        .await
        .context("Failed to upsert user")?;
        Ok(())
    }

    async fn get_user(&self, wallet: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE wallet = ?")
            .bind(wallet)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        row.map(user_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY wallet")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")?;
        rows.into_iter().map(user_from_row).collect()
    }

    async fn update_user_policies(
        &self,
        wallet: &str,
        sniper: &SniperPolicy,
        exit: &ExitPolicy,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET sniper_policy = ?, exit_policy = ? WHERE wallet = ?")
            .bind(serde_json::to_string(sniper)?)
            .bind(serde_json::to_string(exit)?)
            .bind(wallet)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update policies for {}", wallet))?;
        Ok(())
    }

    async fn update_user_key(&self, wallet: &str, encrypted_key: &str) -> Result<()> {
        sqlx::query("UPDATE users SET encrypted_key = ? WHERE wallet = ?")
            .bind(encrypted_key)
            .bind(wallet)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update key blob for {}", wallet))?;
        Ok(())
    }

    async fn insert_new_token(&self, token: &NewToken) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO new_tokens (
                mint, signature, name, symbol, uri, bonding_curve, creator, discovered_at,
                status, retry_count, next_attempt_at, last_error, market_fetched, risk_fetched
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&token.mint)
        .bind(&token.signature)
        .bind(&token.name)
        .bind(&token.symbol)
        .bind(&token.uri)
        .bind(&token.bonding_curve)
        .bind(&token.creator)
        .bind(to_millis(token.discovered_at))
        .bind(token.status.as_str())
        .bind(token.retry_count as i64)
        .bind(to_millis(token.next_attempt_at))
        .bind(&token.last_error)
        .bind(token.market_fetched)
        .bind(token.risk_fetched)
        .execute(&self.pool)
        .await
        .context("Failed to insert new token")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_new_token(&self, mint: &str) -> Result<Option<NewToken>> {
        let row: Option<NewTokenRow> = sqlx::query_as("SELECT * FROM new_tokens WHERE mint = ?")
            .bind(mint)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch new token")?;
        row.map(new_token_from_row).transpose()
    }

    async fn due_tokens(&self, now: NaiveDateTime, limit: usize) -> Result<Vec<NewToken>> {
        let rows: Vec<NewTokenRow> = sqlx::query_as(
            r#"
            SELECT * FROM new_tokens
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY discovered_at ASC
            LIMIT ?;
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch due tokens")?;
        rows.into_iter().map(new_token_from_row).collect()
    }

    async fn update_new_token(&self, token: &NewToken) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE new_tokens SET
                status = ?, retry_count = ?, next_attempt_at = ?, last_error = ?,
                market_fetched = ?, risk_fetched = ?
            WHERE mint = ?;
            "#,
        )
        .bind(token.status.as_str())
        .bind(token.retry_count as i64)
        .bind(to_millis(token.next_attempt_at))
        .bind(&token.last_error)
        .bind(token.market_fetched)
        .bind(token.risk_fetched)
        .bind(&token.mint)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update new token {}", token.mint))?;
        Ok(())
    }

    async fn mark_token_consumed(&self, mint: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE new_tokens SET status = 'consumed' WHERE mint = ? AND status = 'scored'")
                .bind(mint)
                .execute(&self.pool)
                .await
                .context("Failed to mark token consumed")?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_enriched(&self, token: &EnrichedToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO enriched_tokens (mint, liquidity_sol, risk_score, payload, enriched_at)
            VALUES (?, ?, ?, ?, ?);
            "#,
        )
        .bind(&token.mint)
        .bind(token.liquidity_sol)
        .bind(token.risk_score as i64)
        .bind(serde_json::to_string(token)?)
        .bind(to_millis(token.enriched_at))
        .execute(&self.pool)
        .await
        .context("Failed to save enriched token")?;
        Ok(())
    }

    async fn get_enriched(&self, mint: &str) -> Result<Option<EnrichedToken>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM enriched_tokens WHERE mint = ?")
                .bind(mint)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch enriched token")?;
        match row {
            Some((payload,)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn save_score(&self, score: &ScoredRecommendation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO token_scores
                (mint, score, confidence, recommendation, reasons, axes, profile, scored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&score.mint)
        .bind(score.score as i64)
        .bind(score.confidence as i64)
        .bind(score.recommendation.as_str())
        .bind(serde_json::to_string(&score.reasons)?)
        .bind(serde_json::to_string(&score.axes)?)
        .bind(&score.profile)
        .bind(to_millis(now_naive()))
        .execute(&self.pool)
        .await
        .context("Failed to save score")?;
        Ok(())
    }

    async fn get_score(&self, mint: &str) -> Result<Option<ScoredRecommendation>> {
        let row: Option<ScoreRow> = sqlx::query_as("SELECT * FROM token_scores WHERE mint = ?")
            .bind(mint)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch score")?;
        match row {
            Some(row) => Ok(Some(ScoredRecommendation {
                mint: row.mint,
                score: row.score as u8,
                confidence: row.confidence as u8,
                recommendation: row.recommendation.parse()?,
                reasons: serde_json::from_str(&row.reasons)?,
                axes: serde_json::from_str(&row.axes)?,
                profile: row.profile,
            })),
            None => Ok(None),
        }
    }

    async fn insert_bot_wallet(
        &self,
        owner: &str,
        address: &str,
        encrypted_key: &str,
    ) -> Result<BotWallet> {
        let row: BotWalletRow = sqlx::query_as(
            r#"
            INSERT INTO bot_wallets (owner, address, encrypted_key, state, updated_at)
            VALUES (?, ?, ?, 'pending', ?)
            RETURNING *;
            "#,
        )
        .bind(owner)
        .bind(address)
        .bind(encrypted_key)
        .bind(to_millis(now_naive()))
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert bot wallet")?;
        bot_wallet_from_row(row)
    }

    async fn count_reservable_wallets(&self, owner: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM bot_wallets
            WHERE owner = ? AND state IN ('pending', 'ready')
              AND prefunded_amount = 0 AND reservation IS NULL;
            "#,
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count reservable wallets")?;
        Ok(count.0 as usize)
    }

    async fn reserve_bot_wallets(
        &self,
        owner: &str,
        n: usize,
        reservation: &str,
    ) -> Result<Vec<BotWallet>> {
        // Single statement: the subquery selection and the tagging cannot interleave
        // with another reservation.
        let rows: Vec<BotWalletRow> = sqlx::query_as(
            r#"
            UPDATE bot_wallets SET reservation = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM bot_wallets
                WHERE owner = ? AND state IN ('pending', 'ready')
                  AND prefunded_amount = 0 AND reservation IS NULL
                ORDER BY id ASC
                LIMIT ?
            )
            RETURNING *;
            "#,
        )
        .bind(reservation)
        .bind(to_millis(now_naive()))
        .bind(owner)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to reserve bot wallets")?;

        let mut wallets = rows
            .into_iter()
            .map(bot_wallet_from_row)
            .collect::<Result<Vec<_>>>()?;
        wallets.sort_by_key(|w| w.id);
        Ok(wallets)
    }

    async fn update_bot_wallets(&self, wallets: &[BotWallet]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;
        let now = to_millis(now_naive());
        for wallet in wallets {
            sqlx::query(
                r#"
                UPDATE bot_wallets SET
                    state = ?, prefunded_amount = ?, intended_buy = ?, balance = ?,
                    funding_signature = ?, launch_id = ?, reservation = ?, updated_at = ?
                WHERE id = ?;
                "#,
            )
            .bind(wallet.state.as_str())
            .bind(wallet.prefunded_amount as i64)
            .bind(wallet.intended_buy as i64)
            .bind(wallet.balance as i64)
            .bind(&wallet.funding_signature)
            .bind(wallet.launch_id)
            .bind(&wallet.reservation)
            .bind(now)
            .bind(wallet.id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to update bot wallet {}", wallet.id))?;
        }
        tx.commit().await.context("Failed to commit bot wallet update")?;
        Ok(())
    }

    async fn update_bot_wallet_key(&self, id: i64, encrypted_key: &str) -> Result<()> {
        sqlx::query("UPDATE bot_wallets SET encrypted_key = ? WHERE id = ?")
            .bind(encrypted_key)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update key blob for bot wallet {}", id))?;
        Ok(())
    }

    async fn get_bot_wallet(&self, id: i64) -> Result<Option<BotWallet>> {
        let row: Option<BotWalletRow> = sqlx::query_as("SELECT * FROM bot_wallets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch bot wallet")?;
        row.map(bot_wallet_from_row).transpose()
    }

    async fn get_bot_wallet_by_address(&self, address: &str) -> Result<Option<BotWallet>> {
        let row: Option<BotWalletRow> =
            sqlx::query_as("SELECT * FROM bot_wallets WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch bot wallet by address")?;
        row.map(bot_wallet_from_row).transpose()
    }

    async fn wallets_for_reservation(&self, reservation: &str) -> Result<Vec<BotWallet>> {
        self.fetch_wallets("SELECT * FROM bot_wallets WHERE reservation = ? ORDER BY id", reservation)
            .await
    }

    async fn wallets_for_launch(&self, launch_id: i64) -> Result<Vec<BotWallet>> {
        let rows: Vec<BotWalletRow> =
            sqlx::query_as("SELECT * FROM bot_wallets WHERE launch_id = ? ORDER BY id")
                .bind(launch_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch wallets for launch")?;
        rows.into_iter().map(bot_wallet_from_row).collect()
    }

    async fn list_bot_wallets(&self, owner: &str) -> Result<Vec<BotWallet>> {
        self.fetch_wallets("SELECT * FROM bot_wallets WHERE owner = ? ORDER BY id", owner)
            .await
    }

    async fn all_bot_wallets(&self) -> Result<Vec<BotWallet>> {
        let rows: Vec<BotWalletRow> = sqlx::query_as("SELECT * FROM bot_wallets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list bot wallets")?;
        rows.into_iter().map(bot_wallet_from_row).collect()
    }

    async fn insert_launch(&self, launch: &TokenLaunch) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO launches (
                creator, mint, name, symbol, description, image_uri, metadata_uri,
                bot_count, per_bot_buy, pre_fund_amount, creator_buy, venue, sell_strategy_id,
                state, bundle_id, landed_slot, failure_reason, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&launch.creator)
        .bind(&launch.mint)
        .bind(&launch.metadata.name)
        .bind(&launch.metadata.symbol)
        .bind(&launch.metadata.description)
        .bind(&launch.metadata.image_uri)
        .bind(&launch.metadata.metadata_uri)
        .bind(launch.bot_count as i64)
        .bind(launch.per_bot_buy as i64)
        .bind(launch.pre_fund_amount as i64)
        .bind(launch.creator_buy as i64)
        .bind(launch.venue.as_str())
        .bind(&launch.sell_strategy_id)
        .bind(launch.state.as_str())
        .bind(&launch.bundle_id)
        .bind(launch.landed_slot.map(|s| s as i64))
        .bind(&launch.failure_reason)
        .bind(to_millis(launch.created_at))
        .bind(to_millis(launch.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert launch")?;
        Ok(result.last_insert_rowid())
    }

    async fn update_launch(&self, launch: &TokenLaunch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE launches SET
                mint = ?, state = ?, bundle_id = ?, landed_slot = ?, failure_reason = ?,
                pre_fund_amount = ?, updated_at = ?
            WHERE id = ?;
            "#,
        )
        .bind(&launch.mint)
        .bind(launch.state.as_str())
        .bind(&launch.bundle_id)
        .bind(launch.landed_slot.map(|s| s as i64))
        .bind(&launch.failure_reason)
        .bind(launch.pre_fund_amount as i64)
        .bind(to_millis(launch.updated_at))
        .bind(launch.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update launch {}", launch.id))?;
        Ok(())
    }

    async fn get_launch(&self, id: i64) -> Result<Option<TokenLaunch>> {
        let row: Option<LaunchRow> = sqlx::query_as("SELECT * FROM launches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch launch")?;
        row.map(launch_from_row).transpose()
    }

    async fn launches_in_state(&self, state: LaunchState) -> Result<Vec<TokenLaunch>> {
        let rows: Vec<LaunchRow> =
            sqlx::query_as("SELECT * FROM launches WHERE state = ? ORDER BY id")
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch launches by state")?;
        rows.into_iter().map(launch_from_row).collect()
    }

    async fn insert_position(&self, position: &Position) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                owner, owner_kind, user_wallet, mint, launch_id, entry_price, entry_quote,
                token_amount, remaining_tokens, entry_liquidity, high_water_price,
                take_profit_taken, state, exit_reason, realized_pnl, opened_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&position.owner)
        .bind(position.owner_kind.as_str())
        .bind(&position.user)
        .bind(&position.mint)
        .bind(position.launch_id)
        .bind(position.entry_price)
        .bind(position.entry_quote as i64)
        .bind(position.token_amount as i64)
        .bind(position.remaining_tokens as i64)
        .bind(position.entry_liquidity)
        .bind(position.high_water_price)
        .bind(position.take_profit_taken)
        .bind(position.state.as_str())
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.realized_pnl)
        .bind(to_millis(position.opened_at))
        .bind(position.closed_at.map(to_millis))
        .execute(&self.pool)
        .await
        .context("Failed to insert position")?;
        Ok(result.last_insert_rowid())
    }

    async fn update_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                remaining_tokens = ?, high_water_price = ?, take_profit_taken = ?, state = ?,
                exit_reason = ?, realized_pnl = ?, closed_at = ?
            WHERE id = ?;
            "#,
        )
        .bind(position.remaining_tokens as i64)
        .bind(position.high_water_price)
        .bind(position.take_profit_taken)
        .bind(position.state.as_str())
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(position.realized_pnl)
        .bind(position.closed_at.map(to_millis))
        .bind(position.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update position {}", position.id))?;
        Ok(())
    }

    async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let row: Option<PositionRow> = sqlx::query_as("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")?;
        row.map(position_from_row).transpose()
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT * FROM positions WHERE state IN ('open', 'exiting') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active positions")?;
        rows.into_iter().map(position_from_row).collect()
    }

    async fn positions_for_launch(&self, launch_id: i64) -> Result<Vec<Position>> {
        let rows: Vec<PositionRow> =
            sqlx::query_as("SELECT * FROM positions WHERE launch_id = ? ORDER BY id")
                .bind(launch_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch positions for launch")?;
        rows.into_iter().map(position_from_row).collect()
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                user_wallet, wallet, mint, side, quote_amount, token_amount, unit_price, fee,
                tx_id, bundle_id, launch_id, slot, position_id, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&trade.user)
        .bind(&trade.wallet)
        .bind(&trade.mint)
        .bind(trade.side.as_str())
        .bind(trade.quote_amount as i64)
        .bind(trade.token_amount as i64)
        .bind(trade.unit_price)
        .bind(trade.fee as i64)
        .bind(&trade.tx_id)
        .bind(&trade.bundle_id)
        .bind(trade.launch_id)
        .bind(trade.slot.map(|s| s as i64))
        .bind(trade.position_id)
        .bind(to_millis(trade.timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;
        Ok(result.last_insert_rowid())
    }

    async fn trades_for_launch(&self, launch_id: i64) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE launch_id = ? ORDER BY id")
                .bind(launch_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch trades for launch")?;
        rows.into_iter().map(trade_from_row).collect()
    }

    async fn trades_for_position(&self, position_id: i64) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE position_id = ? ORDER BY id")
                .bind(position_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch trades for position")?;
        rows.into_iter().map(trade_from_row).collect()
    }

    async fn trades_for_bundle(&self, bundle_id: &str) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE bundle_id = ? ORDER BY id")
                .bind(bundle_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch trades for bundle")?;
        rows.into_iter().map(trade_from_row).collect()
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

impl SqliteStore {
    async fn fetch_wallets(&self, sql: &str, key: &str) -> Result<Vec<BotWallet>> {
        let rows: Vec<BotWalletRow> = sqlx::query_as(sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch bot wallets")?;
        rows.into_iter().map(bot_wallet_from_row).collect()
    }
}

fn user_from_row(row: UserRow) -> Result<User> {
    Ok(User {
        wallet: row.wallet,
        encrypted_key: row.encrypted_key,
        role: row.role.parse()?,
        premium: row.premium,
        sniper_policy: serde_json::from_str(&row.sniper_policy)?,
        exit_policy: serde_json::from_str(&row.exit_policy)?,
        tip_account: serde_json::from_str(&row.tip_account)?,
    })
}

fn new_token_from_row(row: NewTokenRow) -> Result<NewToken> {
    Ok(NewToken {
        mint: row.mint,
        signature: row.signature,
        name: row.name,
        symbol: row.symbol,
        uri: row.uri,
        bonding_curve: row.bonding_curve,
        creator: row.creator,
        discovered_at: from_millis(row.discovered_at),
        status: row.status.parse()?,
        retry_count: row.retry_count as u32,
        next_attempt_at: from_millis(row.next_attempt_at),
        last_error: row.last_error,
        market_fetched: row.market_fetched,
        risk_fetched: row.risk_fetched,
    })
}

fn bot_wallet_from_row(row: BotWalletRow) -> Result<BotWallet> {
    Ok(BotWallet {
        id: row.id,
        owner: row.owner,
        address: row.address,
        encrypted_key: row.encrypted_key,
        state: row.state.parse::<WalletState>()?,
        prefunded_amount: row.prefunded_amount as u64,
        intended_buy: row.intended_buy as u64,
        balance: row.balance as u64,
        funding_signature: row.funding_signature,
        launch_id: row.launch_id,
        reservation: row.reservation,
    })
}

fn launch_from_row(row: LaunchRow) -> Result<TokenLaunch> {
    Ok(TokenLaunch {
        id: row.id,
        creator: row.creator,
        mint: row.mint,
        metadata: LaunchMetadata {
            name: row.name,
            symbol: row.symbol,
            description: row.description,
            image_uri: row.image_uri,
            metadata_uri: row.metadata_uri,
        },
        bot_count: row.bot_count as u32,
        per_bot_buy: row.per_bot_buy as u64,
        pre_fund_amount: row.pre_fund_amount as u64,
        creator_buy: row.creator_buy as u64,
        venue: row.venue.parse()?,
        sell_strategy_id: row.sell_strategy_id,
        state: row.state.parse()?,
        bundle_id: row.bundle_id,
        landed_slot: row.landed_slot.map(|s| s as u64),
        failure_reason: row.failure_reason,
        created_at: from_millis(row.created_at),
        updated_at: from_millis(row.updated_at),
    })
}

fn position_from_row(row: PositionRow) -> Result<Position> {
    Ok(Position {
        id: row.id,
        owner: row.owner,
        owner_kind: row.owner_kind.parse()?,
        user: row.user_wallet,
        mint: row.mint,
        launch_id: row.launch_id,
        entry_price: row.entry_price,
        entry_quote: row.entry_quote as u64,
        token_amount: row.token_amount as u64,
        remaining_tokens: row.remaining_tokens as u64,
        entry_liquidity: row.entry_liquidity,
        high_water_price: row.high_water_price,
        take_profit_taken: row.take_profit_taken,
        state: row.state.parse()?,
        exit_reason: row.exit_reason.map(|r| r.parse()).transpose()?,
        realized_pnl: row.realized_pnl,
        opened_at: from_millis(row.opened_at),
        closed_at: row.closed_at.map(from_millis),
    })
}

fn trade_from_row(row: TradeRow) -> Result<Trade> {
    Ok(Trade {
        id: row.id,
        user: row.user_wallet,
        wallet: row.wallet,
        mint: row.mint,
        side: row.side.parse()?,
        quote_amount: row.quote_amount as u64,
        token_amount: row.token_amount as u64,
        unit_price: row.unit_price,
        fee: row.fee as u64,
        tx_id: row.tx_id,
        bundle_id: row.bundle_id,
        launch_id: row.launch_id,
        slot: row.slot.map(|s| s as u64),
        position_id: row.position_id,
        timestamp: from_millis(row.timestamp),
    })
}
