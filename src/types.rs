//! Core types and data structures for the launch & snipe pipeline.
//!
//! Entities reference each other by ID or address only; nothing here holds a
//! pointer to another entity. Monetary amounts are integer lamports.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Base-58 account address.
pub type Pubkey = String;

/// Amount of the quote asset in base units.
pub type Lamports = u64;

pub const LAMPORTS_PER_SOL: Lamports = 1_000_000_000;

/// Convert a SOL figure into lamports, rounding to the nearest unit.
pub fn sol_to_lamports(sol: f64) -> Lamports {
    if sol <= 0.0 {
        return 0;
    }
    (sol * LAMPORTS_PER_SOL as f64).round() as Lamports
}

pub fn lamports_to_sol(lamports: Lamports) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Current wall-clock time as naive UTC, the representation persisted everywhere.
pub fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn to_millis(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

/// `None` when `ms` is outside chrono's representable range.
pub fn try_from_millis(ms: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// For values this service wrote itself; out-of-range input clamps to the epoch.
pub fn from_millis(ms: i64) -> NaiveDateTime {
    try_from_millis(ms).unwrap_or_default()
}

/// Generates the `as_str` / `FromStr` / `Display` trio for snake_case enums
/// that are persisted as TEXT columns.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow::anyhow!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// --- Users and policies ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sniper,
    Creator,
    Both,
}

string_enum!(Role { Sniper => "sniper", Creator => "creator", Both => "both" });

impl Role {
    pub fn can_snipe(&self) -> bool {
        matches!(self, Role::Sniper | Role::Both)
    }

    pub fn can_launch(&self) -> bool {
        matches!(self, Role::Creator | Role::Both)
    }
}

/// Cached state of the user's block-builder tip account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TipAccountState {
    pub address: Option<Pubkey>,
    pub initialized: bool,
    pub reserved_balance: Lamports,
    pub per_tx_tip: Lamports,
}

/// Boolean and numeric safety gates applied by the sniper policy filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyFilters {
    pub require_socials: bool,
    pub require_liquidity_burnt: bool,
    pub require_immutable_metadata: bool,
    pub require_mint_revoked: bool,
    pub require_freeze_revoked: bool,
    /// Minimum pool liquidity in quote units (SOL).
    pub min_pool_size_sol: Option<f64>,
    pub min_age_secs: Option<u64>,
    pub max_top_holders_pct: Option<f64>,
    pub max_risk_score: Option<u8>,
    /// Premium only.
    pub max_webacy_risk: Option<f64>,
    /// Premium only.
    pub min_moon_potential: Option<u8>,
    pub min_score: Option<u8>,
    pub allowed_venues: Vec<Venue>,
}

impl Default for SafetyFilters {
    fn default() -> Self {
        Self {
            require_socials: false,
            require_liquidity_burnt: false,
            require_immutable_metadata: false,
            require_mint_revoked: true,
            require_freeze_revoked: true,
            min_pool_size_sol: None,
            min_age_secs: None,
            max_top_holders_pct: None,
            max_risk_score: None,
            max_webacy_risk: None,
            min_moon_potential: None,
            min_score: None,
            allowed_venues: Vec::new(),
        }
    }
}

impl SafetyFilters {
    /// Names of premium-only filters that are set.
    pub fn premium_fields_in_use(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.max_webacy_risk.is_some() {
            fields.push("max_webacy_risk");
        }
        if self.min_moon_potential.is_some() {
            fields.push("min_moon_potential");
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniperPolicy {
    pub buy_amount: Lamports,
    pub slippage_bps: u16,
    pub filters: SafetyFilters,
    pub scan_interval_ms: u64,
}

impl Default for SniperPolicy {
    fn default() -> Self {
        Self {
            buy_amount: 50_000_000,
            slippage_bps: 1_500,
            filters: SafetyFilters::default(),
            scan_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitPolicy {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: Option<f64>,
    pub timeout_secs: u64,
    pub rug_liquidity_drop_pct: f64,
    pub sell_slippage_bps: u16,
    /// When set, a take-profit sells only this share and arms a breakeven stop.
    pub partial_sell_pct: Option<f64>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            take_profit_pct: 50.0,
            stop_loss_pct: 20.0,
            trailing_stop_pct: None,
            timeout_secs: 3_600,
            rug_liquidity_drop_pct: 20.0,
            sell_slippage_bps: 2_500,
            partial_sell_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub wallet: Pubkey,
    /// Envelope-encrypted signing key; never logged or sent to clients.
    #[serde(skip_serializing)]
    pub encrypted_key: Option<String>,
    pub role: Role,
    pub premium: bool,
    pub sniper_policy: SniperPolicy,
    pub exit_policy: ExitPolicy,
    pub tip_account: TipAccountState,
}

impl User {
    pub fn new(wallet: impl Into<Pubkey>, role: Role) -> Self {
        Self {
            wallet: wallet.into(),
            encrypted_key: None,
            role,
            premium: false,
            sniper_policy: SniperPolicy::default(),
            exit_policy: ExitPolicy::default(),
            tip_account: TipAccountState::default(),
        }
    }
}

// --- Token discovery and enrichment ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    PumpFun,
    PumpSwap,
    Raydium,
    Meteora,
    Orca,
    Unknown,
}

string_enum!(Venue {
    PumpFun => "pump_fun",
    PumpSwap => "pump_swap",
    Raydium => "raydium",
    Meteora => "meteora",
    Orca => "orca",
    Unknown => "unknown",
});

impl Venue {
    /// Map a DEX identifier as reported by market-data providers.
    pub fn from_dex_id(dex_id: &str) -> Self {
        match dex_id.to_ascii_lowercase().as_str() {
            "pumpfun" | "pump_fun" | "pump.fun" => Venue::PumpFun,
            "pumpswap" | "pump_swap" => Venue::PumpSwap,
            "raydium" => Venue::Raydium,
            "meteora" => Venue::Meteora,
            "orca" => Venue::Orca,
            _ => Venue::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Enriched,
    Scored,
    Rejected,
    Consumed,
}

string_enum!(TokenStatus {
    Pending => "pending",
    Enriched => "enriched",
    Scored => "scored",
    Rejected => "rejected",
    Consumed => "consumed",
});

impl TokenStatus {
    /// Declared transition graph: forward only, plus pending→rejected.
    pub fn can_transition_to(&self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        matches!(
            (self, next),
            (Pending, Enriched)
                | (Pending, Rejected)
                | (Enriched, Scored)
                | (Scored, Consumed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenStatus::Rejected | TokenStatus::Consumed)
    }
}

/// Queue row for a freshly discovered mint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewToken {
    pub mint: Pubkey,
    pub signature: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub uri: Option<String>,
    pub bonding_curve: Option<Pubkey>,
    pub creator: Option<Pubkey>,
    pub discovered_at: NaiveDateTime,
    pub status: TokenStatus,
    pub retry_count: u32,
    pub next_attempt_at: NaiveDateTime,
    pub last_error: Option<String>,
    pub market_fetched: bool,
    pub risk_fetched: bool,
}

impl NewToken {
    /// Move to `next`, refusing transitions outside the declared graph.
    pub fn advance(&mut self, next: TokenStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "illegal status transition {} -> {} for {}",
                self.status,
                next,
                self.mint
            );
        }
        self.status = next;
        Ok(())
    }
}

/// Snapshot of everything the scoring engine looks at for one mint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedToken {
    pub mint: Pubkey,
    pub price: f64,
    pub market_cap: f64,
    pub liquidity_sol: f64,
    pub volume_24h: f64,
    pub volume_6h: f64,
    pub volume_1h: f64,
    pub volume_5m: f64,
    pub price_change_5m: f64,
    pub price_change_1h: f64,
    pub price_change_6h: f64,
    pub price_change_24h: f64,
    pub pair_age_secs: u64,
    pub venue: Venue,
    pub socials_present: bool,
    pub top10_holder_pct: f64,
    pub mint_authority_present: bool,
    pub freeze_authority_present: bool,
    pub honeypot: bool,
    pub liquidity_burnt: bool,
    pub immutable_metadata: bool,
    pub webacy_risk: Option<f64>,
    pub risk_score: u8,
    pub moon_potential: u8,
    pub confidence: f64,
    pub enriched_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Skip,
    Buy,
    StrongBuy,
    MoonbagBuy,
}

string_enum!(Recommendation {
    Skip => "SKIP",
    Buy => "BUY",
    StrongBuy => "STRONG_BUY",
    MoonbagBuy => "MOONBAG_BUY",
});

/// Reason codes emitted by the scoring engine for every threshold crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    LowLiquidity,
    DeepLiquidity,
    NoSocials,
    SocialsPresent,
    HighConcentration,
    HealthyDistribution,
    MintAuthorityPresent,
    FreezeAuthorityPresent,
    Honeypot,
    HighRisk,
    LowRisk,
    StrongMomentum,
    NegativeMomentum,
    HighVolume,
    HighMoonPotential,
    TooYoung,
    LowConfidence,
}

string_enum!(ReasonCode {
    LowLiquidity => "low_liquidity",
    DeepLiquidity => "deep_liquidity",
    NoSocials => "no_socials",
    SocialsPresent => "socials_present",
    HighConcentration => "high_concentration",
    HealthyDistribution => "healthy_distribution",
    MintAuthorityPresent => "mint_authority_present",
    FreezeAuthorityPresent => "freeze_authority_present",
    Honeypot => "honeypot",
    HighRisk => "high_risk",
    LowRisk => "low_risk",
    StrongMomentum => "strong_momentum",
    NegativeMomentum => "negative_momentum",
    HighVolume => "high_volume",
    HighMoonPotential => "high_moon_potential",
    TooYoung => "too_young",
    LowConfidence => "low_confidence",
});

/// Per-axis sub-scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisScores {
    pub liquidity: f64,
    pub social: f64,
    pub technical: f64,
    pub holder_distribution: f64,
    pub risk: f64,
    pub moon_potential: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecommendation {
    pub mint: Pubkey,
    pub score: u8,
    pub confidence: u8,
    pub recommendation: Recommendation,
    pub reasons: Vec<ReasonCode>,
    pub axes: AxisScores,
    /// `name@version` of the profile that produced this score.
    pub profile: String,
}

/// A scored mint as broadcast to sniper executors.
#[derive(Debug, Clone)]
pub struct ScoredMint {
    pub token: EnrichedToken,
    pub scored: ScoredRecommendation,
}

// --- Bot wallets and launches ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletState {
    Pending,
    Ready,
    Funded,
    Consumed,
    Failed,
}

string_enum!(WalletState {
    Pending => "pending",
    Ready => "ready",
    Funded => "funded",
    Consumed => "consumed",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotWallet {
    pub id: i64,
    pub owner: Pubkey,
    pub address: Pubkey,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub state: WalletState,
    pub prefunded_amount: Lamports,
    pub intended_buy: Lamports,
    pub balance: Lamports,
    pub funding_signature: Option<String>,
    pub launch_id: Option<i64>,
    pub reservation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Draft,
    Queued,
    Submitting,
    Landed,
    Failed,
    Exited,
}

string_enum!(LaunchState {
    Draft => "draft",
    Queued => "queued",
    Submitting => "submitting",
    Landed => "landed",
    Failed => "failed",
    Exited => "exited",
});

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaunchState::Failed | LaunchState::Exited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchMetadata {
    pub name: String,
    pub symbol: String,
    pub description: String,
    pub image_uri: String,
    pub metadata_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLaunch {
    pub id: i64,
    pub creator: Pubkey,
    pub mint: Option<Pubkey>,
    pub metadata: LaunchMetadata,
    pub bot_count: u32,
    pub per_bot_buy: Lamports,
    pub pre_fund_amount: Lamports,
    pub creator_buy: Lamports,
    pub venue: Venue,
    pub sell_strategy_id: String,
    pub state: LaunchState,
    pub bundle_id: Option<String>,
    pub landed_slot: Option<u64>,
    pub failure_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

// --- Positions and trades ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    User,
    BotWallet,
}

string_enum!(OwnerKind { User => "user", BotWallet => "bot_wallet" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Open,
    Exiting,
    Closed,
    /// Exit retries exhausted; the user has to intervene.
    Manual,
}

string_enum!(PositionState {
    Open => "open",
    Exiting => "exiting",
    Closed => "closed",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Trailing,
    Timeout,
    Rug,
    Manual,
}

string_enum!(ExitReason {
    TakeProfit => "take_profit",
    StopLoss => "stop_loss",
    Trailing => "trailing",
    Timeout => "timeout",
    Rug => "rug",
    Manual => "manual",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    /// Wallet that holds the tokens (user wallet or bot wallet address).
    pub owner: Pubkey,
    pub owner_kind: OwnerKind,
    /// User who receives notifications for this position.
    pub user: Pubkey,
    pub mint: Pubkey,
    pub launch_id: Option<i64>,
    pub entry_price: f64,
    pub entry_quote: Lamports,
    pub token_amount: u64,
    pub remaining_tokens: u64,
    pub entry_liquidity: f64,
    pub high_water_price: f64,
    pub take_profit_taken: bool,
    pub state: PositionState,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: i64,
    pub opened_at: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

string_enum!(TradeSide { Buy => "buy", Sell => "sell" });

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user: Pubkey,
    pub wallet: Pubkey,
    pub mint: Pubkey,
    pub side: TradeSide,
    pub quote_amount: Lamports,
    pub token_amount: u64,
    pub unit_price: f64,
    pub fee: Lamports,
    pub tx_id: String,
    pub bundle_id: Option<String>,
    pub launch_id: Option<i64>,
    pub slot: Option<u64>,
    pub position_id: Option<i64>,
    pub timestamp: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamport_conversions() {
        assert_eq!(sol_to_lamports(0.05), 50_000_000);
        assert_eq!(sol_to_lamports(-1.0), 0);
        assert!((lamports_to_sol(1_500_000_000) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_token_status_graph() {
        assert!(TokenStatus::Pending.can_transition_to(TokenStatus::Enriched));
        assert!(TokenStatus::Pending.can_transition_to(TokenStatus::Rejected));
        assert!(TokenStatus::Scored.can_transition_to(TokenStatus::Consumed));
        assert!(!TokenStatus::Enriched.can_transition_to(TokenStatus::Rejected));
        assert!(!TokenStatus::Scored.can_transition_to(TokenStatus::Pending));
        assert!(!TokenStatus::Consumed.can_transition_to(TokenStatus::Scored));
    }

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!("funded".parse::<WalletState>().unwrap(), WalletState::Funded);
        assert_eq!(Recommendation::MoonbagBuy.as_str(), "MOONBAG_BUY");
        assert_eq!(Venue::from_dex_id("Raydium"), Venue::Raydium);
        assert!("bogus".parse::<LaunchState>().is_err());
    }

    #[test]
    fn test_millis_round_trip() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
        assert_eq!(try_from_millis(i64::MAX), None);
    }

    #[test]
    fn test_user_serialization_hides_key() {
        let mut user = User::new("Wallet111", Role::Sniper);
        user.encrypted_key = Some("c2VjcmV0".to_string());
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("c2VjcmV0"));
    }
}
