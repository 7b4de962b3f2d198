//! Open positions: construction from fills, P&L bookkeeping and the monitor.

pub mod exit;
pub mod monitor;

pub use exit::{evaluate_exit, ExitAction, Observation};
pub use monitor::PositionMonitor;

use crate::chain::FillReport;
use crate::types::{now_naive, OwnerKind, Position, PositionState, Pubkey, Trade, TradeSide};

/// Who holds a position and on whose behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct Holder {
    pub owner: Pubkey,
    pub owner_kind: OwnerKind,
    pub user: Pubkey,
}

/// A fresh open position priced at the executed fill.
pub fn open_from_fill(
    holder: &Holder,
    mint: &str,
    launch_id: Option<i64>,
    fill: &FillReport,
    entry_liquidity: f64,
) -> Position {
    Position {
        id: 0,
        owner: holder.owner.clone(),
        owner_kind: holder.owner_kind,
        user: holder.user.clone(),
        mint: mint.to_string(),
        launch_id,
        entry_price: fill.unit_price,
        entry_quote: fill.quote_amount,
        token_amount: fill.token_amount,
        remaining_tokens: fill.token_amount,
        entry_liquidity,
        high_water_price: fill.unit_price,
        take_profit_taken: false,
        state: PositionState::Open,
        exit_reason: None,
        realized_pnl: 0,
        opened_at: now_naive(),
        closed_at: None,
    }
}

/// Ledger row for an executed swap.
pub fn trade_from_fill(
    holder: &Holder,
    mint: &str,
    side: TradeSide,
    fill: &FillReport,
    bundle_id: Option<String>,
    launch_id: Option<i64>,
    position_id: Option<i64>,
) -> Trade {
    Trade {
        id: 0,
        user: holder.user.clone(),
        wallet: holder.owner.clone(),
        mint: mint.to_string(),
        side,
        quote_amount: fill.quote_amount,
        token_amount: fill.token_amount,
        unit_price: fill.unit_price,
        fee: fill.fee,
        tx_id: fill.tx_id.clone(),
        bundle_id,
        launch_id,
        slot: fill.slot,
        position_id,
        timestamp: now_naive(),
    }
}

/// Book a sell against the position. Returns the P&L realized by this sell.
///
/// Cost basis is the entry quote pro rata to the tokens sold.
pub fn apply_sell(position: &mut Position, fill: &FillReport) -> i64 {
    let sold = fill.token_amount.min(position.remaining_tokens);
    let cost_basis = if position.token_amount == 0 {
        0
    } else {
        (u128::from(position.entry_quote) * u128::from(sold) / u128::from(position.token_amount)) as i64
    };
    let pnl = fill.quote_amount as i64 - cost_basis - fill.fee as i64;
    position.remaining_tokens -= sold;
    position.realized_pnl += pnl;
    pnl
}
