//! Exit rules, evaluated in a fixed order against one observation.

use chrono::NaiveDateTime;

use crate::types::{ExitPolicy, ExitReason, Position};

/// Price and liquidity of a mint at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub price: f64,
    pub liquidity: f64,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Hold,
    Sell {
        reason: ExitReason,
        /// Share of the remaining tokens to sell, in (0, 1].
        fraction: f64,
    },
}

impl ExitAction {
    fn all(reason: ExitReason) -> Self {
        ExitAction::Sell {
            reason,
            fraction: 1.0,
        }
    }
}

/// Decide what to do with `position` given `observation`.
///
/// Order: rug, take-profit, trailing stop, stop-loss, timeout. Once a partial
/// take-profit has been taken the stop moves to breakeven.
pub fn evaluate_exit(position: &Position, policy: &ExitPolicy, observation: &Observation) -> ExitAction {
    let entry = position.entry_price;
    let price = observation.price;

    if position.entry_liquidity > 0.0 {
        let floor = position.entry_liquidity * (1.0 - policy.rug_liquidity_drop_pct / 100.0);
        if observation.liquidity <= floor {
            return ExitAction::all(ExitReason::Rug);
        }
    }

    if !position.take_profit_taken && price >= entry * (1.0 + policy.take_profit_pct / 100.0) {
        return match policy.partial_sell_pct {
            Some(pct) if pct > 0.0 && pct < 100.0 => ExitAction::Sell {
                reason: ExitReason::TakeProfit,
                fraction: pct / 100.0,
            },
            _ => ExitAction::all(ExitReason::TakeProfit),
        };
    }

    if let Some(trail) = policy.trailing_stop_pct {
        let high = position.high_water_price.max(price);
        if price <= high * (1.0 - trail / 100.0) {
            return ExitAction::all(ExitReason::Trailing);
        }
    }

    let stop = if position.take_profit_taken {
        entry
    } else {
        entry * (1.0 - policy.stop_loss_pct / 100.0)
    };
    if price <= stop {
        return ExitAction::all(ExitReason::StopLoss);
    }

    let held = observation.at - position.opened_at;
    if held.num_seconds() >= 0 && held.num_seconds() as u64 >= policy.timeout_secs {
        return ExitAction::all(ExitReason::Timeout);
    }

    ExitAction::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_naive, OwnerKind, PositionState};
    use chrono::Duration;

    fn position() -> Position {
        Position {
            id: 1,
            owner: "Owner111".to_string(),
            owner_kind: OwnerKind::BotWallet,
            user: "User111".to_string(),
            mint: "Mint111".to_string(),
            launch_id: None,
            entry_price: 1.0,
            entry_quote: 1_000_000_000,
            token_amount: 1_000_000,
            remaining_tokens: 1_000_000,
            entry_liquidity: 100.0,
            high_water_price: 1.0,
            take_profit_taken: false,
            state: PositionState::Open,
            exit_reason: None,
            realized_pnl: 0,
            opened_at: now_naive(),
            closed_at: None,
        }
    }

    fn policy() -> ExitPolicy {
        ExitPolicy {
            take_profit_pct: 50.0,
            stop_loss_pct: 20.0,
            trailing_stop_pct: None,
            timeout_secs: 3_600,
            rug_liquidity_drop_pct: 20.0,
            ..ExitPolicy::default()
        }
    }

    fn at(price: f64, liquidity: f64) -> Observation {
        Observation {
            price,
            liquidity,
            at: now_naive(),
        }
    }

    #[test]
    fn test_take_profit_path() {
        let p = position();
        assert_eq!(evaluate_exit(&p, &policy(), &at(1.3, 100.0)), ExitAction::Hold);
        assert_eq!(
            evaluate_exit(&p, &policy(), &at(1.6, 100.0)),
            ExitAction::all(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_rug_wins_over_price() {
        let p = position();
        assert_eq!(
            evaluate_exit(&p, &policy(), &at(1.0, 70.0)),
            ExitAction::all(ExitReason::Rug)
        );
        // Even with a price that would take profit.
        assert_eq!(
            evaluate_exit(&p, &policy(), &at(2.0, 50.0)),
            ExitAction::all(ExitReason::Rug)
        );
        assert_eq!(evaluate_exit(&p, &policy(), &at(1.0, 85.0)), ExitAction::Hold);
    }

    #[test]
    fn test_partial_take_profit_then_breakeven() {
        let mut policy = policy();
        policy.partial_sell_pct = Some(50.0);
        let mut p = position();
        assert_eq!(
            evaluate_exit(&p, &policy, &at(1.6, 100.0)),
            ExitAction::Sell {
                reason: ExitReason::TakeProfit,
                fraction: 0.5
            }
        );

        p.take_profit_taken = true;
        p.high_water_price = 1.6;
        assert_eq!(evaluate_exit(&p, &policy, &at(1.8, 100.0)), ExitAction::Hold);
        assert_eq!(
            evaluate_exit(&p, &policy, &at(0.99, 100.0)),
            ExitAction::all(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_trailing_and_stop_loss() {
        let mut policy = policy();
        policy.trailing_stop_pct = Some(10.0);
        let mut p = position();
        p.high_water_price = 1.4;
        assert_eq!(
            evaluate_exit(&p, &policy, &at(1.25, 100.0)),
            ExitAction::all(ExitReason::Trailing)
        );

        policy.trailing_stop_pct = None;
        p.high_water_price = 1.0;
        assert_eq!(
            evaluate_exit(&p, &policy, &at(0.79, 100.0)),
            ExitAction::all(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_timeout() {
        let mut p = position();
        p.opened_at = now_naive() - Duration::seconds(3_601);
        assert_eq!(
            evaluate_exit(&p, &policy(), &at(1.0, 100.0)),
            ExitAction::all(ExitReason::Timeout)
        );
    }

    #[test]
    fn test_unknown_entry_liquidity_disables_rug_check() {
        let mut p = position();
        p.entry_liquidity = 0.0;
        assert_eq!(evaluate_exit(&p, &policy(), &at(1.0, 0.0)), ExitAction::Hold);
    }
}
