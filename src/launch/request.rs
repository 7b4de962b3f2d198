//! Launch request contract and its up-front checks.

use serde::{Deserialize, Serialize};

use crate::config::LaunchConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{Lamports, LaunchMetadata, Pubkey, Venue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub creator: Pubkey,
    pub metadata: LaunchMetadata,
    pub bot_count: u32,
    #[serde(default)]
    pub per_bot_buy: Lamports,
    /// Per-wallet funding; defaults to the buy plus the configured margin.
    #[serde(default)]
    pub pre_fund_amount: Option<Lamports>,
    #[serde(default)]
    pub creator_buy: Lamports,
    pub venue: Venue,
    #[serde(default = "default_strategy")]
    pub sell_strategy_id: String,
}

fn default_strategy() -> String {
    "default".to_string()
}

impl LaunchRequest {
    pub fn pre_fund(&self, config: &LaunchConfig) -> Lamports {
        self.pre_fund_amount.unwrap_or_else(|| {
            (self.per_bot_buy as f64 * (1.0 + config.pre_fund_margin)).ceil() as Lamports
        })
    }

    /// Transactions in the launch bundle: create, creator buy, bot buys, tip.
    pub fn bundle_len(&self, config: &LaunchConfig) -> usize {
        1 + usize::from(self.creator_buy > 0)
            + self.bot_count as usize
            + usize::from(config.tip_lamports > 0)
    }

    /// What one bot wallet costs the creator: its pre-fund, and never less
    /// than the buy plus the configured headroom.
    pub fn per_bot_outlay(&self, config: &LaunchConfig) -> PipelineResult<Lamports> {
        let floor = self
            .per_bot_buy
            .checked_add(config.pre_fund_headroom)
            .ok_or_else(|| overflow("per-bot buy"))?;
        Ok(self.pre_fund(config).max(floor))
    }

    /// `bot_count·per_bot_outlay + creator_buy + fixed_fees·1.1`.
    pub fn estimated_cost(&self, config: &LaunchConfig) -> PipelineResult<Lamports> {
        let bots = u64::from(self.bot_count)
            .checked_mul(self.per_bot_outlay(config)?)
            .ok_or_else(|| overflow("bot funding"))?;
        let fees = config
            .fixed_fees
            .checked_mul(11)
            .ok_or_else(|| overflow("fees"))?
            .div_ceil(10);
        bots.checked_add(self.creator_buy)
            .and_then(|total| total.checked_add(fees))
            .ok_or_else(|| overflow("launch cost"))
    }

    /// Shape checks that need no I/O.
    pub fn validate(&self, config: &LaunchConfig) -> PipelineResult<()> {
        let m = &self.metadata;
        for (field, value) in [
            ("name", &m.name),
            ("symbol", &m.symbol),
            ("image_uri", &m.image_uri),
            ("metadata_uri", &m.metadata_uri),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::validation(format!("metadata.{} is required", field)));
            }
        }
        if self.bot_count > config.max_bot_count {
            return Err(PipelineError::validation(format!(
                "bot_count {} exceeds the maximum of {}",
                self.bot_count, config.max_bot_count
            )));
        }
        if self.bot_count == 0 && self.creator_buy == 0 {
            return Err(PipelineError::validation("a launch needs bot buys or a creator buy"));
        }
        if self.bot_count > 0 {
            if self.per_bot_buy == 0 {
                return Err(PipelineError::validation("per_bot_buy must be positive"));
            }
            let pre_fund = self.pre_fund(config);
            if pre_fund <= self.per_bot_buy {
                return Err(PipelineError::validation(format!(
                    "pre-fund {} must exceed per-bot buy {}",
                    pre_fund, self.per_bot_buy
                )));
            }
        }
        let len = self.bundle_len(config);
        if len > config.bundle_size_limit {
            return Err(PipelineError::validation(format!(
                "bundle of {} transactions exceeds the limit of {}",
                len, config.bundle_size_limit
            )));
        }
        self.estimated_cost(config)?;
        if !config.sell_strategies.is_empty() && !config.sell_strategies.contains_key(&self.sell_strategy_id) {
            return Err(PipelineError::validation(format!(
                "unknown sell strategy '{}'",
                self.sell_strategy_id
            )));
        }
        Ok(())
    }
}

fn overflow(what: &str) -> PipelineError {
    PipelineError::validation(format!("{} overflows lamports", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LAMPORTS_PER_SOL;

    fn request() -> LaunchRequest {
        LaunchRequest {
            creator: "Creator111".to_string(),
            metadata: LaunchMetadata {
                name: "Test".to_string(),
                symbol: "TST".to_string(),
                description: String::new(),
                image_uri: "ipfs://img".to_string(),
                metadata_uri: "ipfs://meta".to_string(),
            },
            bot_count: 3,
            per_bot_buy: 50_000_000,
            pre_fund_amount: Some(60_000_000),
            creator_buy: 100_000_000,
            venue: Venue::PumpFun,
            sell_strategy_id: "default".to_string(),
        }
    }

    fn config() -> LaunchConfig {
        LaunchConfig {
            tip_lamports: 0,
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn test_valid_request_and_cost() {
        let r = request();
        r.validate(&config()).unwrap();
        assert_eq!(r.bundle_len(&config()), 5);
        // 3·(0.05 + 0.01) + 0.1 + 0.025·1.1
        assert_eq!(r.estimated_cost(&config()).unwrap(), 180_000_000 + 100_000_000 + 27_500_000);
    }

    #[test]
    fn test_explicit_pre_fund_is_charged_per_bot() {
        let mut r = request();
        r.pre_fund_amount = Some(LAMPORTS_PER_SOL);
        r.validate(&config()).unwrap();
        assert_eq!(r.per_bot_outlay(&config()).unwrap(), LAMPORTS_PER_SOL);
        // 3·1.0 + 0.1 + 0.025·1.1
        assert_eq!(
            r.estimated_cost(&config()).unwrap(),
            3 * LAMPORTS_PER_SOL + 100_000_000 + 27_500_000
        );
    }

    #[test]
    fn test_oversized_amounts_are_rejected() {
        let mut r = request();
        r.bot_count = 0;
        r.creator_buy = u64::MAX;
        assert_eq!(r.estimated_cost(&config()).unwrap_err().reason_code(), "validation");
        assert_eq!(r.validate(&config()).unwrap_err().reason_code(), "validation");

        let mut r = request();
        r.per_bot_buy = u64::MAX - 1;
        r.pre_fund_amount = Some(u64::MAX);
        assert_eq!(r.validate(&config()).unwrap_err().reason_code(), "validation");

        let mut r = request();
        r.per_bot_buy = u64::MAX / 2;
        r.pre_fund_amount = Some(u64::MAX / 2 + 1);
        assert!(r.estimated_cost(&config()).is_err());
    }

    #[test]
    fn test_pre_fund_equal_to_buy_rejected() {
        let mut r = request();
        r.pre_fund_amount = Some(r.per_bot_buy);
        let err = r.validate(&config()).unwrap_err();
        assert_eq!(err.reason_code(), "validation");
    }

    #[test]
    fn test_default_pre_fund_uses_margin() {
        let mut r = request();
        r.pre_fund_amount = None;
        assert_eq!(r.pre_fund(&config()), 60_000_000);
    }

    #[test]
    fn test_zero_bots_needs_a_creator_buy() {
        let mut r = request();
        r.bot_count = 0;
        r.per_bot_buy = 0;
        r.validate(&config()).unwrap();
        assert_eq!(r.bundle_len(&config()), 2);

        r.creator_buy = 0;
        assert_eq!(r.validate(&config()).unwrap_err().reason_code(), "validation");
    }

    #[test]
    fn test_bundle_limit_counts_tip() {
        let r = request();
        let with_tip = LaunchConfig {
            tip_lamports: 1_000_000,
            ..LaunchConfig::default()
        };
        assert!(r.validate(&with_tip).is_err());
    }

    #[test]
    fn test_missing_metadata_and_unknown_strategy() {
        let mut r = request();
        r.metadata.symbol = " ".to_string();
        assert!(r.validate(&config()).is_err());

        let mut r = request();
        r.sell_strategy_id = "moon".to_string();
        assert!(r.validate(&config()).is_err());
    }
}
