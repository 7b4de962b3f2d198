//! Named scoring profiles.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Relative weight of each scoring axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisWeights {
    pub liquidity: f64,
    pub social: f64,
    pub technical: f64,
    pub holder_distribution: f64,
    pub risk: f64,
    pub moon_potential: f64,
}

impl AxisWeights {
    pub fn total(&self) -> f64 {
        self.liquidity
            + self.social
            + self.technical
            + self.holder_distribution
            + self.risk
            + self.moon_potential
    }
}

/// Cut-offs for axis normalization and reason codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringThresholds {
    /// Liquidity (SOL) below which the liquidity axis scores zero.
    pub min_liquidity_sol: f64,
    /// Liquidity (SOL) at which the liquidity axis saturates.
    pub deep_liquidity_sol: f64,
    pub max_top10_pct: f64,
    pub healthy_top10_pct: f64,
    pub high_risk: u8,
    pub low_risk: u8,
    /// 1h price change (%) counted as strong momentum.
    pub strong_momentum_pct: f64,
    pub negative_momentum_pct: f64,
    pub high_volume_1h: f64,
    pub high_moon_potential: u8,
    pub min_age_secs: u64,
    pub min_confidence: f64,
}

/// Score cut-offs for each recommendation label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTable {
    pub strong_buy: u8,
    pub buy: u8,
    /// Moon potential needed for a moonbag.
    pub moonbag_moon_potential: u8,
    /// Minimum score a moonbag still needs.
    pub moonbag_min_score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringProfile {
    pub name: String,
    pub version: u32,
    pub weights: AxisWeights,
    pub thresholds: ScoringThresholds,
    pub labels: LabelTable,
}

impl ScoringProfile {
    /// Even weighting with conservative labels.
    pub fn balanced() -> Self {
        Self {
            name: "balanced".to_string(),
            version: 1,
            weights: AxisWeights {
                liquidity: 0.25,
                social: 0.10,
                technical: 0.15,
                holder_distribution: 0.20,
                risk: 0.20,
                moon_potential: 0.10,
            },
            thresholds: ScoringThresholds {
                min_liquidity_sol: 5.0,
                deep_liquidity_sol: 50.0,
                max_top10_pct: 45.0,
                healthy_top10_pct: 25.0,
                high_risk: 70,
                low_risk: 30,
                strong_momentum_pct: 20.0,
                negative_momentum_pct: -20.0,
                high_volume_1h: 50_000.0,
                high_moon_potential: 80,
                min_age_secs: 60,
                min_confidence: 0.5,
            },
            labels: LabelTable {
                strong_buy: 80,
                buy: 60,
                moonbag_moon_potential: 80,
                moonbag_min_score: 45,
            },
        }
    }

    /// Momentum-heavy weighting for early entries.
    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            version: 1,
            weights: AxisWeights {
                liquidity: 0.15,
                social: 0.05,
                technical: 0.30,
                holder_distribution: 0.10,
                risk: 0.15,
                moon_potential: 0.25,
            },
            thresholds: ScoringThresholds {
                min_liquidity_sol: 2.0,
                deep_liquidity_sol: 25.0,
                max_top10_pct: 60.0,
                healthy_top10_pct: 30.0,
                high_risk: 80,
                low_risk: 40,
                strong_momentum_pct: 10.0,
                negative_momentum_pct: -30.0,
                high_volume_1h: 20_000.0,
                high_moon_potential: 70,
                min_age_secs: 0,
                min_confidence: 0.3,
            },
            labels: LabelTable {
                strong_buy: 70,
                buy: 50,
                moonbag_moon_potential: 70,
                moonbag_min_score: 35,
            },
        }
    }

    pub fn builtin() -> Vec<Self> {
        vec![Self::balanced(), Self::aggressive()]
    }

    /// Load additional profiles from a JSON array.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scoring profiles from {}", path.display()))?;
        let profiles: Vec<Self> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse scoring profiles in {}", path.display()))?;
        for profile in &profiles {
            profile.validate()?;
        }
        Ok(profiles)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("scoring profile name must not be empty");
        }
        if self.weights.total() <= 0.0 {
            bail!("scoring profile '{}' has no positive weight", self.name);
        }
        if self.thresholds.deep_liquidity_sol <= self.thresholds.min_liquidity_sol {
            bail!("scoring profile '{}': deep liquidity must exceed minimum", self.name);
        }
        if self.labels.buy > self.labels.strong_buy {
            bail!("scoring profile '{}': buy cut-off above strong_buy", self.name);
        }
        Ok(())
    }

    /// `name@version`, stamped on every score.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for profile in ScoringProfile::builtin() {
            profile.validate().unwrap();
        }
        assert_eq!(ScoringProfile::balanced().id(), "balanced@1");
    }

    #[test]
    fn test_load_file_roundtrips_custom_profile() -> Result<()> {
        let mut custom = ScoringProfile::balanced();
        custom.name = "strict".to_string();
        custom.version = 3;
        custom.labels.strong_buy = 90;

        let path = std::env::temp_dir().join(format!("profiles-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&vec![custom.clone()])?)?;
        let loaded = ScoringProfile::load_file(&path)?;
        std::fs::remove_file(&path)?;

        assert_eq!(loaded, vec![custom]);
        Ok(())
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let mut bad = ScoringProfile::balanced();
        bad.thresholds.deep_liquidity_sol = 1.0;
        assert!(bad.validate().is_err());
    }
}
