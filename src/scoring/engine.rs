//! Scoring engine: combines enrichment fields into a weighted score.

use tracing::{debug, instrument};

use super::profile::ScoringProfile;
use crate::types::{AxisScores, EnrichedToken, ReasonCode, Recommendation, ScoredRecommendation};

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    profile: ScoringProfile,
}

impl ScoringEngine {
    pub fn new(profile: ScoringProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ScoringProfile {
        &self.profile
    }

    /// Score a token. Identical input always yields identical output.
    #[instrument(skip(self, token), fields(mint = %token.mint))]
    pub fn score(&self, token: &EnrichedToken) -> ScoredRecommendation {
        let axes = self.axes(token);
        let weights = &self.profile.weights;

        let weighted = axes.liquidity * weights.liquidity
            + axes.social * weights.social
            + axes.technical * weights.technical
            + axes.holder_distribution * weights.holder_distribution
            + axes.risk * weights.risk
            + axes.moon_potential * weights.moon_potential;
        let total = weights.total();
        let score = if total > 0.0 {
            (weighted / total * 100.0).round().clamp(0.0, 100.0) as u8
        } else {
            0
        };

        let reasons = self.reasons(token);
        let recommendation = self.label(token, score, &reasons);
        let confidence = (token.confidence * 100.0).round().clamp(0.0, 100.0) as u8;

        debug!(
            "Scored {} -> {} ({}) with {} reasons",
            token.mint,
            score,
            recommendation,
            reasons.len()
        );

        ScoredRecommendation {
            mint: token.mint.clone(),
            score,
            confidence,
            recommendation,
            reasons,
            axes,
            profile: self.profile.id(),
        }
    }

    fn axes(&self, token: &EnrichedToken) -> AxisScores {
        AxisScores {
            liquidity: self.liquidity_axis(token.liquidity_sol),
            social: social_axis(token),
            technical: self.technical_axis(token),
            holder_distribution: holder_axis(token.top10_holder_pct),
            risk: risk_axis(token),
            moon_potential: f64::from(token.moon_potential.min(100)) / 100.0,
        }
    }

    /// 0 at the minimum liquidity, 1 at the deep-liquidity mark.
    fn liquidity_axis(&self, liquidity_sol: f64) -> f64 {
        let min = self.profile.thresholds.min_liquidity_sol;
        let deep = self.profile.thresholds.deep_liquidity_sol;
        if liquidity_sol < min {
            0.0
        } else if liquidity_sol >= deep {
            1.0
        } else {
            (liquidity_sol - min) / (deep - min)
        }
    }

    fn technical_axis(&self, token: &EnrichedToken) -> f64 {
        let change = token.price_change_1h / 100.0;
        // Extreme pumps are discounted as likely manipulation.
        let momentum = match change {
            x if x <= -0.5 => 0.0,
            x if x <= 0.0 => 0.2,
            x if x <= 0.5 => 0.5 + x,
            x if x <= 2.0 => 0.8,
            x if x <= 10.0 => 0.9,
            _ => 0.7,
        };
        let volume = if self.profile.thresholds.high_volume_1h > 0.0 {
            (token.volume_1h / self.profile.thresholds.high_volume_1h).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (0.6 * momentum + 0.4 * volume).clamp(0.0, 1.0)
    }

    fn reasons(&self, token: &EnrichedToken) -> Vec<ReasonCode> {
        let t = &self.profile.thresholds;
        let mut reasons = Vec::new();

        if token.liquidity_sol < t.min_liquidity_sol {
            reasons.push(ReasonCode::LowLiquidity);
        } else if token.liquidity_sol >= t.deep_liquidity_sol {
            reasons.push(ReasonCode::DeepLiquidity);
        }

        reasons.push(if token.socials_present {
            ReasonCode::SocialsPresent
        } else {
            ReasonCode::NoSocials
        });

        if token.top10_holder_pct > t.max_top10_pct {
            reasons.push(ReasonCode::HighConcentration);
        } else if token.top10_holder_pct <= t.healthy_top10_pct {
            reasons.push(ReasonCode::HealthyDistribution);
        }

        if token.mint_authority_present {
            reasons.push(ReasonCode::MintAuthorityPresent);
        }
        if token.freeze_authority_present {
            reasons.push(ReasonCode::FreezeAuthorityPresent);
        }
        if token.honeypot {
            reasons.push(ReasonCode::Honeypot);
        }

        if token.risk_score >= t.high_risk {
            reasons.push(ReasonCode::HighRisk);
        } else if token.risk_score <= t.low_risk {
            reasons.push(ReasonCode::LowRisk);
        }

        if token.price_change_1h >= t.strong_momentum_pct {
            reasons.push(ReasonCode::StrongMomentum);
        } else if token.price_change_1h <= t.negative_momentum_pct {
            reasons.push(ReasonCode::NegativeMomentum);
        }

        if token.volume_1h >= t.high_volume_1h {
            reasons.push(ReasonCode::HighVolume);
        }
        if token.moon_potential >= t.high_moon_potential {
            reasons.push(ReasonCode::HighMoonPotential);
        }
        if token.pair_age_secs < t.min_age_secs {
            reasons.push(ReasonCode::TooYoung);
        }
        if token.confidence < t.min_confidence {
            reasons.push(ReasonCode::LowConfidence);
        }
        reasons
    }

    /// Honeypots are always skipped; low confidence caps the label at BUY.
    fn label(&self, token: &EnrichedToken, score: u8, reasons: &[ReasonCode]) -> Recommendation {
        let labels = &self.profile.labels;
        if token.honeypot {
            return Recommendation::Skip;
        }
        let low_confidence = reasons.contains(&ReasonCode::LowConfidence);
        if score >= labels.strong_buy && !low_confidence {
            Recommendation::StrongBuy
        } else if score >= labels.buy {
            Recommendation::Buy
        } else if token.moon_potential >= labels.moonbag_moon_potential && score >= labels.moonbag_min_score {
            Recommendation::MoonbagBuy
        } else {
            Recommendation::Skip
        }
    }
}

fn social_axis(token: &EnrichedToken) -> f64 {
    let socials = if token.socials_present { 0.7 } else { 0.0 };
    let metadata = if token.immutable_metadata { 0.3 } else { 0.0 };
    socials + metadata
}

/// Inverse of top-10 concentration, in steps.
fn holder_axis(top10_pct: f64) -> f64 {
    match top10_pct {
        x if x >= 90.0 => 0.0,
        x if x >= 70.0 => 0.2,
        x if x >= 50.0 => 0.5,
        x if x >= 30.0 => 0.8,
        _ => 1.0,
    }
}

fn risk_axis(token: &EnrichedToken) -> f64 {
    if token.honeypot {
        return 0.0;
    }
    let mut axis = 1.0 - f64::from(token.risk_score.min(100)) / 100.0;
    if token.mint_authority_present {
        axis *= 0.5;
    }
    if token.freeze_authority_present {
        axis *= 0.5;
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_naive, Venue};

    fn token() -> EnrichedToken {
        EnrichedToken {
            mint: "So11111111111111111111111111111111111111112".to_string(),
            price: 0.0001,
            market_cap: 100_000.0,
            liquidity_sol: 60.0,
            volume_24h: 200_000.0,
            volume_6h: 120_000.0,
            volume_1h: 60_000.0,
            volume_5m: 5_000.0,
            price_change_5m: 3.0,
            price_change_1h: 40.0,
            price_change_6h: 80.0,
            price_change_24h: 120.0,
            pair_age_secs: 600,
            venue: Venue::Raydium,
            socials_present: true,
            top10_holder_pct: 20.0,
            mint_authority_present: false,
            freeze_authority_present: false,
            honeypot: false,
            liquidity_burnt: true,
            immutable_metadata: true,
            webacy_risk: Some(10.0),
            risk_score: 10,
            moon_potential: 70,
            confidence: 0.9,
            enriched_at: now_naive(),
        }
    }

    fn engine() -> ScoringEngine {
        ScoringEngine::new(ScoringProfile::balanced())
    }

    #[test]
    fn test_strong_token_is_strong_buy() {
        let scored = engine().score(&token());
        assert!(scored.score >= 80, "score {}", scored.score);
        assert_eq!(scored.recommendation, Recommendation::StrongBuy);
        assert_eq!(scored.confidence, 90);
        assert_eq!(scored.profile, "balanced@1");
        assert!(scored.reasons.contains(&ReasonCode::DeepLiquidity));
        assert!(scored.reasons.contains(&ReasonCode::HealthyDistribution));
        assert!(scored.reasons.contains(&ReasonCode::StrongMomentum));
        assert!(scored.reasons.contains(&ReasonCode::HighVolume));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let engine = engine();
        let t = token();
        assert_eq!(engine.score(&t), engine.score(&t));
    }

    #[test]
    fn test_honeypot_always_skips() {
        let mut t = token();
        t.honeypot = true;
        let scored = engine().score(&t);
        assert_eq!(scored.recommendation, Recommendation::Skip);
        assert!(scored.reasons.contains(&ReasonCode::Honeypot));
        assert_eq!(scored.axes.risk, 0.0);
    }

    #[test]
    fn test_weak_token_skips_with_reasons() {
        let mut t = token();
        t.liquidity_sol = 1.0;
        t.socials_present = false;
        t.top10_holder_pct = 95.0;
        t.mint_authority_present = true;
        t.risk_score = 85;
        t.price_change_1h = -60.0;
        t.volume_1h = 0.0;
        t.moon_potential = 5;
        t.pair_age_secs = 10;
        let scored = engine().score(&t);
        assert_eq!(scored.recommendation, Recommendation::Skip);
        for code in [
            ReasonCode::LowLiquidity,
            ReasonCode::NoSocials,
            ReasonCode::HighConcentration,
            ReasonCode::MintAuthorityPresent,
            ReasonCode::HighRisk,
            ReasonCode::NegativeMomentum,
            ReasonCode::TooYoung,
        ] {
            assert!(scored.reasons.contains(&code), "missing {}", code);
        }
    }

    #[test]
    fn test_low_confidence_caps_label() {
        let mut t = token();
        t.confidence = 0.2;
        let scored = engine().score(&t);
        assert!(scored.score >= 80);
        assert_eq!(scored.recommendation, Recommendation::Buy);
        assert!(scored.reasons.contains(&ReasonCode::LowConfidence));
    }

    #[test]
    fn test_moonbag_label() {
        let mut t = token();
        t.liquidity_sol = 6.0;
        t.socials_present = false;
        t.immutable_metadata = false;
        t.price_change_1h = 0.0;
        t.volume_1h = 0.0;
        t.moon_potential = 95;
        let scored = engine().score(&t);
        assert!(scored.score >= 45 && scored.score < 60, "score {}", scored.score);
        assert_eq!(scored.recommendation, Recommendation::MoonbagBuy);
    }
}
