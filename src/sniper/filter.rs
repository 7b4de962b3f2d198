//! Per-user sniper policy filter.
//!
//! Rules run in a fixed order and fail closed: a premium-only filter on a
//! non-premium account rejects outright, every other violated rule adds its
//! reason to the rejection.

use serde::Serialize;

use crate::types::{EnrichedToken, Recommendation, ScoredRecommendation, SniperPolicy};

pub const PREMIUM_REQUIRED: &str = "premium_required";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reasons", rename_all = "snake_case")]
pub enum FilterDecision {
    Accept,
    Reject(Vec<&'static str>),
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }

    pub fn reasons(&self) -> &[&'static str] {
        match self {
            FilterDecision::Accept => &[],
            FilterDecision::Reject(reasons) => reasons,
        }
    }
}

/// Decide whether a user with `policy` should buy this scored mint.
pub fn evaluate(
    premium: bool,
    policy: &SniperPolicy,
    token: &EnrichedToken,
    scored: &ScoredRecommendation,
) -> FilterDecision {
    let filters = &policy.filters;
    if !premium && !filters.premium_fields_in_use().is_empty() {
        return FilterDecision::Reject(vec![PREMIUM_REQUIRED]);
    }

    let mut reasons = Vec::new();

    if filters.require_socials && !token.socials_present {
        reasons.push("no_socials");
    }
    if filters.require_liquidity_burnt && !token.liquidity_burnt {
        reasons.push("liquidity_not_burnt");
    }
    if filters.require_immutable_metadata && !token.immutable_metadata {
        reasons.push("mutable_metadata");
    }
    if filters.require_mint_revoked && token.mint_authority_present {
        reasons.push("mint_authority");
    }
    if filters.require_freeze_revoked && token.freeze_authority_present {
        reasons.push("freeze_authority");
    }

    if let Some(min) = filters.min_pool_size_sol {
        if token.liquidity_sol < min {
            reasons.push("pool_size");
        }
    }
    if let Some(min) = filters.min_age_secs {
        if token.pair_age_secs < min {
            reasons.push("too_young");
        }
    }
    if let Some(max) = filters.max_top_holders_pct {
        if token.top10_holder_pct > max {
            reasons.push("concentration");
        }
    }
    if let Some(max) = filters.max_risk_score {
        if token.risk_score > max {
            reasons.push("risk_score");
        }
    }
    if let Some(max) = filters.max_webacy_risk {
        // Missing Webacy data cannot satisfy a Webacy bound.
        if token.webacy_risk.map_or(true, |risk| risk > max) {
            reasons.push("webacy_risk");
        }
    }
    if let Some(min) = filters.min_moon_potential {
        if token.moon_potential < min {
            reasons.push("moon_potential");
        }
    }
    if let Some(min) = filters.min_score {
        if scored.score < min {
            reasons.push("score");
        }
    }

    if !filters.allowed_venues.is_empty() && !filters.allowed_venues.contains(&token.venue) {
        reasons.push("venue");
    }

    if scored.recommendation == Recommendation::Skip {
        reasons.push("recommendation_skip");
    }

    if reasons.is_empty() {
        FilterDecision::Accept
    } else {
        FilterDecision::Reject(reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_naive, AxisScores, Venue};

    fn token() -> EnrichedToken {
        EnrichedToken {
            mint: "So11111111111111111111111111111111111111112".to_string(),
            price: 0.0001,
            market_cap: 50_000.0,
            liquidity_sol: 30.0,
            volume_24h: 0.0,
            volume_6h: 0.0,
            volume_1h: 0.0,
            volume_5m: 0.0,
            price_change_5m: 0.0,
            price_change_1h: 0.0,
            price_change_6h: 0.0,
            price_change_24h: 0.0,
            pair_age_secs: 300,
            venue: Venue::Raydium,
            socials_present: true,
            top10_holder_pct: 20.0,
            mint_authority_present: false,
            freeze_authority_present: false,
            honeypot: false,
            liquidity_burnt: true,
            immutable_metadata: true,
            webacy_risk: Some(10.0),
            risk_score: 15,
            moon_potential: 60,
            confidence: 0.9,
            enriched_at: now_naive(),
        }
    }

    fn scored(recommendation: Recommendation) -> ScoredRecommendation {
        ScoredRecommendation {
            mint: token().mint,
            score: 72,
            confidence: 90,
            recommendation,
            reasons: vec![],
            axes: AxisScores::default(),
            profile: "balanced@1".to_string(),
        }
    }

    #[test]
    fn test_default_policy_accepts_clean_token() {
        let decision = evaluate(false, &SniperPolicy::default(), &token(), &scored(Recommendation::Buy));
        assert_eq!(decision, FilterDecision::Accept);
    }

    #[test]
    fn test_concentration_rejects() {
        let mut policy = SniperPolicy::default();
        policy.filters.max_top_holders_pct = Some(45.0);
        let mut t = token();
        t.top10_holder_pct = 70.0;
        let decision = evaluate(false, &policy, &t, &scored(Recommendation::Buy));
        assert_eq!(decision, FilterDecision::Reject(vec!["concentration"]));
    }

    #[test]
    fn test_premium_fields_reject_non_premium_unconditionally() {
        let mut policy = SniperPolicy::default();
        policy.filters.min_moon_potential = Some(10);
        let decision = evaluate(false, &policy, &token(), &scored(Recommendation::StrongBuy));
        assert_eq!(decision.reasons(), &[PREMIUM_REQUIRED]);

        assert!(evaluate(true, &policy, &token(), &scored(Recommendation::StrongBuy)).is_accept());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let mut policy = SniperPolicy::default();
        policy.filters.require_socials = true;
        policy.filters.min_pool_size_sol = Some(50.0);
        policy.filters.allowed_venues = vec![Venue::PumpSwap];
        let mut t = token();
        t.socials_present = false;
        t.mint_authority_present = true;
        let decision = evaluate(false, &policy, &t, &scored(Recommendation::Skip));
        assert_eq!(
            decision.reasons(),
            &["no_socials", "mint_authority", "pool_size", "venue", "recommendation_skip"]
        );
    }

    #[test]
    fn test_webacy_bound_fails_closed_without_data() {
        let mut policy = SniperPolicy::default();
        policy.filters.max_webacy_risk = Some(50.0);
        let mut t = token();
        t.webacy_risk = None;
        let decision = evaluate(true, &policy, &t, &scored(Recommendation::Buy));
        assert_eq!(decision.reasons(), &["webacy_risk"]);
    }
}
