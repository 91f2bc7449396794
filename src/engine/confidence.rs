//! Weighted multi-factor entry confidence score (component E).

use serde::{Deserialize, Serialize};

const WEIGHT_PRICE_DROP: f64 = 0.30;
const WEIGHT_TIME_REMAINING: f64 = 0.20;
const WEIGHT_VOLUME: f64 = 0.15;
const WEIGHT_TREND: f64 = 0.15;
const WEIGHT_GAME_PHASE: f64 = 0.10;
const WEIGHT_SPREAD: f64 = 0.10;

const STRONG_BUY_THRESHOLD: f64 = 0.80;
const BUY_THRESHOLD: f64 = 0.60;
const HOLD_THRESHOLD: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Avoid,
}

impl Recommendation {
    fn from_score(score: f64) -> Self {
        if score >= STRONG_BUY_THRESHOLD {
            Recommendation::StrongBuy
        } else if score >= BUY_THRESHOLD {
            Recommendation::Buy
        } else if score >= HOLD_THRESHOLD {
            Recommendation::Hold
        } else {
            Recommendation::Avoid
        }
    }
}

/// Price trend direction as reported by the upstream data source. `Unknown`
/// covers both "flat" and "not computed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Down,
    Up,
    Unknown,
}

/// Inputs to the confidence score, one factor per weighted term in 4.E.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceFactors {
    pub drop_pct: f64,
    pub time_remaining_secs: i64,
    /// `None` when the exchange does not report volume for this market.
    pub volume_24h: Option<f64>,
    pub trend: Trend,
    pub current_phase: u32,
    pub total_phases: u32,
    /// `None` when the order book is too thin to compute a spread.
    pub spread_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub score: f64,
    pub recommendation: Recommendation,
}

/// Clamp `x` to `[0, 1]` after an affine map from `[lo, hi]`.
fn linear(x: f64, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        return if x >= hi { 1.0 } else { 0.0 };
    }
    ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
}

fn price_drop_subscore(drop_pct: f64) -> f64 {
    linear(drop_pct, 0.0, 20.0)
}

fn time_remaining_subscore(secs: i64) -> f64 {
    linear(secs as f64, 0.0, 1200.0)
}

fn volume_subscore(volume_24h: Option<f64>) -> f64 {
    match volume_24h {
        None => 0.5,
        Some(v) => 0.2 + linear(v, 1_000.0, 50_000.0) * 0.8,
    }
}

fn trend_subscore(trend: Trend) -> f64 {
    match trend {
        Trend::Down => 0.8,
        Trend::Up => 0.2,
        Trend::Unknown => 0.5,
    }
}

fn game_phase_subscore(current_phase: u32, total_phases: u32) -> f64 {
    if total_phases == 0 {
        return 0.5;
    }
    (1.0 - (current_phase as f64 / total_phases as f64)).clamp(0.0, 1.0)
}

fn spread_subscore(spread_pct: Option<f64>) -> f64 {
    match spread_pct {
        None => 0.5,
        Some(s) if s <= 1.0 => 1.0,
        Some(s) if s >= 10.0 => 0.1,
        Some(s) => 1.0 - (s - 1.0) / 9.0 * 0.9,
    }
}

/// Compute the weighted confidence score and the derived recommendation.
pub fn score(factors: ConfidenceFactors) -> ConfidenceScore {
    let weighted = WEIGHT_PRICE_DROP * price_drop_subscore(factors.drop_pct)
        + WEIGHT_TIME_REMAINING * time_remaining_subscore(factors.time_remaining_secs)
        + WEIGHT_VOLUME * volume_subscore(factors.volume_24h)
        + WEIGHT_TREND * trend_subscore(factors.trend)
        + WEIGHT_GAME_PHASE * game_phase_subscore(factors.current_phase, factors.total_phases)
        + WEIGHT_SPREAD * spread_subscore(factors.spread_pct);

    ConfidenceScore {
        score: weighted,
        recommendation: Recommendation::from_score(weighted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_factors() -> ConfidenceFactors {
        ConfidenceFactors {
            drop_pct: 0.0,
            time_remaining_secs: 0,
            volume_24h: None,
            trend: Trend::Unknown,
            current_phase: 2,
            total_phases: 4,
            spread_pct: None,
        }
    }

    #[test]
    fn zero_drop_and_zero_time_score_low() {
        let s = score(base_factors());
        assert!(s.score < HOLD_THRESHOLD || s.recommendation == Recommendation::Hold);
    }

    #[test]
    fn max_factors_score_strong_buy() {
        let factors = ConfidenceFactors {
            drop_pct: 25.0,
            time_remaining_secs: 1500,
            volume_24h: Some(60_000.0),
            trend: Trend::Down,
            current_phase: 0,
            total_phases: 4,
            spread_pct: Some(0.5),
        };
        let s = score(factors);
        assert_eq!(s.recommendation, Recommendation::StrongBuy);
        assert!(s.score >= STRONG_BUY_THRESHOLD);
    }

    #[test]
    fn recommendation_boundaries_are_inclusive() {
        assert_eq!(Recommendation::from_score(0.80), Recommendation::StrongBuy);
        assert_eq!(Recommendation::from_score(0.60), Recommendation::Buy);
        assert_eq!(Recommendation::from_score(0.40), Recommendation::Hold);
        assert_eq!(Recommendation::from_score(0.399), Recommendation::Avoid);
    }

    #[test]
    fn volume_unknown_scores_midpoint() {
        assert_eq!(volume_subscore(None), 0.5);
    }

    #[test]
    fn spread_unknown_scores_midpoint() {
        assert_eq!(spread_subscore(None), 0.5);
    }

    #[test]
    fn game_phase_counts_down_to_zero_at_final_phase() {
        assert_eq!(game_phase_subscore(4, 4), 0.0);
        assert_eq!(game_phase_subscore(0, 4), 1.0);
    }
}
