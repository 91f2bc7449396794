//! Markets promoted into the engine's watch list after a successful
//! game-to-market match.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::settings::Sport;
use crate::exchange::ExchangeKind;

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketSide {
    Yes,
    No,
}

impl MarketSide {
    pub fn opposite(self) -> Self {
        match self {
            MarketSide::Yes => MarketSide::No,
            MarketSide::No => MarketSide::Yes,
        }
    }
}

/// A market (by condition-id or ticker) the system is watching for a
/// specific user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedMarket {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub market_id: String,
    pub sport: Sport,
    pub external_event_id: Option<String>,
    pub home_team: String,
    pub away_team: String,
    pub game_start_time: DateTime<Utc>,

    /// Captured exactly once, at first observation; never mutated afterward.
    pub baseline_yes_price: Decimal,
    pub baseline_no_price: Decimal,
    pub baseline_captured_at: DateTime<Utc>,

    pub current_yes_price: Decimal,
    pub current_no_price: Decimal,

    /// Live-clock snapshot, refreshed on every discovery-loop poll of the
    /// scoreboard (`SportsDataClient::fetch_live_events`). `clock_time_remaining_secs`
    /// is `None` for clockless sports (golf, tennis); otherwise it is the
    /// match-clock seconds remaining as of `clock_captured_at`, decayed by
    /// wall-clock elapsed time between polls.
    pub current_phase: u32,
    pub total_phases: u32,
    pub clock_time_remaining_secs: Option<i64>,
    pub clock_captured_at: DateTime<Utc>,

    pub match_confidence: f64,

    pub is_live: bool,
    pub is_finished: bool,
    pub is_user_selected: bool,
    pub auto_discovered: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedMarket {
    /// Percent drop of `current_yes_price` off the (write-once) baseline.
    /// Returns 0 when the price has not dropped (or has risen).
    pub fn drop_pct(&self) -> f64 {
        if self.baseline_yes_price <= Decimal::ZERO {
            return 0.0;
        }
        let drop = self.baseline_yes_price - self.current_yes_price;
        if drop <= Decimal::ZERO {
            return 0.0;
        }
        let pct = drop / self.baseline_yes_price * Decimal::from(100);
        pct.to_string().parse::<f64>().unwrap_or(0.0)
    }

    /// Seconds left in the live match, decayed in real time from the last
    /// scoreboard poll rather than re-read against `game_start_time` (which
    /// is always in the past for a tracked market — it is only created from
    /// `SportsDataClient::live_only` events). `None` at capture (clockless
    /// sports) reports 0, matching "time remaining undefined" for those
    /// sports' entry gates.
    pub fn time_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match self.clock_time_remaining_secs {
            Some(secs) => {
                let elapsed = (now - self.clock_captured_at).num_seconds().max(0);
                (secs - elapsed).max(0)
            }
            None => 0,
        }
    }
}

/// A market surfaced by discovery on one exchange, before it has been matched
/// to a live game (component C's output, component D's input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredMarket {
    pub exchange: ExchangeKind,
    pub market_id: String,
    pub title: String,
    pub description: Option<String>,
    pub sport: Option<Sport>,
    /// Home/away team strings pulled from the title by discovery's
    /// `"A vs B"` / `"A to beat B"` regex family (4.C). Order is title
    /// order, not home/away — the matcher resolves that against the
    /// scoreboard's game identity. `None` when the title didn't match any
    /// known separator.
    pub extracted_teams: Option<(String, String)>,
    pub end_time: DateTime<Utc>,
    pub liquidity: Decimal,
    pub volume_24h: Decimal,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub spread_pct: f64,
    pub status_open: bool,
}

impl DiscoveredMarket {
    pub fn passes_filters(
        &self,
        now: DateTime<Utc>,
        min_liquidity: Decimal,
        min_volume: Decimal,
        max_spread_pct: f64,
        hours_ahead: Option<i64>,
    ) -> bool {
        if !self.status_open {
            return false;
        }
        if self.end_time <= now {
            return false;
        }
        if self.liquidity < min_liquidity && self.volume_24h < min_volume {
            return false;
        }
        if self.spread_pct > max_spread_pct {
            return false;
        }
        if let Some(hours) = hours_ahead {
            if self.end_time > now + chrono::Duration::hours(hours) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(baseline: Decimal, current: Decimal) -> TrackedMarket {
        TrackedMarket {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: ExchangeKind::Kalshi,
            market_id: "MKT".into(),
            sport: "nba".into(),
            external_event_id: None,
            home_team: "Lakers".into(),
            away_team: "Celtics".into(),
            game_start_time: Utc::now(),
            baseline_yes_price: baseline,
            baseline_no_price: Decimal::ONE - baseline,
            baseline_captured_at: Utc::now(),
            current_yes_price: current,
            current_no_price: Decimal::ONE - current,
            current_phase: 2,
            total_phases: 4,
            clock_time_remaining_secs: Some(600),
            clock_captured_at: Utc::now(),
            match_confidence: 0.9,
            is_live: true,
            is_finished: false,
            is_user_selected: false,
            auto_discovered: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn drop_pct_matches_scenario_1_tick3() {
        // Spec 8.1: baseline 0.70, tick 0.59 -> drop ~15.7%
        let m = market(dec!(0.70), dec!(0.59));
        assert!((m.drop_pct() - 15.714).abs() < 0.01);
    }

    #[test]
    fn drop_pct_matches_scenario_1_tick4() {
        let m = market(dec!(0.70), dec!(0.48));
        assert!((m.drop_pct() - 31.428).abs() < 0.01);
    }

    #[test]
    fn drop_pct_is_zero_when_price_rises() {
        let m = market(dec!(0.70), dec!(0.75));
        assert_eq!(m.drop_pct(), 0.0);
    }

    #[test]
    fn discovered_market_filters_closed_status() {
        let dm = DiscoveredMarket {
            exchange: ExchangeKind::Polymarket,
            market_id: "m".into(),
            title: "Lakers vs Celtics".into(),
            description: None,
            sport: Some("nba".into()),
            extracted_teams: Some(("Lakers".into(), "Celtics".into())),
            end_time: Utc::now() + chrono::Duration::hours(2),
            liquidity: dec!(10000),
            volume_24h: dec!(0),
            yes_price: dec!(0.5),
            no_price: dec!(0.5),
            spread_pct: 1.0,
            status_open: false,
        };
        assert!(!dm.passes_filters(Utc::now(), dec!(1000), dec!(1000), 5.0, None));
    }

    #[test]
    fn time_remaining_decays_from_last_clock_capture() {
        let mut m = market(dec!(0.70), dec!(0.59));
        m.clock_time_remaining_secs = Some(300);
        m.clock_captured_at = Utc::now() - chrono::Duration::seconds(100);
        assert!((m.time_remaining_secs(Utc::now()) - 200).abs() <= 1);
    }

    #[test]
    fn time_remaining_floors_at_zero_past_the_captured_clock() {
        let mut m = market(dec!(0.70), dec!(0.59));
        m.clock_time_remaining_secs = Some(60);
        m.clock_captured_at = Utc::now() - chrono::Duration::seconds(600);
        assert_eq!(m.time_remaining_secs(Utc::now()), 0);
    }

    #[test]
    fn time_remaining_is_zero_for_clockless_sports() {
        let mut m = market(dec!(0.70), dec!(0.59));
        m.clock_time_remaining_secs = None;
        assert_eq!(m.time_remaining_secs(Utc::now()), 0);
    }
}
