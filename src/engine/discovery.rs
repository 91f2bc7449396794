//! Candidate market discovery across exchanges (component C).
//!
//! Exchange-specific wire responses are translated by the caller (the
//! discovery loop in [`super::runtime`]) into [`RawCandidateMarket`]; this
//! module only does sport classification, team extraction, and filtering —
//! the same separation the teacher's `SportsMarketDiscovery` draws between
//! fetching (`fetch_league_markets`) and keyword classification
//! (`league_keywords`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::DiscoveredMarket;
use crate::exchange::ExchangeKind;

/// A market as reported by one exchange's listing endpoint, before sport
/// classification or team extraction.
#[derive(Debug, Clone)]
pub struct RawCandidateMarket {
    pub exchange: ExchangeKind,
    pub market_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Explicit sport/series tag from the exchange, when it publishes one.
    pub explicit_sport_tag: Option<String>,
    pub end_time: DateTime<Utc>,
    pub liquidity: Decimal,
    pub volume_24h: Decimal,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub status_open: bool,
}

/// Keyword table for sport classification when no explicit tag is present.
/// Matched case-insensitively against the combined title + description.
const SPORT_KEYWORDS: &[(&str, &[&str])] = &[
    ("nba", &["nba", "lakers", "celtics", "warriors", "knicks", "bulls", "heat", "bucks"]),
    ("nfl", &["nfl", "super bowl", "chiefs", "eagles", "cowboys", "patriots", "49ers"]),
    ("mlb", &["mlb", "world series", "yankees", "dodgers", "red sox"]),
    ("nhl", &["nhl", "stanley cup", "bruins", "rangers", "maple leafs"]),
    ("soccer", &["premier league", "champions league", "world cup", "uefa", "la liga"]),
    ("ufc", &["ufc", "mma", "octagon"]),
    ("golf", &["pga", "masters", "ryder cup"]),
    ("tennis", &["wimbledon", "us open", "atp", "wta", "roland garros"]),
];

fn classify_sport(raw: &RawCandidateMarket) -> Option<String> {
    if let Some(tag) = &raw.explicit_sport_tag {
        let normalized = tag.trim().to_lowercase();
        if !normalized.is_empty() {
            return Some(normalized);
        }
    }
    let haystack = format!(
        "{} {}",
        raw.title.to_lowercase(),
        raw.description.as_deref().unwrap_or("").to_lowercase()
    );
    SPORT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| haystack.contains(kw)))
        .map(|(sport, _)| sport.to_string())
}

/// Extract "A vs B" / "A v B" / "A to beat B" team strings from a market
/// title. Returns `(team_a, team_b)` in title order; callers that need
/// home/away semantics resolve that separately via the sports-data match.
pub fn extract_teams(title: &str) -> Option<(String, String)> {
    for sep in [" vs. ", " vs ", " v. ", " v ", " to beat "] {
        if let Some(idx) = title.to_lowercase().find(sep) {
            let a = title[..idx].trim();
            let b_start = idx + sep.len();
            // Cut the trailing clause ("...Winner", "...Moneyline") at the
            // first separator so `b` stays just the team name.
            let rest = &title[b_start..];
            let b = rest
                .split(|c: char| c == ':' || c == '-')
                .next()
                .unwrap_or(rest)
                .trim();
            if !a.is_empty() && !b.is_empty() {
                return Some((a.to_string(), b.to_string()));
            }
        }
    }
    None
}

fn spread_pct(raw: &RawCandidateMarket) -> f64 {
    match (raw.best_bid, raw.best_ask) {
        (Some(bid), Some(ask)) if ask > Decimal::ZERO => {
            let spread = (ask - bid).max(Decimal::ZERO);
            let mid = (ask + bid) / Decimal::from(2);
            if mid > Decimal::ZERO {
                (spread / mid * Decimal::from(100))
                    .to_string()
                    .parse::<f64>()
                    .unwrap_or(100.0)
            } else {
                100.0
            }
        }
        _ => 100.0,
    }
}

/// Classify, extract, filter, and rank candidate markets from one exchange
/// pass. Output is sorted by liquidity descending, per 4.C.
pub fn classify_and_filter(
    raw_markets: Vec<RawCandidateMarket>,
    now: DateTime<Utc>,
    min_liquidity: Decimal,
    min_volume: Decimal,
    max_spread_pct: f64,
    hours_ahead: Option<i64>,
) -> Vec<DiscoveredMarket> {
    let mut out: Vec<DiscoveredMarket> = raw_markets
        .into_iter()
        .filter_map(|raw| {
            let sport = classify_sport(&raw);
            let spread = spread_pct(&raw);
            let extracted_teams = extract_teams(&raw.title);
            let discovered = DiscoveredMarket {
                exchange: raw.exchange,
                market_id: raw.market_id.clone(),
                title: raw.title.clone(),
                description: raw.description.clone(),
                sport,
                extracted_teams,
                end_time: raw.end_time,
                liquidity: raw.liquidity,
                volume_24h: raw.volume_24h,
                yes_price: raw.yes_price,
                no_price: raw.no_price,
                spread_pct: spread,
                status_open: raw.status_open,
            };
            discovered
                .passes_filters(now, min_liquidity, min_volume, max_spread_pct, hours_ahead)
                .then_some(discovered)
        })
        .collect();

    out.sort_by(|a, b| b.liquidity.cmp(&a.liquidity));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(title: &str, liquidity: Decimal) -> RawCandidateMarket {
        RawCandidateMarket {
            exchange: ExchangeKind::Polymarket,
            market_id: "m".into(),
            title: title.into(),
            description: None,
            explicit_sport_tag: None,
            end_time: Utc::now() + chrono::Duration::hours(2),
            liquidity,
            volume_24h: dec!(5000),
            yes_price: dec!(0.5),
            no_price: dec!(0.5),
            best_bid: Some(dec!(0.49)),
            best_ask: Some(dec!(0.51)),
            status_open: true,
        }
    }

    #[test]
    fn classifies_sport_from_keywords() {
        let r = raw("Lakers vs Celtics: Who wins?", dec!(1000));
        assert_eq!(classify_sport(&r), Some("nba".to_string()));
    }

    #[test]
    fn explicit_tag_wins_over_keywords() {
        let mut r = raw("Lakers vs Celtics", dec!(1000));
        r.explicit_sport_tag = Some("NHL".into());
        assert_eq!(classify_sport(&r), Some("nhl".to_string()));
    }

    #[test]
    fn extracts_teams_from_vs_pattern() {
        let (a, b) = extract_teams("Los Angeles Lakers vs Boston Celtics: Winner").unwrap();
        assert_eq!(a, "Los Angeles Lakers");
        assert_eq!(b, "Boston Celtics");
    }

    #[test]
    fn extracts_teams_from_to_beat_pattern() {
        let (a, b) = extract_teams("Chiefs to beat Eagles").unwrap();
        assert_eq!(a, "Chiefs");
        assert_eq!(b, "Eagles");
    }

    #[test]
    fn sorted_by_liquidity_descending() {
        let markets = vec![raw("Lakers vs Celtics", dec!(1000)), raw("Chiefs vs Eagles", dec!(5000))];
        let out = classify_and_filter(markets, Utc::now(), dec!(100), dec!(100), 5.0, None);
        assert_eq!(out.len(), 2);
        assert!(out[0].liquidity >= out[1].liquidity);
    }

    #[test]
    fn closed_markets_are_filtered_out() {
        let mut m = raw("Lakers vs Celtics", dec!(1000));
        m.status_open = false;
        let out = classify_and_filter(vec![m], Utc::now(), dec!(100), dec!(100), 5.0, None);
        assert!(out.is_empty());
    }

    #[test]
    fn classify_and_filter_carries_extracted_teams_onto_discovered_market() {
        let m = raw("Lakers vs Celtics: Winner", dec!(1000));
        let out = classify_and_filter(vec![m], Utc::now(), dec!(100), dec!(100), 5.0, None);
        assert_eq!(
            out[0].extracted_teams,
            Some(("Lakers".to_string(), "Celtics".to_string()))
        );
    }

    #[test]
    fn classify_and_filter_leaves_extracted_teams_none_when_title_has_no_separator() {
        let m = raw("Who wins the championship?", dec!(1000));
        let out = classify_and_filter(vec![m], Utc::now(), dec!(100), dec!(100), 5.0, None);
        assert_eq!(out[0].extracted_teams, None);
    }
}
