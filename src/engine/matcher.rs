//! Links a live game to a discovered market via declining-reliability
//! strategies (component D).

use crate::domain::DiscoveredMarket;

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.70;

const CONFIDENCE_ABBREVIATION: f64 = 0.90;
const CONFIDENCE_FULL_NAME: f64 = 0.85;
const CONFIDENCE_PARTIAL_NAME: f64 = 0.80;
const CONFIDENCE_TIME_WINDOW: f64 = 0.70;

/// A live game's identifying strings, independent of which sport feed
/// produced it.
#[derive(Debug, Clone)]
pub struct GameIdentity {
    pub home_team: String,
    pub home_abbrev: String,
    pub away_team: String,
    pub away_abbrev: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub market_index: usize,
    pub confidence: f64,
}

fn contains_token_boundary(haystack: &str, needle: &str) -> bool {
    if needle.trim().is_empty() {
        return false;
    }
    let haystack_lower = haystack.to_lowercase();
    let needle_lower = needle.to_lowercase();
    haystack_lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|tok| tok == needle_lower)
}

fn name_token_overlap(title: &str, team_name: &str) -> usize {
    let title_lower = title.to_lowercase();
    team_name
        .split_whitespace()
        .filter(|tok| tok.len() > 2 && title_lower.contains(&tok.to_lowercase()))
        .count()
}

fn abbreviation_match(title: &str, game: &GameIdentity) -> bool {
    contains_token_boundary(title, &game.home_abbrev) && contains_token_boundary(title, &game.away_abbrev)
}

/// True when `extracted` (one side of discovery's `"A vs B"` split, 4.C) and
/// `team_name` (the scoreboard's display name) plausibly name the same
/// team — either is a substring of the other, since the title side may be
/// an abbreviated or expanded form of the scoreboard's name.
fn names_correspond(extracted: &str, team_name: &str) -> bool {
    let extracted_lower = extracted.to_lowercase();
    let team_lower = team_name.to_lowercase();
    extracted_lower.contains(&team_lower) || team_lower.contains(&extracted_lower)
}

/// Discovery's extracted `(team_a, team_b)` pair matches the game's two
/// teams, in either order (extraction doesn't resolve home/away).
fn extracted_pair_matches(pair: &(String, String), game: &GameIdentity) -> bool {
    let (a, b) = pair;
    (names_correspond(a, &game.home_team) && names_correspond(b, &game.away_team))
        || (names_correspond(a, &game.away_team) && names_correspond(b, &game.home_team))
}

fn full_name_match(market: &DiscoveredMarket, game: &GameIdentity) -> bool {
    if let Some(pair) = &market.extracted_teams {
        if extracted_pair_matches(pair, game) {
            return true;
        }
    }
    let title_lower = market.title.to_lowercase();
    title_lower.contains(&game.home_team.to_lowercase())
        && title_lower.contains(&game.away_team.to_lowercase())
}

fn partial_name_match(market: &DiscoveredMarket, game: &GameIdentity) -> bool {
    if let Some((a, b)) = &market.extracted_teams {
        let extracted_blob = format!("{a} {b}");
        if name_token_overlap(&extracted_blob, &game.home_team) >= 2
            && name_token_overlap(&extracted_blob, &game.away_team) >= 2
        {
            return true;
        }
    }
    name_token_overlap(&market.title, &game.home_team) >= 2
        && name_token_overlap(&market.title, &game.away_team) >= 2
}

fn time_window_match(market: &DiscoveredMarket, game: &GameIdentity) -> bool {
    let diff = (market.end_time - game.start_time).num_hours().abs();
    diff <= 4 && name_token_overlap(&market.title, &game.home_team) >= 2
        && name_token_overlap(&market.title, &game.away_team) >= 2
}

/// Attempt every strategy in declining-reliability order against one
/// candidate market; returns the best confidence achieved, if any strategy
/// matched.
fn candidate_confidence(market: &DiscoveredMarket, game: &GameIdentity) -> Option<f64> {
    if abbreviation_match(&market.title, game) {
        return Some(CONFIDENCE_ABBREVIATION);
    }
    if full_name_match(market, game) {
        return Some(CONFIDENCE_FULL_NAME);
    }
    if partial_name_match(market, game) {
        return Some(CONFIDENCE_PARTIAL_NAME);
    }
    if time_window_match(market, game) {
        return Some(CONFIDENCE_TIME_WINDOW);
    }
    None
}

/// Match a single live game against a list of not-yet-locked candidate
/// markets. `already_matched` holds the indices locked by earlier games in
/// the same pass, since a market may never be matched to two different
/// games in one pass (4.D).
pub fn match_game(
    game: &GameIdentity,
    candidates: &[DiscoveredMarket],
    already_matched: &std::collections::HashSet<usize>,
    min_confidence: f64,
) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for (idx, market) in candidates.iter().enumerate() {
        if already_matched.contains(&idx) {
            continue;
        }
        if let Some(confidence) = candidate_confidence(market, game) {
            if confidence < min_confidence {
                continue;
            }
            if best.map(|b| confidence > b.confidence).unwrap_or(true) {
                best = Some(MatchResult {
                    market_index: idx,
                    confidence,
                });
            }
        }
    }
    best
}

pub fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn game() -> GameIdentity {
        GameIdentity {
            home_team: "Los Angeles Lakers".into(),
            home_abbrev: "LAL".into(),
            away_team: "Boston Celtics".into(),
            away_abbrev: "BOS".into(),
            start_time: chrono::Utc::now(),
        }
    }

    fn market(title: &str, end_hours: i64) -> DiscoveredMarket {
        DiscoveredMarket {
            exchange: crate::exchange::ExchangeKind::Polymarket,
            market_id: "m1".into(),
            title: title.into(),
            description: None,
            sport: Some("nba".into()),
            extracted_teams: super::discovery::extract_teams(title),
            end_time: chrono::Utc::now() + chrono::Duration::hours(end_hours),
            liquidity: dec!(5000),
            volume_24h: dec!(1000),
            yes_price: dec!(0.5),
            no_price: dec!(0.5),
            spread_pct: 1.0,
            status_open: true,
        }
    }

    #[test]
    fn abbreviation_match_wins_at_highest_confidence() {
        let g = game();
        let m = market("LAL vs BOS Winner", 2);
        let result = candidate_confidence(&m, &g).unwrap();
        assert_eq!(result, CONFIDENCE_ABBREVIATION);
    }

    #[test]
    fn full_name_match_without_abbreviations() {
        let g = game();
        let m = market("Los Angeles Lakers vs Boston Celtics Moneyline", 2);
        let result = candidate_confidence(&m, &g).unwrap();
        assert_eq!(result, CONFIDENCE_FULL_NAME);
    }

    #[test]
    fn no_match_below_threshold_is_rejected() {
        let g = game();
        let candidates = vec![market("Unrelated Market About Weather", 2)];
        let matched = std::collections::HashSet::new();
        assert!(match_game(&g, &candidates, &matched, DEFAULT_CONFIDENCE_THRESHOLD).is_none());
    }

    #[test]
    fn locked_market_is_never_matched_twice() {
        let g = game();
        let candidates = vec![market("LAL vs BOS Winner", 2)];
        let mut matched = std::collections::HashSet::new();
        matched.insert(0);
        assert!(match_game(&g, &candidates, &matched, DEFAULT_CONFIDENCE_THRESHOLD).is_none());
    }

    /// Discovery's extracted `"A vs B"` pair ("Lakers"/"Celtics") corresponds
    /// to the scoreboard's full display names even though neither display
    /// name appears verbatim in the title, so the plain raw-title substring
    /// check in `full_name_match`'s fallback path would miss this market.
    #[test]
    fn full_name_match_uses_extracted_teams_when_title_abbreviates_names() {
        let g = game();
        let m = market("Lakers vs Celtics: Corp Championship Night", 2);
        let result = candidate_confidence(&m, &g).unwrap();
        assert_eq!(result, CONFIDENCE_FULL_NAME);
    }
}
