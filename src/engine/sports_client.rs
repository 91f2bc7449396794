//! Generalized live-scoreboard poller (component B).
//!
//! Adapts the teacher's NBA-only `EspnClient` into a table-driven client
//! over several ESPN scoreboard endpoints, one per sport, with per-sport
//! phase accounting (quarters, innings, sets, rounds, holes) instead of the
//! hardcoded 4x12-minute NBA clock.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum GameState {
    Pre,
    Live,
    Finished,
    Unknown,
}

/// Per-sport phase shape: how many phases make up a full game/match, and how
/// many minutes (or equivalent time unit) each phase runs, when the sport
/// has a clock at all.
#[derive(Debug, Clone, Copy)]
pub struct PhaseShape {
    pub total_phases: u32,
    pub minutes_per_phase: f64,
}

/// Phase accounting for sports with a running clock. Sports without one
/// (golf holes, tennis sets) report `time_remaining_secs = None` and rely on
/// `current_phase`/`total_phases` alone for the confidence scorer's
/// game-phase factor.
fn phase_shape(sport: &str) -> PhaseShape {
    match sport {
        "nba" => PhaseShape { total_phases: 4, minutes_per_phase: 12.0 },
        "nfl" => PhaseShape { total_phases: 4, minutes_per_phase: 15.0 },
        "nhl" => PhaseShape { total_phases: 3, minutes_per_phase: 20.0 },
        "mlb" => PhaseShape { total_phases: 9, minutes_per_phase: 0.0 },
        "soccer" => PhaseShape { total_phases: 2, minutes_per_phase: 45.0 },
        "golf" => PhaseShape { total_phases: 18, minutes_per_phase: 0.0 },
        "tennis" => PhaseShape { total_phases: 3, minutes_per_phase: 0.0 },
        "ufc" => PhaseShape { total_phases: 5, minutes_per_phase: 5.0 },
        _ => PhaseShape { total_phases: 1, minutes_per_phase: 0.0 },
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LiveEvent {
    pub external_event_id: String,
    pub sport: String,
    pub home_team: String,
    pub away_team: String,
    pub home_abbrev: String,
    pub away_abbrev: String,
    pub home_score: i32,
    pub away_score: i32,
    pub current_phase: u32,
    pub total_phases: u32,
    pub clock: String,
    /// `None` for clockless sports (golf, tennis) — the confidence scorer's
    /// time-remaining factor falls back to the game-phase factor alone.
    pub time_remaining_secs: Option<i64>,
    pub state: GameState,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl LiveEvent {
    pub fn home_diff(&self) -> i32 {
        self.home_score - self.away_score
    }
}

#[derive(Debug, Deserialize)]
struct EspnResponse {
    events: Vec<EspnEvent>,
}

#[derive(Debug, Deserialize)]
struct EspnEvent {
    id: String,
    date: Option<String>,
    competitions: Vec<EspnCompetition>,
}

#[derive(Debug, Deserialize)]
struct EspnCompetition {
    competitors: Vec<EspnCompetitor>,
    status: EspnStatus,
}

#[derive(Debug, Deserialize)]
struct EspnCompetitor {
    team: EspnTeam,
    #[serde(rename = "homeAway")]
    home_away: String,
    score: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EspnTeam {
    abbreviation: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct EspnStatus {
    period: u32,
    #[serde(rename = "displayClock")]
    display_clock: String,
    #[serde(rename = "type")]
    status_type: EspnStatusType,
}

#[derive(Debug, Deserialize)]
struct EspnStatusType {
    state: String,
}

/// ESPN scoreboard endpoint per sport. Callers register only the sports they
/// trade; an unconfigured sport simply isn't polled.
fn scoreboard_url(sport: &str) -> Option<&'static str> {
    Some(match sport {
        "nba" => "https://site.api.espn.com/apis/site/v2/sports/basketball/nba/scoreboard",
        "nfl" => "https://site.api.espn.com/apis/site/v2/sports/football/nfl/scoreboard",
        "mlb" => "https://site.api.espn.com/apis/site/v2/sports/baseball/mlb/scoreboard",
        "nhl" => "https://site.api.espn.com/apis/site/v2/sports/hockey/nhl/scoreboard",
        "soccer" => "https://site.api.espn.com/apis/site/v2/sports/soccer/eng.1/scoreboard",
        _ => return None,
    })
}

pub struct SportsDataClient {
    http: reqwest::Client,
}

impl Default for SportsDataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SportsDataClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }

    /// Poll one sport's scoreboard. Backs off on 4xx/5xx by returning an
    /// error for the caller's retry policy to handle; this client does not
    /// retain state across calls.
    pub async fn fetch_live_events(&self, sport: &str) -> Result<Vec<LiveEvent>> {
        let url = match scoreboard_url(sport) {
            Some(u) => u,
            None => return Ok(Vec::new()),
        };

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("scoreboard request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("scoreboard returned status {}", resp.status());
        }

        let data: EspnResponse = resp.json().await.context("scoreboard JSON parse failed")?;

        let mut events = Vec::new();
        for event in &data.events {
            if let Some(live) = Self::parse_event(event, sport) {
                events.push(live);
            }
        }
        debug!(sport, count = events.len(), "fetched scoreboard events");
        Ok(events)
    }

    pub fn live_only(events: &[LiveEvent]) -> Vec<&LiveEvent> {
        events.iter().filter(|e| e.state == GameState::Live).collect()
    }

    fn parse_event(event: &EspnEvent, sport: &str) -> Option<LiveEvent> {
        let comp = event.competitions.first()?;
        if comp.competitors.len() < 2 {
            return None;
        }
        let home = comp.competitors.iter().find(|c| c.home_away == "home")?;
        let away = comp.competitors.iter().find(|c| c.home_away == "away")?;

        let home_score = home.score.as_deref().unwrap_or("0").parse().unwrap_or(0);
        let away_score = away.score.as_deref().unwrap_or("0").parse().unwrap_or(0);

        let state = match comp.status.status_type.state.as_str() {
            "in" => GameState::Live,
            "post" => GameState::Finished,
            "pre" => GameState::Pre,
            _ => GameState::Unknown,
        };

        let shape = phase_shape(sport);
        let period = comp.status.period;
        let time_remaining_secs = if shape.minutes_per_phase > 0.0 {
            Some(Self::time_remaining_secs(period, &comp.status.display_clock, shape))
        } else {
            None
        };

        let start_time = event
            .date
            .as_ref()
            .and_then(|d| chrono::DateTime::parse_from_rfc3339(d).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        Some(LiveEvent {
            external_event_id: event.id.clone(),
            sport: sport.to_string(),
            home_team: home.team.display_name.clone(),
            away_team: away.team.display_name.clone(),
            home_abbrev: home.team.abbreviation.clone(),
            away_abbrev: away.team.abbreviation.clone(),
            home_score,
            away_score,
            current_phase: period,
            total_phases: shape.total_phases,
            clock: comp.status.display_clock.clone(),
            time_remaining_secs,
            state,
            start_time,
        })
    }

    fn time_remaining_secs(period: u32, clock: &str, shape: PhaseShape) -> i64 {
        let clock_mins = Self::parse_clock(clock);
        let phases_left = if period <= shape.total_phases {
            (shape.total_phases - period) as f64
        } else {
            0.0
        };
        ((phases_left * shape.minutes_per_phase + clock_mins) * 60.0) as i64
    }

    fn parse_clock(clock: &str) -> f64 {
        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() == 2 {
            let mins: f64 = parts[0].parse().unwrap_or(0.0);
            let secs: f64 = parts[1].parse().unwrap_or(0.0);
            mins + secs / 60.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nba_time_remaining_matches_four_quarter_clock() {
        let shape = phase_shape("nba");
        let tr = SportsDataClient::time_remaining_secs(3, "5:42", shape);
        assert!((tr - 1062).abs() < 15);
    }

    #[test]
    fn nfl_phase_shape_has_four_fifteen_minute_quarters() {
        let shape = phase_shape("nfl");
        assert_eq!(shape.total_phases, 4);
        assert_eq!(shape.minutes_per_phase, 15.0);
    }

    #[test]
    fn clockless_sports_report_no_time_remaining() {
        assert_eq!(phase_shape("golf").minutes_per_phase, 0.0);
    }

    #[test]
    fn parse_espn_json_produces_live_event() {
        let json = r#"{
            "events": [{
                "id": "401584701",
                "date": "2026-01-15T00:00Z",
                "competitions": [{
                    "competitors": [
                        {"team": {"abbreviation": "BOS", "displayName": "Boston Celtics"}, "homeAway": "home", "score": "89"},
                        {"team": {"abbreviation": "LAL", "displayName": "Los Angeles Lakers"}, "homeAway": "away", "score": "82"}
                    ],
                    "status": {"period": 3, "displayClock": "5:42", "type": {"state": "in"}}
                }]
            }]
        }"#;
        let resp: EspnResponse = serde_json::from_str(json).unwrap();
        let event = SportsDataClient::parse_event(&resp.events[0], "nba").unwrap();
        assert_eq!(event.home_abbrev, "BOS");
        assert_eq!(event.away_abbrev, "LAL");
        assert_eq!(event.state, GameState::Live);
        assert_eq!(event.home_diff(), 7);
    }
}
