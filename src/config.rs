//! Layered configuration (ambient stack, 2A): `File` (TOML) →
//! `Environment` (prefixed `PLOY_`) → explicit overrides, mirroring the
//! teacher's `config` crate usage. Sections: `database`, `logging`,
//! `health_port`, `global` (GlobalSettings defaults), `sports` (per-sport
//! `SportConfig` defaults, keyed by sport name), `exchanges` (per-exchange
//! base URLs/timeouts), `dry_run`.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health check listener port (0/absent disables the server).
    #[serde(default)]
    pub health_port: Option<u16>,
    #[serde(default)]
    pub dry_run: bool,
    /// Engine-wide defaults applied to every newly onboarded user's
    /// `GlobalSettings` row; per-user rows are mutable thereafter via the
    /// admin surface and are not re-read from this file.
    pub global: GlobalDefaultsConfig,
    /// Per-sport `SportConfig` defaults, keyed by sport name (e.g. "nba",
    /// "nfl"). A sport absent from this map is not onboarded automatically;
    /// per-user overrides are managed via the persistence port.
    #[serde(default)]
    pub sports: HashMap<String, SportDefaultsConfig>,
    /// Per-exchange connection settings.
    pub exchanges: ExchangesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Engine-wide defaults for [`crate::domain::GlobalSettings`] (section 3).
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalDefaultsConfig {
    #[serde(default = "default_true")]
    pub bot_enabled: bool,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss_usd: Decimal,
    #[serde(default)]
    pub streak_reduction_enabled: bool,
    #[serde(default = "default_streak_reduction_pct")]
    pub streak_reduction_pct_per_loss: f64,
    #[serde(default = "default_min_balance")]
    pub min_balance_threshold_usd: Decimal,
    #[serde(default = "default_balance_check_interval")]
    pub balance_check_interval_secs: u64,
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_max_daily_loss() -> Decimal {
    Decimal::new(500, 0)
}
fn default_streak_reduction_pct() -> f64 {
    0.1
}
fn default_min_balance() -> Decimal {
    Decimal::new(100, 0)
}
fn default_balance_check_interval() -> u64 {
    30
}

impl Default for GlobalDefaultsConfig {
    fn default() -> Self {
        Self {
            bot_enabled: default_true(),
            max_daily_loss_usd: default_max_daily_loss(),
            streak_reduction_enabled: false,
            streak_reduction_pct_per_loss: default_streak_reduction_pct(),
            min_balance_threshold_usd: default_min_balance(),
            balance_check_interval_secs: default_balance_check_interval(),
            notification_webhook_url: None,
        }
    }
}

/// Per-sport defaults for [`crate::domain::SportConfig`] (section 3 / 4.E-F).
#[derive(Debug, Clone, Deserialize)]
pub struct SportDefaultsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_entry_threshold_drop_pct")]
    pub entry_threshold_drop_pct: f64,
    #[serde(default = "default_entry_threshold_absolute")]
    pub entry_threshold_absolute: Decimal,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_exit_before_secs")]
    pub exit_before_secs: i64,
    #[serde(default = "default_position_size_usd")]
    pub position_size_usd: Decimal,
    #[serde(default = "default_max_positions_per_game")]
    pub max_concurrent_positions_per_game: u32,
    #[serde(default = "default_max_positions_total")]
    pub max_concurrent_positions_total: u32,
    #[serde(default = "default_min_time_remaining_secs")]
    pub min_time_remaining_secs: i64,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub kelly_enabled: bool,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_kelly_min_position")]
    pub kelly_min_position_usd: Decimal,
    #[serde(default = "default_kelly_max_position")]
    pub kelly_max_position_usd: Decimal,
    #[serde(default = "default_min_kelly_sample_size")]
    pub min_kelly_sample_size: u32,
}

fn default_entry_threshold_drop_pct() -> f64 {
    15.0
}
fn default_entry_threshold_absolute() -> Decimal {
    Decimal::new(50, 2) // 0.50
}
fn default_take_profit_pct() -> f64 {
    20.0
}
fn default_stop_loss_pct() -> f64 {
    10.0
}
fn default_exit_before_secs() -> i64 {
    60
}
fn default_position_size_usd() -> Decimal {
    Decimal::new(50, 0)
}
fn default_max_positions_per_game() -> u32 {
    1
}
fn default_max_positions_total() -> u32 {
    5
}
fn default_min_time_remaining_secs() -> i64 {
    120
}
fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_kelly_min_position() -> Decimal {
    Decimal::new(10, 0)
}
fn default_kelly_max_position() -> Decimal {
    Decimal::new(200, 0)
}
fn default_min_kelly_sample_size() -> u32 {
    20
}

impl Default for SportDefaultsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entry_threshold_drop_pct: default_entry_threshold_drop_pct(),
            entry_threshold_absolute: default_entry_threshold_absolute(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            exit_before_secs: default_exit_before_secs(),
            position_size_usd: default_position_size_usd(),
            max_concurrent_positions_per_game: default_max_positions_per_game(),
            max_concurrent_positions_total: default_max_positions_total(),
            min_time_remaining_secs: default_min_time_remaining_secs(),
            min_confidence: None,
            kelly_enabled: false,
            kelly_fraction: default_kelly_fraction(),
            kelly_min_position_usd: default_kelly_min_position(),
            kelly_max_position_usd: default_kelly_max_position(),
            min_kelly_sample_size: default_min_kelly_sample_size(),
        }
    }
}

impl SportDefaultsConfig {
    /// Collect validation problems (empty = valid), in the teacher's
    /// `validate(&self) -> Vec<String>` style.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.entry_threshold_drop_pct <= 0.0 {
            errors.push("entry_threshold_drop_pct must be > 0".to_string());
        }
        if self.entry_threshold_absolute <= Decimal::ZERO || self.entry_threshold_absolute >= Decimal::ONE {
            errors.push("entry_threshold_absolute must be in (0, 1)".to_string());
        }
        if self.take_profit_pct <= 0.0 {
            errors.push("take_profit_pct must be > 0".to_string());
        }
        if self.stop_loss_pct <= 0.0 {
            errors.push("stop_loss_pct must be > 0".to_string());
        }
        if self.position_size_usd <= Decimal::ZERO {
            errors.push("position_size_usd must be > 0".to_string());
        }
        if self.kelly_fraction <= 0.0 || self.kelly_fraction > 1.0 {
            errors.push("kelly_fraction must be in (0, 1]".to_string());
        }
        errors
    }
}

/// Per-exchange base URL and timeout configuration (component A).
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangesConfig {
    #[serde(default)]
    pub polymarket: PolymarketExchangeConfig,
    #[serde(default)]
    pub kalshi: KalshiExchangeConfig,
    /// Unauthenticated ESPN-style scoreboard endpoint (component B).
    #[serde(default = "default_scoreboard_base_url")]
    pub sports_scoreboard_base_url: String,
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            polymarket: PolymarketExchangeConfig::default(),
            kalshi: KalshiExchangeConfig::default(),
            sports_scoreboard_base_url: default_scoreboard_base_url(),
        }
    }
}

fn default_scoreboard_base_url() -> String {
    "https://site.api.espn.com/apis/site/v2/sports".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolymarketExchangeConfig {
    #[serde(default = "default_polymarket_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_polymarket_gamma_url")]
    pub gamma_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_polymarket_rest_url() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_polymarket_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for PolymarketExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_polymarket_rest_url(),
            gamma_url: default_polymarket_gamma_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Kalshi (CLOB-REST) exchange credentials and connection settings. Key
/// material may also be supplied via `KALSHI_KEY_ID` /
/// `KALSHI_PRIVATE_KEY_PEM` so it need not live in a config file on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct KalshiExchangeConfig {
    #[serde(default = "default_kalshi_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub private_key_pem: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_kalshi_base_url() -> String {
    "https://api.elections.kalshi.com/trade-api/v2".to_string()
}

impl Default for KalshiExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_kalshi_base_url(),
            key_id: None,
            private_key_pem: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/default.toml` (+ environment
    /// overlay, + env-specific file) or a single TOML file path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_path = config_dir.as_ref();

        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("dry_run", true)?
            .set_default("database.max_connections", 5)?
            .set_default("health_port", 8080)?;

        if config_path.is_file() {
            builder = builder.add_source(File::from(config_path).required(true));
        } else {
            builder = builder
                .add_source(File::from(config_path.join("default.toml")).required(false))
                .add_source(
                    File::from(config_path.join(
                        std::env::var("PLOY_ENV").unwrap_or_else(|_| "development".to_string()),
                    ))
                    .required(false),
                );
        }

        builder = builder.add_source(
            Environment::with_prefix("PLOY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Self = builder.build()?.try_deserialize()?;
        Ok(cfg)
    }

    /// Collect validation problems across every configured section (empty =
    /// valid), in the teacher's `validate` style.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.global.streak_reduction_pct_per_loss < 0.0
            || self.global.streak_reduction_pct_per_loss > 1.0
        {
            errors.push("global.streak_reduction_pct_per_loss must be in [0, 1]".to_string());
        }
        if self.global.min_balance_threshold_usd < Decimal::ZERO {
            errors.push("global.min_balance_threshold_usd must be >= 0".to_string());
        }
        for (sport, cfg) in &self.sports {
            for problem in cfg.validate() {
                errors.push(format!("sports.{sport}: {problem}"));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sport_defaults_validate_clean() {
        assert!(SportDefaultsConfig::default().validate().is_empty());
    }

    #[test]
    fn sport_defaults_reject_bad_entry_threshold() {
        let mut cfg = SportDefaultsConfig::default();
        cfg.entry_threshold_absolute = Decimal::new(150, 2); // 1.5
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn global_defaults_are_sane() {
        let cfg = GlobalDefaultsConfig::default();
        assert!(cfg.bot_enabled);
        assert!(cfg.min_balance_threshold_usd > Decimal::ZERO);
    }
}
