//! Fractional Kelly position sizing with streak governance and per-account
//! allocation splitting (component F).

use rust_decimal::Decimal;

use crate::domain::{Account, SportConfig};

/// Historical performance fed into the Kelly blend. `None` when the sport
/// has not yet accumulated `min_kelly_sample_size` settled trades.
#[derive(Debug, Clone, Copy)]
pub struct KellyHistory {
    pub sample_size: u32,
    pub historical_win_rate: f64,
}

/// `f* = (b*p - q) / b`, clamped to `[0, 1]`. `b` is the win/loss amount
/// ratio (payout odds), `p` the effective win probability.
pub fn kelly_fraction(b: f64, p: f64) -> f64 {
    if b <= 0.0 {
        return 0.0;
    }
    let q = 1.0 - p;
    ((b * p - q) / b).clamp(0.0, 1.0)
}

/// Full sizing pipeline for one sport/position, in USD, before allocation
/// split. `win_probability` is the effective `p` used by the caller (e.g.
/// from the confidence scorer or a calibrated model); `payout_ratio` is `b`.
pub fn size_position_usd(
    config: &SportConfig,
    win_probability: f64,
    payout_ratio: f64,
    history: Option<KellyHistory>,
    streak_multiplier: f64,
) -> Decimal {
    if !config.kelly_enabled {
        return (config.position_size_usd * decimal_from_f64(streak_multiplier)).round_dp(2);
    }

    let raw = kelly_fraction(payout_ratio, win_probability);
    let blended = match history {
        Some(h) if h.sample_size >= config.min_kelly_sample_size => {
            let weight = (h.sample_size as f64 / 100.0).min(0.5);
            raw * (1.0 - weight) + h.historical_win_rate * weight
        }
        _ => raw,
    };

    let fractional = blended * config.kelly_fraction;
    let mut usd = decimal_from_f64(fractional) * decimal_from_f64(streak_multiplier)
        * kelly_base_bankroll(config);

    if usd < config.kelly_min_position_usd {
        usd = config.kelly_min_position_usd;
    }
    if usd > config.kelly_max_position_usd && config.kelly_max_position_usd > Decimal::ZERO {
        usd = config.kelly_max_position_usd;
    }
    usd.round_dp(2)
}

/// Kelly sizes a fraction of a notional bankroll; `SportConfig` carries the
/// flat per-position size as the base to scale against rather than a
/// separate bankroll field, consistent with 4.F ("base size from
/// SportConfig").
fn kelly_base_bankroll(config: &SportConfig) -> Decimal {
    config.position_size_usd
}

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::try_from(v).unwrap_or(Decimal::ZERO)
}

/// Allocation of a decided USD size across ordered, active accounts. The
/// first `n-1` accounts get `round(size * allocation_pct / 100)`; the last
/// account absorbs the remainder so totals always reconcile exactly (4.F,
/// scenario 6).
pub fn split_by_allocation(total: Decimal, accounts: &[Account]) -> Vec<(uuid::Uuid, Decimal)> {
    if accounts.is_empty() || total <= Decimal::ZERO {
        return Vec::new();
    }
    let ordered = Account::ordered_for_routing(accounts.to_vec());
    let mut out = Vec::with_capacity(ordered.len());
    let mut allocated = Decimal::ZERO;

    for account in ordered.iter().take(ordered.len().saturating_sub(1)) {
        let share = (total * account.allocation_pct / Decimal::from(100)).round_dp(2);
        allocated += share;
        out.push((account.id, share));
    }

    if let Some(last) = ordered.last() {
        out.push((last.id, (total - allocated).max(Decimal::ZERO)));
    }
    out
}

/// Whole-contract version of [`split_by_allocation`] for the sizer's final
/// output — contracts must be integral.
pub fn split_contracts_by_allocation(total_contracts: u64, accounts: &[Account]) -> Vec<(uuid::Uuid, u64)> {
    if accounts.is_empty() || total_contracts == 0 {
        return Vec::new();
    }
    let ordered = Account::ordered_for_routing(accounts.to_vec());
    let mut out = Vec::with_capacity(ordered.len());
    let mut allocated: u64 = 0;

    for account in ordered.iter().take(ordered.len().saturating_sub(1)) {
        let pct = account.allocation_pct.to_string().parse::<f64>().unwrap_or(0.0);
        let share = ((total_contracts as f64) * pct / 100.0).round() as u64;
        allocated += share;
        out.push((account.id, share));
    }

    if let Some(last) = ordered.last() {
        out.push((last.id, total_contracts.saturating_sub(allocated)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn config(kelly_enabled: bool) -> SportConfig {
        SportConfig {
            user_id: Uuid::new_v4(),
            sport: "nba".into(),
            enabled: true,
            entry_threshold_drop_pct: 15.0,
            entry_threshold_absolute: dec!(0.50),
            take_profit_pct: 20.0,
            stop_loss_pct: 10.0,
            exit_before_secs: 60,
            position_size_usd: dec!(50),
            max_concurrent_positions_per_game: 1,
            max_concurrent_positions_total: 10,
            min_time_remaining_secs: 0,
            min_confidence: Some(0.60),
            kelly_enabled,
            kelly_fraction: 0.25,
            kelly_min_position_usd: dec!(10),
            kelly_max_position_usd: dec!(200),
            min_kelly_sample_size: 20,
        }
    }

    fn account(id: Uuid, pct: Decimal, primary: bool, name: &str) -> Account {
        Account {
            id,
            user_id: Uuid::new_v4(),
            platform: crate::exchange::ExchangeKind::Kalshi,
            display_name: name.to_string(),
            credentials: vec![],
            is_primary: primary,
            is_active: true,
            allocation_pct: pct,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn kelly_at_p_half_b_one_is_zero() {
        assert_eq!(kelly_fraction(1.0, 0.5), 0.0);
    }

    #[test]
    fn kelly_scales_with_edge() {
        let f = kelly_fraction(1.0, 0.6);
        assert!((f - 0.2).abs() < 1e-9);
    }

    #[test]
    fn kelly_disabled_uses_flat_size() {
        let size = size_position_usd(&config(false), 0.6, 1.0, None, 1.0);
        assert_eq!(size, dec!(50));
    }

    #[test]
    fn streak_multiplier_reduces_flat_size() {
        let size = size_position_usd(&config(false), 0.6, 1.0, None, 0.5);
        assert_eq!(size, dec!(25));
    }

    #[test]
    fn kelly_below_min_sample_ignores_history() {
        let history = Some(KellyHistory {
            sample_size: 5,
            historical_win_rate: 0.9,
        });
        let with_history = size_position_usd(&config(true), 0.6, 1.0, history, 1.0);
        let without_history = size_position_usd(&config(true), 0.6, 1.0, None, 1.0);
        assert_eq!(with_history, without_history);
    }

    #[test]
    fn allocation_split_60_40_of_ten_contracts() {
        let a = account(Uuid::new_v4(), dec!(60), true, "a");
        let b = account(Uuid::new_v4(), dec!(40), false, "b");
        let split = split_contracts_by_allocation(10, &[a.clone(), b.clone()]);
        let a_share = split.iter().find(|(id, _)| *id == a.id).unwrap().1;
        let b_share = split.iter().find(|(id, _)| *id == b.id).unwrap().1;
        assert_eq!(a_share, 6);
        assert_eq!(b_share, 4);
    }

    #[test]
    fn allocation_split_three_way_remainder_to_last() {
        let a = account(Uuid::new_v4(), dec!(33), true, "a");
        let b = account(Uuid::new_v4(), dec!(33), false, "b");
        let c = account(Uuid::new_v4(), dec!(34), false, "c");
        let split = split_contracts_by_allocation(10, &[a.clone(), b.clone(), c.clone()]);
        let total: u64 = split.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 10);
        // primary 'a' is ordered first, then 'b', then 'c' absorbs remainder.
        let c_share = split.iter().find(|(id, _)| *id == c.id).unwrap().1;
        assert_eq!(c_share, 4);
    }
}
