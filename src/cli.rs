//! Operator CLI (ambient stack, 2A): `clap` derive subcommands mirroring
//! the flat admin verbs of section 6. Each subcommand maps onto exactly one
//! [`crate::engine::EngineScope`]/[`crate::persistence::PersistencePort`]
//! call; this module owns no trading logic.

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Exit codes for the CLI wrapper (section 6).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const MISCONFIGURED: i32 = 2;
    pub const UNREACHABLE_EXCHANGE: i32 = 3;
    pub const KILL_SWITCH_LATCHED: i32 = 4;
}

#[derive(Parser, Debug)]
#[command(name = "ploy")]
#[command(author, version, about = "Sports-betting execution engine operator CLI", long_about = None)]
pub struct Cli {
    /// Config file or directory path
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a user's engine (requires active accounts, valid allocations,
    /// and a cleared kill switch).
    Start {
        #[arg(long)]
        user: Uuid,
    },

    /// Stop a user's engine: cancel all loops, leave in-flight orders to
    /// complete.
    Stop {
        #[arg(long)]
        user: Uuid,
    },

    /// Graceful drain: suppress new entries, allow monitor-driven exits.
    Drain {
        #[arg(long)]
        user: Uuid,
    },

    /// Clear the kill switch latch (requires balance currently above
    /// threshold).
    ResetKillSwitch {
        #[arg(long)]
        user: Uuid,
    },

    /// Set per-account allocation percentages; must sum to 100 ± 0.01.
    SetAllocations {
        #[arg(long)]
        user: Uuid,
        /// `account_id:pct` pairs, e.g. `11111111-...:60 22222222-...:40`
        #[arg(long = "allocation", value_parser = parse_allocation, num_args = 1..)]
        allocations: Vec<(Uuid, rust_decimal::Decimal)>,
    },

    /// Mark one account as the user's primary account.
    SetPrimary {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        account: Uuid,
    },

    /// Toggle dry-run mode process-wide.
    EnableDryRun {
        #[arg(long)]
        enabled: bool,
    },

    /// Operator-facing status read: state, tracked games, open positions,
    /// daily P&L, last three errors.
    Status {
        #[arg(long)]
        user: Uuid,
    },

    /// Total balance and per-account allocation/primary detail, plus
    /// whether allocations currently sum to 100% (2B).
    AccountSummary {
        #[arg(long)]
        user: Uuid,
    },

    /// Grouped count of positions by sync status (2B).
    SyncStatus {
        #[arg(long)]
        user: Uuid,
    },

    /// Positions whose fill status is still pending/partial, so an
    /// operator can see what the engine will resume on restart (2B).
    PendingConfirmations {
        #[arg(long)]
        user: Uuid,
    },
}

fn parse_allocation(raw: &str) -> Result<(Uuid, rust_decimal::Decimal), String> {
    let (id, pct) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `account_id:pct`, got `{raw}`"))?;
    let account_id = id
        .parse::<Uuid>()
        .map_err(|e| format!("invalid account id `{id}`: {e}"))?;
    let pct = pct
        .parse::<rust_decimal::Decimal>()
        .map_err(|e| format!("invalid percentage `{pct}`: {e}"))?;
    Ok((account_id, pct))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_allocation_accepts_id_and_pct() {
        let id = Uuid::new_v4();
        let raw = format!("{id}:60.5");
        let (parsed_id, pct) = parse_allocation(&raw).expect("should parse");
        assert_eq!(parsed_id, id);
        assert_eq!(pct, dec!(60.5));
    }

    #[test]
    fn parse_allocation_rejects_missing_colon() {
        assert!(parse_allocation("not-a-pair").is_err());
    }
}
