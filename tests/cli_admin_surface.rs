use clap::Parser;
use ploy::cli::{Cli, Commands};
use uuid::Uuid;

fn parse(args: &[&str]) -> Cli {
    let mut full = vec!["ploy"];
    full.extend_from_slice(args);
    Cli::try_parse_from(full).expect("should parse")
}

#[test]
fn start_requires_a_user_id() {
    let err = Cli::try_parse_from(["ploy", "start"]).unwrap_err();
    assert!(err.to_string().contains("user"));
}

#[test]
fn start_parses_user_uuid() {
    let user = Uuid::new_v4();
    let cli = parse(&["start", "--user", &user.to_string()]);
    match cli.command {
        Commands::Start { user: parsed } => assert_eq!(parsed, user),
        other => panic!("expected Start, got {other:?}"),
    }
}

#[test]
fn set_allocations_parses_repeated_pairs() {
    let user = Uuid::new_v4();
    let a1 = Uuid::new_v4();
    let a2 = Uuid::new_v4();
    let cli = parse(&[
        "set-allocations",
        "--user",
        &user.to_string(),
        "--allocation",
        &format!("{a1}:60"),
        "--allocation",
        &format!("{a2}:40"),
    ]);
    match cli.command {
        Commands::SetAllocations { user: u, allocations } => {
            assert_eq!(u, user);
            assert_eq!(allocations.len(), 2);
            assert_eq!(allocations[0].0, a1);
            assert_eq!(allocations[1].0, a2);
        }
        other => panic!("expected SetAllocations, got {other:?}"),
    }
}

#[test]
fn set_allocations_rejects_malformed_pair() {
    let user = Uuid::new_v4();
    let err = Cli::try_parse_from([
        "ploy",
        "set-allocations",
        "--user",
        &user.to_string(),
        "--allocation",
        "not-a-pair",
    ])
    .unwrap_err();
    assert!(err.to_string().contains("account_id:pct"));
}

#[test]
fn enable_dry_run_parses_boolean_flag() {
    let cli = parse(&["enable-dry-run", "--enabled", "true"]);
    assert!(matches!(cli.command, Commands::EnableDryRun { enabled: true }));
}

#[test]
fn read_only_verbs_parse_with_just_a_user_id() {
    let user = Uuid::new_v4();
    for verb in ["status", "account-summary", "sync-status", "pending-confirmations"] {
        let cli = parse(&[verb, "--user", &user.to_string()]);
        assert!(
            matches!(
                cli.command,
                Commands::Status { .. }
                    | Commands::AccountSummary { .. }
                    | Commands::SyncStatus { .. }
                    | Commands::PendingConfirmations { .. }
            ),
            "verb {verb} failed to parse"
        );
    }
}
