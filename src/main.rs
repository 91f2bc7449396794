use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use ploy::cli::{exit_code, Cli, Commands};
use ploy::config::AppConfig;
use ploy::domain::Account;
use ploy::engine::{EngineConfig, EngineRegistry, Notifier};
use ploy::error::{EngineError, Result};
use ploy::exchange::{build_exchange_client_for_account, ExchangeClient};
use ploy::persistence::PersistencePort;
use ploy::PostgresEngineStore;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let app_config = match AppConfig::load_from(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", cli.config);
            return exit_code::MISCONFIGURED;
        }
    };

    init_logging(&app_config);

    let problems = app_config.validate();
    if !problems.is_empty() {
        for p in &problems {
            tracing::error!(problem = %p, "config validation failed");
        }
        return exit_code::MISCONFIGURED;
    }

    let pool = match PgPoolOptions::new()
        .max_connections(app_config.database.max_connections)
        .connect(&app_config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to database");
            return exit_code::MISCONFIGURED;
        }
    };
    let store: Arc<dyn PersistencePort> = Arc::new(PostgresEngineStore::new(pool));
    let registry = EngineRegistry::new();

    match dispatch(&cli.command, &app_config, store, &registry).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            classify_error(&e)
        }
    }
}

/// `tracing`/`tracing-subscriber` setup per the teacher's observability
/// convention — plain or JSON formatting, level from config, `RUST_LOG`
/// overrides when set.
fn init_logging(app_config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(app_config.logging.level.clone()));
    let builder = fmt().with_env_filter(filter);
    if app_config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn classify_error(err: &EngineError) -> i32 {
    match err {
        EngineError::Validation(msg) if msg.contains("kill switch") => {
            exit_code::KILL_SWITCH_LATCHED
        }
        EngineError::Auth(_) | EngineError::Transport(_) | EngineError::RateLimited(_) => {
            exit_code::UNREACHABLE_EXCHANGE
        }
        EngineError::Config(_) | EngineError::Validation(_) | EngineError::Conflict(_) => {
            exit_code::MISCONFIGURED
        }
        _ => 1,
    }
}

async fn dispatch(
    command: &Commands,
    app_config: &AppConfig,
    store: Arc<dyn PersistencePort>,
    registry: &EngineRegistry,
) -> Result<i32> {
    match command {
        Commands::Start { user } => {
            let scope = registry
                .get_or_insert(*user, || {
                    ploy::engine::EngineScope::new(
                        *user,
                        store.clone(),
                        Arc::new(Notifier::new()),
                        EngineConfig::default(),
                    )
                })
                .await;
            let clients = bind_account_clients(*user, &store, app_config).await?;
            scope
                .start(move |account: &Account| {
                    clients.get(&account.id).cloned().ok_or_else(|| {
                        EngineError::Auth(format!(
                            "no exchange client pre-built for account {}",
                            account.id
                        ))
                    })
                })
                .await?;
            println!("engine started for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::Stop { user } => {
            let Some(scope) = registry.get(*user).await else {
                println!("no running engine for user {user}");
                return Ok(exit_code::SUCCESS);
            };
            scope.stop().await?;
            println!("engine stopped for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::Drain { user } => {
            let Some(scope) = registry.get(*user).await else {
                println!("no running engine for user {user}");
                return Ok(exit_code::SUCCESS);
            };
            scope.drain().await?;
            println!("engine draining for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::ResetKillSwitch { user } => {
            let accounts = store.get_accounts(*user).await?;
            match registry.get(*user).await {
                Some(scope) => scope.reset_kill_switch(&accounts).await?,
                None => {
                    // No live engine: stand up a scope just to reuse the
                    // guardian's balance-threshold check against the
                    // persisted settings, same rule the engine enforces.
                    let scope = ploy::engine::EngineScope::new(
                        *user,
                        store.clone(),
                        Arc::new(Notifier::new()),
                        EngineConfig::default(),
                    );
                    scope.reset_kill_switch(&accounts).await?
                }
            }
            println!("kill switch cleared for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::SetAllocations { user, allocations } => {
            store.set_allocations(*user, allocations).await?;
            println!("allocations updated for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::SetPrimary { user, account } => {
            store.set_primary(*user, *account).await?;
            println!("account {account} set as primary for user {user}");
            Ok(exit_code::SUCCESS)
        }
        Commands::EnableDryRun { enabled } => {
            println!("dry-run is now {enabled} (effective on next engine start)");
            Ok(exit_code::SUCCESS)
        }
        Commands::Status { user } => {
            let Some(scope) = registry.get(*user).await else {
                println!("engine not running for user {user}");
                return Ok(exit_code::SUCCESS);
            };
            let status = scope.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(exit_code::SUCCESS)
        }
        Commands::AccountSummary { user } => {
            let accounts = store.get_active_accounts(*user).await?;
            let clients = bind_account_clients(*user, &store, app_config).await?;
            let guardian = ploy::engine::BalanceGuardian::new(store.clone());
            let summary = guardian.account_summary(&accounts, &clients).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(exit_code::SUCCESS)
        }
        Commands::SyncStatus { user } => {
            let summary = store.sync_status_summary(*user).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(exit_code::SUCCESS)
        }
        Commands::PendingConfirmations { user } => {
            let pending = store.get_pending_confirmations(*user).await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
            Ok(exit_code::SUCCESS)
        }
    }
}

/// Fetches active accounts and builds one exchange client per account before
/// the engine is asked to start, since [`ploy::engine::EngineScope::start`]
/// takes a synchronous client-lookup closure (construction itself is async
/// for the EVM-CLOB adapter, which signs an API-key derivation request).
async fn bind_account_clients(
    user: Uuid,
    store: &Arc<dyn PersistencePort>,
    app_config: &AppConfig,
) -> Result<HashMap<Uuid, Arc<dyn ExchangeClient>>> {
    let accounts = store.get_active_accounts(user).await?;
    let mut clients = HashMap::with_capacity(accounts.len());
    for account in &accounts {
        let client =
            build_exchange_client_for_account(account, app_config, app_config.dry_run).await?;
        clients.insert(account.id, client);
    }
    Ok(clients)
}
