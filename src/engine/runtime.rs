//! Per-user trading engine orchestration (component J).
//!
//! One [`EngineScope`] owns one user's discovery, evaluation, and monitor
//! loops, its own cancellation signal, and the entry-submission mutex set.
//! [`EngineRegistry`] is the process-wide `user_id -> EngineScope` map — the
//! only process-wide *mutable* trading state besides the idempotency cache
//! and the adapter rate limiters (5. Concurrency & Resource Model).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::confidence::{self, ConfidenceFactors, Trend};
use super::confirmation::{ConfirmationOutcome, OrderConfirmer};
use super::discovery::{classify_and_filter, RawCandidateMarket};
use super::guardian::{BalanceGuardian, GuardianDecision};
use super::idempotency::IdempotencyGuard;
use super::matcher::{self, GameIdentity};
use super::notifier::{Notification, Notifier};
use super::reconciler::PositionReconciler;
use super::sizer;
use super::sports_client::{GameState, SportsDataClient};

use crate::domain::{
    Account, EnginePosition, EngineTrade, EntryReason, ExitReason, FillStatus, MarketSide,
    OrderRequest, OrderSide, PositionStatus, SyncStatus, TrackedMarket,
};
use crate::error::{EngineError, Result};
use crate::exchange::ExchangeClient;
use crate::persistence::{OpenPositionFilter, PersistencePort};

pub use crate::domain::EngineState;

/// Cadences from spec section 4.J / 4.I. The discovery loop jitters its
/// sleep by up to 10% so many users' engines don't all poll in lockstep.
pub const DISCOVERY_INTERVAL_SECS: u64 = 60;
pub const EVALUATION_INTERVAL_SECS: u64 = 5;
pub const MONITOR_INTERVAL_SECS: u64 = 5;
pub const RECONCILIATION_INTERVAL_SECS: u64 = 300;
/// Budget for an in-flight loop iteration to observe cancellation (5.).
pub const STOP_GRACE: Duration = Duration::from_secs(2);
/// Bounded worker pool per exchange (4.J "Backpressure").
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
/// Markets auto-retired this long after kickoff with no finished signal.
pub const POST_GAME_TIMEOUT_HOURS: i64 = 6;

/// Minimal per-adapter token bucket; refills one token per `refill_interval`
/// up to `capacity`. Grounded on the same "simple atomic/lock-guarded struct
/// with inline tests" shape as [`super::idempotency::IdempotencyGuard`] and
/// [`crate::adapters::resilience::CircuitBreaker`].
pub struct RateLimiter {
    capacity: u32,
    tokens: Mutex<(u32, tokio::time::Instant)>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            tokens: Mutex::new((capacity, tokio::time::Instant::now())),
            refill_interval,
        }
    }

    pub async fn acquire(&self) {
        loop {
            {
                let mut guard = self.tokens.lock().await;
                let (count, last_refill) = &mut *guard;
                let elapsed = last_refill.elapsed();
                let refills = (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()) as u32;
                if refills > 0 {
                    *count = self.capacity.min(*count + refills);
                    *last_refill = tokio::time::Instant::now();
                }
                if *count > 0 {
                    *count -= 1;
                    return;
                }
            }
            tokio::time::sleep(self.refill_interval / 4).await;
        }
    }
}

/// Configuration knobs for one user's engine that aren't per-sport (those
/// live in [`crate::domain::SportConfig`]).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub min_match_confidence: f64,
    pub min_liquidity: Decimal,
    pub min_volume: Decimal,
    pub max_spread_pct: f64,
    pub discovery_hours_ahead: Option<i64>,
    pub default_min_confidence: f64,
    pub worker_pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_match_confidence: matcher::default_confidence_threshold(),
            min_liquidity: Decimal::from(1000),
            min_volume: Decimal::from(1000),
            max_spread_pct: 10.0,
            discovery_hours_ahead: Some(12),
            default_min_confidence: 0.60,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

/// A bounded ring of the most recent errors surfaced to the operator status
/// read (7. "last three errors").
#[derive(Default)]
struct ErrorLog {
    recent: VecDeque<String>,
}

impl ErrorLog {
    fn push(&mut self, err: impl std::fmt::Display) {
        if self.recent.len() >= 3 {
            self.recent.pop_front();
        }
        self.recent.push_back(err.to_string());
    }

    fn last_three(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }
}

/// Operator-facing status read (7.).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub user_id: Uuid,
    pub state: EngineState,
    pub tracked_games: u32,
    pub open_positions: u32,
    pub trades_today: u32,
    pub daily_pnl: Decimal,
    pub last_errors: Vec<String>,
}

/// One user's live trading engine: the discovery/evaluation/monitor loops
/// plus the state they share.
pub struct EngineScope {
    user_id: Uuid,
    store: Arc<dyn PersistencePort>,
    clients: RwLock<HashMap<Uuid, Arc<dyn ExchangeClient>>>,
    guardian: Arc<BalanceGuardian>,
    confirmer: Arc<OrderConfirmer>,
    reconciler: Arc<PositionReconciler>,
    notifier: Arc<Notifier>,
    sports_client: Arc<SportsDataClient>,
    config: EngineConfig,

    state: RwLock<EngineState>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    errors: Mutex<ErrorLog>,

    /// Gates entry submission at (user, market, account) granularity so the
    /// evaluation loop never double-enters the same slot concurrently (5.).
    entry_locks: dashmap::DashMap<(Uuid, Uuid), Arc<Mutex<()>>>,
    /// Markets locked by the matcher within one discovery pass (4.D).
    rate_limiter: RateLimiter,
}

impl EngineScope {
    pub fn new(
        user_id: Uuid,
        store: Arc<dyn PersistencePort>,
        notifier: Arc<Notifier>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let idempotency = Arc::new(IdempotencyGuard::new(store.clone()));
        Arc::new(Self {
            user_id,
            store: store.clone(),
            clients: RwLock::new(HashMap::new()),
            guardian: Arc::new(BalanceGuardian::new(store.clone())),
            confirmer: Arc::new(OrderConfirmer::new(idempotency)),
            reconciler: Arc::new(PositionReconciler::new(store, notifier.clone())),
            notifier,
            sports_client: Arc::new(SportsDataClient::new()),
            config,
            state: RwLock::new(EngineState::Stopped),
            cancel_tx,
            cancel_rx,
            tasks: Mutex::new(Vec::new()),
            errors: Mutex::new(ErrorLog::default()),
            entry_locks: dashmap::DashMap::new(),
            rate_limiter: RateLimiter::new(20, Duration::from_secs(1)),
        })
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    async fn transition(&self, target: EngineState, reason: &str) -> Result<()> {
        let mut guard = self.state.write().await;
        if !guard.can_transition_to(target) {
            return Err(EngineError::InvalidStateTransition {
                from: guard.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        info!(user_id = %self.user_id, from = %*guard, to = %target, reason, "engine state transition");
        *guard = target;
        Ok(())
    }

    async fn record_error(&self, err: impl std::fmt::Display) {
        error!(user_id = %self.user_id, error = %err, "engine loop error");
        self.errors.lock().await.push(err);
    }

    /// Builds one exchange client per active account, pooled by account id
    /// for the lifetime of the engine (9. Open Question 1 — the source
    /// created a fresh client per decryption; this reimplementation pools).
    async fn bind_clients(
        &self,
        accounts: &[Account],
        build: impl Fn(&Account) -> Result<Arc<dyn ExchangeClient>>,
    ) -> Result<()> {
        let mut clients = self.clients.write().await;
        for account in accounts {
            if clients.contains_key(&account.id) {
                continue;
            }
            let client = build(account).map_err(|e| {
                EngineError::Auth(format!(
                    "failed to build exchange client for account {}: {e}",
                    account.id
                ))
            })?;
            clients.insert(account.id, client);
        }
        Ok(())
    }

    /// Starts the engine: validates credentials, runs the reconciler once,
    /// then spawns the three loops. `build_client` constructs (or looks up
    /// pooled) an [`ExchangeClient`] for one account — callers own
    /// credential decryption, which stays out of scope here.
    pub async fn start(
        self: &Arc<Self>,
        build_client: impl Fn(&Account) -> Result<Arc<dyn ExchangeClient>> + Send + Sync + 'static,
    ) -> Result<()> {
        self.transition(EngineState::Initializing, "start requested")
            .await?;

        let settings = self.store.get_global_settings(self.user_id).await?;
        if settings.is_kill_switch_latched() {
            self.transition(EngineState::Stopped, "kill switch still latched")
                .await
                .ok();
            return Err(EngineError::Validation(
                "kill switch latched, reset required before start".to_string(),
            ));
        }

        let accounts = self.store.get_active_accounts(self.user_id).await?;
        if accounts.is_empty() {
            self.transition(EngineState::Stopped, "no active accounts")
                .await
                .ok();
            return Err(EngineError::Auth("no active accounts configured".to_string()));
        }
        if !Account::allocations_valid(&accounts) {
            self.transition(EngineState::Stopped, "allocations do not sum to 100%")
                .await
                .ok();
            return Err(EngineError::Validation(
                "account allocations must sum to 100% before routing".to_string(),
            ));
        }

        // A credential build failure surfaces as Auth and halts the user
        // rather than silently skipping the account (9. Open Question 3).
        self.bind_clients(&accounts, build_client).await?;

        self.transition(EngineState::Running, "initialization complete")
            .await?;

        let clients = self.clients.read().await.clone();
        if let Err(e) = self.reconciler.run(self.user_id, &accounts, &clients).await {
            self.record_error(format!("startup reconciliation failed: {e}")).await;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(discovery_loop(self.clone())));
        tasks.push(tokio::spawn(evaluation_loop(self.clone())));
        tasks.push(tokio::spawn(monitor_loop(self.clone())));
        tasks.push(tokio::spawn(reconciliation_loop(self.clone())));
        Ok(())
    }

    /// User-initiated stop: cancels all loops, waits up to [`STOP_GRACE`]
    /// for them to observe cancellation, then transitions to stopped.
    /// In-flight orders are left to complete; the next reconciliation
    /// adopts them (5.).
    pub async fn stop(&self) -> Result<()> {
        let current = self.state().await;
        if current == EngineState::Stopped {
            return Ok(());
        }
        if current == EngineState::Running {
            self.transition(EngineState::Draining, "stop requested").await?;
        } else if current == EngineState::Halted {
            self.transition(EngineState::Draining, "stop requested while halted")
                .await?;
        }

        let _ = self.cancel_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for task in tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!(user_id = %self.user_id, "loop did not stop within grace period, abandoning handle");
            }
        }
        self.transition(EngineState::Stopped, "all loops cancelled").await?;
        let _ = self.cancel_tx.send(false);
        Ok(())
    }

    /// Graceful drain: suppresses new entries but lets monitor-driven exits
    /// continue; does not wait for loops to exit (caller calls `stop` later).
    pub async fn drain(&self) -> Result<()> {
        self.transition(EngineState::Draining, "operator requested drain")
            .await
    }

    /// Operator clears the kill switch; requires balance currently above
    /// threshold (4.H). Does not by itself resume the engine — the next
    /// `start` call does, and only if this succeeded.
    pub async fn reset_kill_switch(&self, accounts: &[Account]) -> Result<()> {
        let clients = self.clients.read().await.clone();
        self.guardian
            .try_clear_kill_switch(self.user_id, accounts, &clients)
            .await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let tracked = self.store.get_live_tracked_markets(self.user_id).await?;
        let open = self
            .store
            .get_open_positions(OpenPositionFilter {
                user_id: Some(self.user_id),
                account_id: None,
                tracked_market_id: None,
            })
            .await?;
        let errors = self.errors.lock().await.last_three();
        Ok(EngineStatus {
            user_id: self.user_id,
            state: self.state().await,
            tracked_games: tracked.len() as u32,
            open_positions: open.len() as u32,
            trades_today: 0,
            daily_pnl: open
                .iter()
                .filter_map(|p| p.realized_pnl)
                .fold(Decimal::ZERO, |acc, v| acc + v),
            last_errors: errors,
        })
    }

    fn entry_lock(&self, tracked_market_id: Uuid, account_id: Uuid) -> Arc<Mutex<()>> {
        self.entry_locks
            .entry((tracked_market_id, account_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn guardian_allows_entries(&self) -> bool {
        matches!(self.state().await, EngineState::Running)
    }
}

/// Process-wide `user_id -> engine` map (5. "a map of user-id -> engine-scope").
#[derive(Default)]
pub struct EngineRegistry {
    scopes: RwLock<HashMap<Uuid, Arc<EngineScope>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_insert(
        &self,
        user_id: Uuid,
        make: impl FnOnce() -> Arc<EngineScope>,
    ) -> Arc<EngineScope> {
        if let Some(existing) = self.scopes.read().await.get(&user_id) {
            return existing.clone();
        }
        let mut guard = self.scopes.write().await;
        guard.entry(user_id).or_insert_with(make).clone()
    }

    pub async fn get(&self, user_id: Uuid) -> Option<Arc<EngineScope>> {
        self.scopes.read().await.get(&user_id).cloned()
    }

    pub async fn remove(&self, user_id: Uuid) {
        self.scopes.write().await.remove(&user_id);
    }
}

fn jittered(base_secs: u64) -> Duration {
    let jitter_frac: f64 = rand::thread_rng().gen_range(-0.1..0.1);
    let secs = (base_secs as f64 * (1.0 + jitter_frac)).max(1.0);
    Duration::from_secs_f64(secs)
}

/// Sleeps for `dur` unless cancellation fires first; returns `false` if
/// cancelled.
async fn sleep_or_cancel(cancel_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = cancel_rx.changed() => !*cancel_rx.borrow(),
    }
}

// ---------------------------------------------------------------------
// Discovery loop (4.J.1)
// ---------------------------------------------------------------------

async fn discovery_loop(scope: Arc<EngineScope>) {
    let mut cancel_rx = scope.cancel_rx.clone();
    loop {
        if let Err(e) = run_discovery_pass(&scope).await {
            scope.record_error(format!("discovery pass failed: {e}")).await;
        }
        if !sleep_or_cancel(&mut cancel_rx, jittered(DISCOVERY_INTERVAL_SECS)).await {
            return;
        }
    }
}

async fn run_discovery_pass(scope: &Arc<EngineScope>) -> Result<()> {
    let sport_configs = scope.store.get_sport_configs(scope.user_id).await?;
    let enabled_sports: Vec<String> = sport_configs
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.sport.clone())
        .collect();
    if enabled_sports.is_empty() {
        return Ok(());
    }

    let clients = scope.clients.read().await.clone();
    let mut candidates = Vec::new();
    let mut seen_exchanges = std::collections::HashSet::new();
    for client in clients.values() {
        if !seen_exchanges.insert(client.kind()) {
            continue;
        }
        let summaries = match client.search_markets("").await {
            Ok(s) => s,
            Err(e) => {
                scope
                    .record_error(format!("market search failed for {}: {e}", client.kind()))
                    .await;
                continue;
            }
        };
        for summary in summaries {
            if let Some(raw) = summary_to_raw_candidate(client.as_ref(), &summary).await {
                candidates.push(raw);
            }
        }
    }

    let discovered = classify_and_filter(
        candidates,
        chrono::Utc::now(),
        scope.config.min_liquidity,
        scope.config.min_volume,
        scope.config.max_spread_pct,
        scope.config.discovery_hours_ahead,
    );
    scope.store.cache_discovered_markets(&discovered).await?;

    let mut locked = std::collections::HashSet::new();
    for sport in &enabled_sports {
        let events = match scope.sports_client.fetch_live_events(sport).await {
            Ok(e) => e,
            Err(e) => {
                scope
                    .record_error(format!("scoreboard fetch failed for {sport}: {e}"))
                    .await;
                continue;
            }
        };
        let sport_candidates: Vec<_> = discovered
            .iter()
            .filter(|m| m.sport.as_deref() == Some(sport.as_str()))
            .cloned()
            .collect();

        for event in SportsDataClient::live_only(&events) {
            let game = GameIdentity {
                home_team: event.home_team.clone(),
                home_abbrev: event.home_abbrev.clone(),
                away_team: event.away_team.clone(),
                away_abbrev: event.away_abbrev.clone(),
                start_time: event.start_time,
            };
            let Some(result) = matcher::match_game(
                &game,
                &sport_candidates,
                &locked,
                scope.config.min_match_confidence,
            ) else {
                continue;
            };
            locked.insert(result.market_index);
            let matched = &sport_candidates[result.market_index];

            let now = chrono::Utc::now();
            let tracked = TrackedMarket {
                id: Uuid::new_v4(),
                user_id: scope.user_id,
                exchange: matched.exchange,
                market_id: matched.market_id.clone(),
                sport: sport.clone(),
                external_event_id: Some(event.external_event_id.clone()),
                home_team: event.home_team.clone(),
                away_team: event.away_team.clone(),
                game_start_time: event.start_time,
                baseline_yes_price: matched.yes_price,
                baseline_no_price: matched.no_price,
                baseline_captured_at: now,
                current_yes_price: matched.yes_price,
                current_no_price: matched.no_price,
                current_phase: event.current_phase,
                total_phases: event.total_phases,
                clock_time_remaining_secs: event.time_remaining_secs,
                clock_captured_at: now,
                match_confidence: result.confidence,
                is_live: true,
                is_finished: false,
                is_user_selected: false,
                auto_discovered: true,
                created_at: now,
                updated_at: now,
            };
            scope
                .store
                .upsert_tracked_market_capturing_baseline(&tracked)
                .await?;
        }
    }

    retire_finished_markets(scope).await
}

async fn summary_to_raw_candidate(
    client: &dyn ExchangeClient,
    summary: &crate::adapters::MarketSummary,
) -> Option<RawCandidateMarket> {
    if !summary.active {
        return None;
    }
    let prices: Vec<Decimal> = summary
        .outcome_prices
        .as_deref()
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .map(|v| v.iter().filter_map(|p| p.parse::<Decimal>().ok()).collect())
        .unwrap_or_default();
    let yes_price = prices.first().copied().unwrap_or(Decimal::new(5, 1));
    let no_price = prices.get(1).copied().unwrap_or(Decimal::ONE - yes_price);

    let market = client.get_market(&summary.condition_id).await.ok();
    let end_time = market
        .as_ref()
        .and_then(|m| m.end_date_iso.as_deref())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::hours(6));

    let (liquidity, volume_24h) = client
        .get_market_liquidity(&summary.condition_id)
        .await
        .unwrap_or((Decimal::MAX, Decimal::MAX));

    let (best_bid, best_ask) = client
        .get_best_prices(&summary.condition_id)
        .await
        .unwrap_or((None, None));

    Some(RawCandidateMarket {
        exchange: client.kind(),
        market_id: summary.condition_id.clone(),
        title: summary.question.clone().unwrap_or_default(),
        description: summary.slug.clone(),
        explicit_sport_tag: None,
        end_time,
        liquidity,
        volume_24h,
        yes_price,
        no_price,
        best_bid,
        best_ask,
        status_open: summary.active,
    })
}

async fn retire_finished_markets(scope: &Arc<EngineScope>) -> Result<()> {
    let tracked = scope.store.get_live_tracked_markets(scope.user_id).await?;
    let now = chrono::Utc::now();
    for market in tracked {
        let stale = now - market.game_start_time > chrono::Duration::hours(POST_GAME_TIMEOUT_HOURS);
        if stale {
            scope.store.mark_tracked_market_finished(market.id).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Evaluation loop (4.J.2)
// ---------------------------------------------------------------------

async fn evaluation_loop(scope: Arc<EngineScope>) {
    let mut cancel_rx = scope.cancel_rx.clone();
    loop {
        if scope.guardian_allows_entries().await {
            if let Err(e) = run_evaluation_pass(&scope).await {
                scope.record_error(format!("evaluation pass failed: {e}")).await;
            }
        }
        if !sleep_or_cancel(&mut cancel_rx, Duration::from_secs(EVALUATION_INTERVAL_SECS)).await {
            return;
        }
    }
}

async fn run_evaluation_pass(scope: &Arc<EngineScope>) -> Result<()> {
    let accounts = scope.store.get_active_accounts(scope.user_id).await?;
    let clients = scope.clients.read().await.clone();
    let sport_configs = scope.store.get_sport_configs(scope.user_id).await?;
    let markets = scope.store.get_live_tracked_markets(scope.user_id).await?;

    let guardian_decision = scope
        .guardian
        .enforce(scope.user_id, &accounts, &clients)
        .await?;
    let streak_multiplier = match guardian_decision {
        GuardianDecision::Normal { size_multiplier } => size_multiplier,
        GuardianDecision::KillSwitchLatched { reason } => {
            scope
                .notifier
                .notify(None, &Notification::kill_switch_latched(&reason))
                .await;
            scope
                .transition(EngineState::Halted, &reason)
                .await
                .ok();
            return Ok(());
        }
        GuardianDecision::AlreadyLatched => return Ok(()),
    };

    let open_positions = scope
        .store
        .get_open_positions(OpenPositionFilter {
            user_id: Some(scope.user_id),
            account_id: None,
            tracked_market_id: None,
        })
        .await?;

    for market in &markets {
        let Some(config) = sport_configs.iter().find(|c| c.sport == market.sport && c.enabled)
        else {
            continue;
        };

        if let Some(primary_client) = clients.values().next() {
            if let Ok((bid, ask)) = primary_client.get_best_prices(&market.market_id).await {
                if let (Some(b), Some(a)) = (bid, ask) {
                    let mid = (b + a) / Decimal::TWO;
                    scope
                        .store
                        .update_tracked_market_price(market.id, mid, Decimal::ONE - mid)
                        .await?;
                }
            }
        }

        let refreshed = scope
            .store
            .get_tracked_market(market.id)
            .await?
            .unwrap_or_else(|| market.clone());

        let drop_pct = refreshed.drop_pct();
        if drop_pct < config.entry_threshold_drop_pct {
            continue;
        }
        if refreshed.current_yes_price > config.entry_threshold_absolute {
            continue;
        }

        let per_game = open_positions
            .iter()
            .filter(|p| p.tracked_market_id == refreshed.id && p.status == PositionStatus::Open)
            .count() as u32;
        if per_game >= config.max_concurrent_positions_per_game {
            continue;
        }
        let total_open = open_positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .count() as u32;
        if total_open >= config.max_concurrent_positions_total {
            continue;
        }
        if refreshed.time_remaining_secs(chrono::Utc::now()) < config.min_time_remaining_secs {
            continue;
        }

        let confidence = confidence::score(ConfidenceFactors {
            drop_pct,
            time_remaining_secs: refreshed.time_remaining_secs(chrono::Utc::now()),
            volume_24h: None,
            trend: Trend::Down,
            current_phase: refreshed.current_phase,
            total_phases: refreshed.total_phases,
            spread_pct: None,
        });
        let min_confidence = config.min_confidence_or_default(scope.config.default_min_confidence);
        if confidence.score < min_confidence {
            continue;
        }

        let size_usd = sizer::size_position_usd(
            config,
            confidence.score,
            1.0,
            None,
            streak_multiplier,
        );
        if size_usd <= Decimal::ZERO || refreshed.current_yes_price <= Decimal::ZERO {
            continue;
        }
        let total_contracts = (size_usd / refreshed.current_yes_price)
            .round()
            .to_string()
            .parse::<u64>()
            .unwrap_or(0);
        if total_contracts == 0 {
            continue;
        }

        let active_accounts: Vec<Account> = accounts.iter().filter(|a| a.is_active).cloned().collect();
        let splits = sizer::split_contracts_by_allocation(total_contracts, &active_accounts);

        for (account_id, contracts) in splits {
            if contracts == 0 {
                continue;
            }
            let Some(client) = clients.get(&account_id) else {
                continue;
            };

            let lock = scope.entry_lock(refreshed.id, account_id);
            let _guard = lock.lock().await;
            scope.rate_limiter.acquire().await;

            let request = OrderRequest::buy_limit(
                refreshed.market_id.clone(),
                MarketSide::Yes,
                contracts,
                refreshed.current_yes_price,
            );

            match scope
                .confirmer
                .submit_and_confirm(client.as_ref(), account_id, &request)
                .await
            {
                Ok(outcome) => {
                    if let Err(e) = record_entry_outcome(scope, &refreshed, account_id, &request, outcome).await
                    {
                        scope.record_error(format!("failed to record entry: {e}")).await;
                    }
                }
                Err(e) => {
                    scope
                        .record_error(format!(
                            "entry submission failed for market {}: {e}",
                            refreshed.market_id
                        ))
                        .await;
                }
            }
        }
    }

    Ok(())
}

async fn record_entry_outcome(
    scope: &Arc<EngineScope>,
    market: &TrackedMarket,
    account_id: Uuid,
    request: &OrderRequest,
    outcome: ConfirmationOutcome,
) -> Result<()> {
    let now = chrono::Utc::now();
    let base = EnginePosition {
        id: Uuid::new_v4(),
        user_id: scope.user_id,
        account_id,
        tracked_market_id: market.id,
        side: MarketSide::Yes,
        requested_entry_price: request.limit_price,
        actual_entry_price: None,
        entry_size: request.shares,
        fill_status: FillStatus::Pending,
        confirmation_attempts: 1,
        slippage: None,
        sync_status: SyncStatus::Synced,
        recovery_source: None,
        entry_reason: EntryReason::BaselineDropSignal,
        exit_reason: None,
        exit_price: None,
        exit_size: None,
        realized_pnl: None,
        status: PositionStatus::Open,
        opened_at: now,
        closed_at: None,
        updated_at: now,
    };

    let position = match outcome {
        ConfirmationOutcome::Filled {
            fill_price,
            fill_size,
            slippage,
            ..
        } => EnginePosition {
            actual_entry_price: Some(fill_price),
            entry_size: fill_size,
            fill_status: FillStatus::Filled,
            slippage: Some(slippage),
            ..base
        },
        ConfirmationOutcome::Partial {
            fill_price,
            fill_size,
            ..
        } => EnginePosition {
            actual_entry_price: Some(fill_price),
            entry_size: fill_size,
            fill_status: FillStatus::Partial,
            ..base
        },
        ConfirmationOutcome::Cancelled { .. } => EnginePosition {
            fill_status: FillStatus::Cancelled,
            status: PositionStatus::Closed,
            closed_at: Some(now),
            ..base
        },
        ConfirmationOutcome::Rejected { .. } => EnginePosition {
            fill_status: FillStatus::Rejected,
            status: PositionStatus::Closed,
            closed_at: Some(now),
            ..base
        },
        ConfirmationOutcome::Timeout { .. } => EnginePosition {
            fill_status: FillStatus::Timeout,
            status: PositionStatus::Closed,
            closed_at: Some(now),
            ..base
        },
    };

    position
        .validate()
        .map_err(EngineError::Validation)?;
    scope.store.insert_position(&position).await
}

// ---------------------------------------------------------------------
// Monitor loop (4.J.3)
// ---------------------------------------------------------------------

async fn monitor_loop(scope: Arc<EngineScope>) {
    let mut cancel_rx = scope.cancel_rx.clone();
    loop {
        if scope.state().await.allows_exits() {
            if let Err(e) = run_monitor_pass(&scope).await {
                scope.record_error(format!("monitor pass failed: {e}")).await;
            }
        }
        if !sleep_or_cancel(&mut cancel_rx, Duration::from_secs(MONITOR_INTERVAL_SECS)).await {
            return;
        }
    }
}

async fn run_monitor_pass(scope: &Arc<EngineScope>) -> Result<()> {
    let clients = scope.clients.read().await.clone();
    let sport_configs = scope.store.get_sport_configs(scope.user_id).await?;
    let open_positions = scope
        .store
        .get_open_positions(OpenPositionFilter {
            user_id: Some(scope.user_id),
            account_id: None,
            tracked_market_id: None,
        })
        .await?;

    for position in open_positions {
        if position.fill_status != FillStatus::Filled && position.fill_status != FillStatus::Partial {
            continue;
        }
        let Some(market) = scope.store.get_tracked_market(position.tracked_market_id).await? else {
            continue;
        };
        let Some(config) = sport_configs.iter().find(|c| c.sport == market.sport) else {
            continue;
        };
        let Some(client) = clients.get(&position.account_id) else {
            continue;
        };

        let (bid, ask) = client.get_best_prices(&market.market_id).await.unwrap_or((None, None));
        let mid = match (bid, ask) {
            (Some(b), Some(a)) => (b + a) / Decimal::TWO,
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => continue,
        };

        let profit_pct = position.profit_pct(mid).unwrap_or(0.0);
        let time_remaining = market.time_remaining_secs(chrono::Utc::now());

        let exit_reason = if profit_pct >= config.take_profit_pct {
            Some(ExitReason::TakeProfit)
        } else if profit_pct <= -config.stop_loss_pct {
            Some(ExitReason::StopLoss)
        } else if time_remaining <= config.exit_before_secs {
            Some(ExitReason::TimeExpiry)
        } else {
            None
        };

        let Some(reason) = exit_reason else {
            continue;
        };

        let lock = scope.entry_lock(position.tracked_market_id, position.account_id);
        let _guard = lock.lock().await;
        scope.rate_limiter.acquire().await;

        let request = OrderRequest::sell_limit(
            market.market_id.clone(),
            position.side,
            position.entry_size,
            mid,
        );

        match scope
            .confirmer
            .submit_and_confirm(client.as_ref(), position.account_id, &request)
            .await
        {
            Ok(ConfirmationOutcome::Filled {
                fill_price,
                fill_size,
                ..
            }) => {
                close_position(scope, position, fill_price, fill_size, reason).await?;
            }
            Ok(ConfirmationOutcome::Partial {
                fill_price,
                fill_size,
                ..
            }) => {
                close_position(scope, position, fill_price, fill_size, reason).await?;
            }
            Ok(_) => {
                scope
                    .record_error(format!(
                        "exit order for position {} did not fill, will retry next tick",
                        position.id
                    ))
                    .await;
            }
            Err(e) => {
                scope
                    .record_error(format!("exit submission failed for position {}: {e}", position.id))
                    .await;
            }
        }
    }

    Ok(())
}

async fn close_position(
    scope: &Arc<EngineScope>,
    mut position: EnginePosition,
    exit_price: Decimal,
    exit_size: u64,
    reason: ExitReason,
) -> Result<()> {
    let entry = position.actual_entry_price.unwrap_or(position.requested_entry_price);
    let realized_pnl = (exit_price - entry) * Decimal::from(exit_size);
    position.close(exit_price, exit_size, realized_pnl, reason);

    let trade = EngineTrade {
        id: Uuid::new_v4(),
        position_id: position.id,
        order_side: OrderSide::Sell,
        price: exit_price,
        size: exit_size,
        exchange_order_id: None,
        executed_at: chrono::Utc::now(),
    };
    trade.validate().map_err(EngineError::Validation)?;

    scope.store.close_position_with_trade(&position, &trade).await?;
    scope
        .guardian
        .record_closed_position(scope.user_id, realized_pnl)
        .await
}

// ---------------------------------------------------------------------
// Reconciliation loop (4.I)
// ---------------------------------------------------------------------

async fn reconciliation_loop(scope: Arc<EngineScope>) {
    let mut cancel_rx = scope.cancel_rx.clone();
    loop {
        if !sleep_or_cancel(&mut cancel_rx, Duration::from_secs(RECONCILIATION_INTERVAL_SECS)).await {
            return;
        }
        let accounts = match scope.store.get_active_accounts(scope.user_id).await {
            Ok(a) => a,
            Err(e) => {
                scope.record_error(format!("reconciliation: failed to load accounts: {e}")).await;
                continue;
            }
        };
        let clients = scope.clients.read().await.clone();
        if let Err(e) = scope.reconciler.run(scope.user_id, &accounts, &clients).await {
            scope.record_error(format!("reconciliation pass failed: {e}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_blocks_once_capacity_exhausted() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        limiter.acquire().await;
        limiter.acquire().await;
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn jittered_interval_stays_within_ten_percent() {
        for _ in 0..20 {
            let d = jittered(60);
            assert!(d.as_secs_f64() >= 54.0 && d.as_secs_f64() <= 66.0);
        }
    }
}
