// Dispatcher - the orchestration loop
//
// selection → login → execute-with-timeout → classify → update → retry or
// abort. Also the batch variant that amortizes one login across a group of
// calls, and the background maintenance loops (health sweep, stats report,
// adaptive rate).
//
// The dispatcher never raises to its caller: a dispatch resolves to
// `Some(payload)` or `None`, and everything interesting is logged.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::driver::{Driver, DriverError};
use crate::models::{mask_username, Account, ErrorKind, OrchestratorConfig};
use crate::modules::{AccountRegistry, ProxyPool, Reservation};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::classifier::classify_error;
use crate::orchestrator::gate::ConcurrencyGate;
use crate::orchestrator::health::{Admission, HealthTracker};
use crate::orchestrator::monitor::{self, StatsReport};
use crate::orchestrator::session::DriverSession;

pub const GLOBAL_RATE_MAX: f64 = 100.0;
pub const GLOBAL_RATE_MIN: f64 = 1.0;

/// Small buffer added when sleeping out a rate window, so the retry lands
/// after the slot actually frees.
const RATE_WAIT_BUFFER: Duration = Duration::from_millis(25);

/// Timeout classes per operation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Login,
    Search,
    Profile,
    Tweet,
    Default,
}

impl TimeoutClass {
    pub const fn duration(&self) -> Duration {
        match self {
            Self::Login => Duration::from_millis(45_000),
            Self::Search => Duration::from_millis(60_000),
            Self::Profile => Duration::from_millis(30_000),
            Self::Tweet => Duration::from_millis(35_000),
            Self::Default => Duration::from_millis(30_000),
        }
    }
}

/// A named operation with its timeout budget.
#[derive(Debug, Clone, Copy)]
pub struct OpSpec {
    pub name: &'static str,
    pub timeout: Duration,
}

impl OpSpec {
    pub const fn new(name: &'static str, class: TimeoutClass) -> Self {
        Self {
            name,
            timeout: class.duration(),
        }
    }

    /// Internal pagination gets double the budget per page.
    pub fn doubled(self) -> Self {
        Self {
            name: self.name,
            timeout: self.timeout.saturating_mul(2),
        }
    }
}

/// Payload emptiness: a null-ish or empty result is "no data" and the
/// dispatch moves on to another account.
pub trait Payload {
    fn is_empty_payload(&self) -> bool {
        false
    }
}

impl<T> Payload for Vec<T> {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Payload> Payload for Option<T> {
    fn is_empty_payload(&self) -> bool {
        self.as_ref().map_or(true, Payload::is_empty_payload)
    }
}

impl Payload for crate::driver::Tweet {}
impl Payload for crate::driver::Profile {}

impl Payload for crate::driver::TweetBatch {
    fn is_empty_payload(&self) -> bool {
        self.tweets.is_empty()
    }
}

impl Payload for crate::driver::ProfileBatch {
    fn is_empty_payload(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// What an operation closure receives: the selected account and its
/// authenticated, proxy-bound driver.
pub struct OpContext {
    pub account: Account,
    pub driver: Arc<dyn Driver>,
}

enum Selection {
    Account(Account),
    /// Everyone eligible is rate-limited; soonest slot frees after this
    Wait(Duration),
    None,
}

pub struct Dispatcher {
    registry: Arc<AccountRegistry>,
    pool: Arc<ProxyPool>,
    health: Arc<HealthTracker>,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<ConcurrencyGate>,
    session: Arc<DriverSession>,
    cfg: OrchestratorConfig,
    /// Adaptive dispatch admission rate (req/s)
    global_rate: RwLock<f64>,
    next_dispatch_at: Mutex<Instant>,
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AccountRegistry>,
        pool: Arc<ProxyPool>,
        health: Arc<HealthTracker>,
        breaker: Arc<CircuitBreaker>,
        gate: Arc<ConcurrencyGate>,
        session: Arc<DriverSession>,
        cfg: OrchestratorConfig,
    ) -> Self {
        let initial_rate = cfg.initial_global_rate;
        Self {
            registry,
            pool,
            health,
            breaker,
            gate,
            session,
            cfg,
            global_rate: RwLock::new(initial_rate),
            next_dispatch_at: Mutex::new(Instant::now()),
            dispatches: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ── execute ────────────────────────────────────────────────────────

    /// Run one operation through the orchestrator. Resolves to the payload
    /// or `None` (breaker open, gate saturated, or attempts exhausted).
    pub async fn execute<T, F, Fut>(&self, op: OpSpec, op_fn: F) -> Option<T>
    where
        T: Payload,
        F: Fn(OpContext) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        if !self.breaker.allow() {
            tracing::warn!("[Dispatcher] {} rejected: circuit breaker open", op.name);
            return None;
        }
        self.pace().await;
        let Some(_permit) = self.gate.acquire().await else {
            tracing::warn!("[Dispatcher] {} rejected: concurrency gate saturated", op.name);
            return None;
        };
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        let mut attempts: u32 = 0;
        // Accounts burned for the remainder of this dispatch
        let mut skip: HashSet<String> = HashSet::new();
        let mut last_empty: Option<T> = None;

        let outcome = loop {
            if attempts >= self.cfg.max_attempts {
                tracing::warn!(
                    "[Dispatcher] {} failed: {} attempt(s) exhausted",
                    op.name,
                    attempts
                );
                break None;
            }

            let account = match self.select_account(&skip).await {
                Selection::Account(account) => account,
                Selection::Wait(wait) => {
                    // All candidates rate-limited; waiting does not consume
                    // an attempt
                    tracing::debug!(
                        "[Dispatcher] {}: all accounts rate-limited, sleeping {}ms",
                        op.name,
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait + RATE_WAIT_BUFFER).await;
                    continue;
                }
                Selection::None => {
                    tracing::warn!("[Dispatcher] {} failed: no selectable account", op.name);
                    break None;
                }
            };
            let masked = mask_username(&account.username);

            // Per-proxy spacing
            if let Some(proxy) = self.pool.assign(&account.username) {
                if let Reservation::Wait(wait) = self.pool.reserve(&proxy.id) {
                    tokio::time::sleep(wait).await;
                    let _ = self.pool.reserve(&proxy.id);
                }
            }

            self.health.record_request(&account.username);

            let driver = match self.session.ensure_login(&account).await {
                Ok(driver) => driver,
                Err(e) => {
                    attempts += 1;
                    let kind = classify_error(&e.message);
                    tracing::warn!(
                        "[Dispatcher] {}: login failed on {} ({}): {}",
                        op.name,
                        masked,
                        kind.as_str(),
                        e.message
                    );
                    if !self.health.on_failure(&account.username, kind, &e.message) {
                        self.persist_unusable(&account.username, kind).await;
                        skip.insert(account.username);
                    }
                    continue;
                }
            };

            let timeout = self.scaled_timeout(op.timeout, &account.username);
            let started = Instant::now();
            let result = tokio::time::timeout(
                timeout,
                op_fn(OpContext {
                    account: account.clone(),
                    driver,
                }),
            )
            .await;
            let rtt_ms = started.elapsed().as_millis() as u64;

            match result {
                // Operation timeout: the account is banned for this
                // dispatch and suspended; no attempt consumed.
                Err(_) => {
                    let message = format!(
                        "operation {} timed out after {}ms",
                        op.name,
                        timeout.as_millis()
                    );
                    tracing::warn!("[Dispatcher] {} on {}", message, masked);
                    if !self
                        .health
                        .on_failure(&account.username, ErrorKind::Timeout, &message)
                    {
                        self.persist_unusable(&account.username, ErrorKind::Timeout).await;
                    }
                    skip.insert(account.username);
                }
                Ok(Ok(payload)) => {
                    if payload.is_empty_payload() {
                        let message = format!("operation {} returned no data", op.name);
                        tracing::debug!("[Dispatcher] {} on {}", message, masked);
                        self.health
                            .on_failure(&account.username, ErrorKind::Unknown, &message);
                        skip.insert(account.username);
                        attempts += 1;
                        last_empty = Some(payload);
                        continue;
                    }
                    self.health.on_success(&account.username, rtt_ms);
                    break Some(payload);
                }
                Ok(Err(e)) => {
                    let kind = classify_error(&e.message);
                    tracing::warn!(
                        "[Dispatcher] {} failed on {} ({}): {}",
                        op.name,
                        masked,
                        kind.as_str(),
                        e.message
                    );
                    if self.health.on_failure(&account.username, kind, &e.message) {
                        attempts += 1;
                    } else {
                        // Account unusable going forward: skip it without
                        // consuming an attempt
                        self.persist_unusable(&account.username, kind).await;
                        skip.insert(account.username);
                    }
                }
            }
        };

        let success = outcome.is_some();
        self.breaker.record(success);
        if !success {
            self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        }
        // An all-empty dispatch resolves to the last observed empty payload
        outcome.or(last_empty)
    }

    // ── execute_batch ──────────────────────────────────────────────────

    /// Batch variant. Small batches fan out as independent dispatches;
    /// larger ones reserve a single account, log in once, and run the
    /// closures in chunks. The breaker is updated once, with success iff a
    /// majority of slots succeeded.
    pub async fn execute_batch<T, F, Fut>(&self, op: OpSpec, op_fns: Vec<F>) -> Vec<Option<T>>
    where
        T: Payload,
        F: Fn(OpContext) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let n = op_fns.len();
        if n == 0 {
            return Vec::new();
        }
        if n <= self.cfg.batch_parallel_threshold {
            return join_all(op_fns.into_iter().map(|f| self.execute(op, f))).await;
        }

        if !self.breaker.allow() {
            tracing::warn!("[Dispatcher] batch {} rejected: circuit breaker open", op.name);
            return none_slots(n);
        }
        let Some(_permit) = self.gate.acquire().await else {
            tracing::warn!("[Dispatcher] batch {} rejected: gate saturated", op.name);
            return none_slots(n);
        };
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        // Reserve one account for the whole batch
        let skip = HashSet::new();
        let account = loop {
            match self.select_account(&skip).await {
                Selection::Account(account) => break Some(account),
                Selection::Wait(wait) => tokio::time::sleep(wait + RATE_WAIT_BUFFER).await,
                Selection::None => break None,
            }
        };
        let Some(account) = account else {
            tracing::warn!("[Dispatcher] batch {} failed: no selectable account", op.name);
            self.breaker.record(false);
            self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            return none_slots(n);
        };
        let masked = mask_username(&account.username);

        let driver = match self.session.ensure_login(&account).await {
            Ok(driver) => driver,
            Err(e) => {
                let kind = classify_error(&e.message);
                tracing::warn!(
                    "[Dispatcher] batch {}: login failed on {} ({}): {}",
                    op.name,
                    masked,
                    kind.as_str(),
                    e.message
                );
                if !self.health.on_failure(&account.username, kind, &e.message) {
                    self.persist_unusable(&account.username, kind).await;
                }
                self.breaker.record(false);
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                return none_slots(n);
            }
        };

        let timeout = self.scaled_timeout(op.timeout, &account.username);
        let mut results: Vec<Option<T>> = Vec::with_capacity(n);
        let mut remaining = op_fns;

        while !remaining.is_empty() {
            let take = remaining.len().min(self.cfg.batch_chunk_size);
            let chunk: Vec<F> = remaining.drain(..take).collect();

            let futures = chunk.into_iter().map(|f| {
                let ctx = OpContext {
                    account: account.clone(),
                    driver: driver.clone(),
                };
                async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(timeout, f(ctx)).await;
                    (result, started.elapsed())
                }
            });

            for (result, elapsed) in join_all(futures).await {
                self.health.record_request(&account.username);
                match result {
                    Ok(Ok(payload)) if !payload.is_empty_payload() => {
                        self.health
                            .on_success(&account.username, elapsed.as_millis() as u64);
                        results.push(Some(payload));
                    }
                    Ok(Ok(_)) => {
                        let message = format!("operation {} returned no data", op.name);
                        self.health
                            .on_failure(&account.username, ErrorKind::Unknown, &message);
                        results.push(None);
                    }
                    Ok(Err(e)) => {
                        let kind = classify_error(&e.message);
                        if !self.health.on_failure(&account.username, kind, &e.message) {
                            self.persist_unusable(&account.username, kind).await;
                        }
                        results.push(None);
                    }
                    Err(_) => {
                        let message = format!(
                            "operation {} timed out after {}ms",
                            op.name,
                            timeout.as_millis()
                        );
                        if !self
                            .health
                            .on_failure(&account.username, ErrorKind::Timeout, &message)
                        {
                            self.persist_unusable(&account.username, ErrorKind::Timeout).await;
                        }
                        results.push(None);
                    }
                }
            }
        }

        let succeeded = results.iter().filter(|slot| slot.is_some()).count();
        let success = succeeded >= n.div_ceil(2);
        tracing::info!(
            "[Dispatcher] batch {} on {}: {}/{} slot(s) succeeded",
            op.name,
            masked,
            succeeded,
            n
        );
        self.breaker.record(success);
        if !success {
            self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        }
        results
    }

    // ── Selection ──────────────────────────────────────────────────────

    async fn select_account(&self, skip: &HashSet<String>) -> Selection {
        let now = Utc::now();
        let mut eligible: Vec<Account> = Vec::new();
        let mut soonest: Option<Duration> = None;

        for account in self.registry.list().await {
            if !account.usable || account.is_locked || skip.contains(&account.username) {
                continue;
            }
            let snapshot = self.health.snapshot(&account.username);
            if snapshot.status.is_sink() || snapshot.is_cooling(now) {
                continue;
            }
            match self.health.can_request(&account.username) {
                Admission::Ready => eligible.push(account),
                Admission::RateLimited(wait) => {
                    soonest = Some(soonest.map_or(wait, |s| s.min(wait)));
                }
            }
        }

        if !eligible.is_empty() {
            let index = rand::thread_rng().gen_range(0..eligible.len());
            Selection::Account(eligible.swap_remove(index))
        } else if let Some(wait) = soonest {
            Selection::Wait(wait)
        } else {
            Selection::None
        }
    }

    /// A degraded account gets more headroom: base × max(1, 2 − rate×1.5).
    fn scaled_timeout(&self, base: Duration, username: &str) -> Duration {
        let rate = self.health.success_rate(username);
        let scale = (2.0 - rate * 1.5).max(1.0);
        base.mul_f64(scale)
    }

    /// Persist the terminal flags for an account the tracker declared
    /// unusable, and drop its cached session.
    async fn persist_unusable(&self, username: &str, kind: ErrorKind) {
        let result = match kind {
            ErrorKind::AccountLocked => self.registry.mark_locked(username).await,
            _ => self.registry.mark_suspended(username).await,
        };
        if let Err(e) = result {
            tracing::error!(
                "[Dispatcher] Failed to persist unusable flag for {}: {}",
                mask_username(username),
                e
            );
        }
        self.session.discard(username);
    }

    /// Global-rate pacing: dispatches are admitted at most `global_rate`
    /// per second.
    async fn pace(&self) {
        let wait = {
            let rate = *self.global_rate.read();
            let interval = Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE));
            let mut next = self.next_dispatch_at.lock();
            let now = Instant::now();
            if now >= *next {
                *next = now + interval;
                Duration::ZERO
            } else {
                let wait = *next - now;
                *next += interval;
                wait
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    // ── Background maintenance ─────────────────────────────────────────

    /// Spawn the sweep, stats and rate-adjust loops. Idempotent per call
    /// site; `shutdown` cancels and joins them.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let dispatcher = self.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                dispatcher.cfg.sweep_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dispatcher.run_sweep().await,
                }
            }
        }));

        let dispatcher = self.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                dispatcher.cfg.stats_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dispatcher.stats_report().log(),
                }
            }
        }));

        let dispatcher = self.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                dispatcher.cfg.rate_adjust_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dispatcher.adjust_rate(),
                }
            }
        }));

        tracing::info!("[Dispatcher] Background loops started");
    }

    /// Cancel the loops, wait for them, and flush the registry.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.registry.save().await {
            tracing::error!("[Dispatcher] Registry flush on shutdown failed: {}", e);
        }
        tracing::info!("[Dispatcher] Shut down");
    }

    /// Health sweep plus dry-run logins for long-idle accounts.
    async fn run_sweep(&self) {
        for username in self.health.sweep() {
            let Some(account) = self.registry.find_by_username(&username).await else {
                continue;
            };
            if !account.usable || account.is_locked {
                continue;
            }
            match self.session.ensure_login(&account).await {
                Ok(_) => tracing::debug!(
                    "[Dispatcher] Dry-run login ok for idle account {}",
                    mask_username(&username)
                ),
                Err(e) => {
                    let kind = classify_error(&e.message);
                    tracing::warn!(
                        "[Dispatcher] Dry-run login failed for {} ({}): {}",
                        mask_username(&username),
                        kind.as_str(),
                        e.message
                    );
                    if !self.health.on_failure(&username, kind, &e.message) {
                        self.persist_unusable(&username, kind).await;
                    }
                }
            }
        }
    }

    /// Rate adjustment: mean success rate > 0.9 speeds up, < 0.7 halves.
    fn adjust_rate(&self) {
        let Some(mean) = self.health.mean_success_rate() else {
            return;
        };
        let mut rate = self.global_rate.write();
        let old = *rate;
        if mean > 0.9 {
            *rate = (old * 1.1).min(GLOBAL_RATE_MAX);
        } else if mean < 0.7 {
            *rate = (old * 0.5).max(GLOBAL_RATE_MIN);
        }
        if (*rate - old).abs() > f64::EPSILON {
            tracing::info!(
                "[Dispatcher] Global rate {:.2} -> {:.2} req/s (mean success {:.2})",
                old,
                *rate,
                mean
            );
        }
    }

    pub fn stats_report(&self) -> StatsReport {
        StatsReport {
            generated_at: Utc::now().timestamp(),
            accounts_tracked: self.health.tracked(),
            status_counts: self.health.status_counts(),
            in_flight: self.gate.in_flight(),
            gate_capacity: self.gate.capacity(),
            breaker_state: self.breaker.state().as_str(),
            breaker_failures: self.breaker.failure_count(),
            proxies_total: self.pool.len(),
            proxies_assigned: self.pool.assigned(),
            window_occupancy: self.health.window_occupancy(),
            global_rate: *self.global_rate.read(),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            memory_bytes: monitor::process_memory_bytes(),
        }
    }

    pub fn global_rate(&self) -> f64 {
        *self.global_rate.read()
    }
}

fn none_slots<T>(n: usize) -> Vec<Option<T>> {
    (0..n).map(|_| None).collect()
}
