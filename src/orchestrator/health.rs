// Health tracker module
//
// Per-account state machine over sliding request/error windows. Answers
// "may this account dispatch now?" and folds classified outcomes into
// status transitions. State is in-memory only; terminal flags are
// persisted by the dispatcher through the registry.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::models::{
    mask_username, AccountHealth, ErrorKind, ErrorRecord, HealthStatus, OrchestratorConfig,
};

/// Tracker tunables, lifted out of the full config so tests can shrink the
/// windows without touching unrelated knobs.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub requests_per_window: usize,
    pub window: Duration,
    pub cooldown: Duration,
    pub auth_disable_threshold: usize,
    pub auth_error_window: Duration,
    pub idle_counter_reset: Duration,
    pub auth_cooldown_failures: u32,
    pub network_probation_failures: u32,
    pub unknown_probation_failures: u32,
    pub probation_promote_successes: u32,
}

impl From<&OrchestratorConfig> for HealthConfig {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            requests_per_window: cfg.requests_per_window,
            window: Duration::seconds(cfg.rate_window_secs as i64),
            cooldown: Duration::seconds(cfg.cooldown_secs as i64),
            auth_disable_threshold: cfg.auth_disable_threshold,
            auth_error_window: Duration::seconds(cfg.auth_error_window_secs as i64),
            idle_counter_reset: Duration::seconds(cfg.idle_counter_reset_secs as i64),
            auth_cooldown_failures: cfg.auth_cooldown_failures,
            network_probation_failures: cfg.network_probation_failures,
            unknown_probation_failures: cfg.unknown_probation_failures,
            probation_promote_successes: cfg.probation_promote_successes,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

/// Verdict of the per-account rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// Refused; the window frees a slot after this wait
    RateLimited(StdDuration),
}

pub struct HealthTracker {
    entries: DashMap<String, AccountHealth>,
    cfg: HealthConfig,
}

impl HealthTracker {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            entries: DashMap::new(),
            cfg,
        }
    }

    /// Clone of the record, lazily created HEALTHY.
    pub fn snapshot(&self, username: &str) -> AccountHealth {
        self.entries
            .entry(username.to_string())
            .or_default()
            .clone()
    }

    pub fn status_of(&self, username: &str) -> HealthStatus {
        self.entries
            .entry(username.to_string())
            .or_default()
            .status
    }

    pub fn success_rate(&self, username: &str) -> f64 {
        self.entries
            .entry(username.to_string())
            .or_default()
            .success_rate()
    }

    /// Whether the account may dispatch now, rate-window wise. Trims the
    /// window as a side effect.
    pub fn can_request(&self, username: &str) -> Admission {
        let now = Utc::now();
        let mut entry = self.entries.entry(username.to_string()).or_default();
        Self::trim_window(&mut entry.request_timestamps, now, self.cfg.window);

        if entry.request_timestamps.len() >= self.cfg.requests_per_window {
            let wait = match entry.request_timestamps.front() {
                Some(oldest) => self.cfg.window - (now - *oldest),
                // Zero-capacity window: the full window is the wait
                None => self.cfg.window,
            };
            Admission::RateLimited(wait.to_std().unwrap_or(StdDuration::ZERO))
        } else {
            Admission::Ready
        }
    }

    /// Count a dispatch against the window.
    pub fn record_request(&self, username: &str) {
        let now = Utc::now();
        let mut entry = self.entries.entry(username.to_string()).or_default();
        entry.request_timestamps.push_back(now);
        entry.request_count += 1;
        entry.last_used = Some(now);
    }

    pub fn on_success(&self, username: &str, rtt_ms: u64) {
        let now = Utc::now();
        let mut entry = self.entries.entry(username.to_string()).or_default();
        entry.consecutive_successes += 1;
        entry.consecutive_failures = 0;
        entry.last_success = Some(now);
        entry.push_response_time(rtt_ms);

        if entry.status == HealthStatus::Probation
            && entry.consecutive_successes >= self.cfg.probation_promote_successes
        {
            entry.status = HealthStatus::Healthy;
            tracing::info!(
                "[Health] Account {} promoted PROBATION -> HEALTHY",
                mask_username(username)
            );
        }
    }

    /// Fold a classified failure into the state machine. Returns false when
    /// the account must be marked unusable externally (terminal states).
    pub fn on_failure(&self, username: &str, kind: ErrorKind, message: &str) -> bool {
        let now = Utc::now();
        let mut entry = self.entries.entry(username.to_string()).or_default();

        entry.consecutive_successes = 0;
        if kind == ErrorKind::NotFound {
            // Benign: a missing resource says nothing about the account
            entry.consecutive_failures = entry.consecutive_failures.saturating_sub(1);
        } else {
            entry.consecutive_failures += 1;
        }
        entry.push_error(ErrorRecord {
            kind,
            at: now,
            message: message.to_string(),
        });

        if kind == ErrorKind::Auth {
            entry.auth_error_times.push_back(now);
            Self::trim_window(&mut entry.auth_error_times, now, self.cfg.auth_error_window);
        }

        if entry.status.is_sink() {
            return false;
        }

        let masked = mask_username(username);
        match kind {
            ErrorKind::AccountLocked => {
                entry.status = HealthStatus::Locked;
                tracing::warn!("[Health] Account {} LOCKED: {}", masked, message);
                false
            }
            ErrorKind::AccountSuspended => {
                entry.status = HealthStatus::Suspended;
                tracing::warn!("[Health] Account {} SUSPENDED: {}", masked, message);
                false
            }
            // A timed-out session is indistinguishable from a silently
            // rate-limited one; it must not be retried on this account.
            ErrorKind::Timeout => {
                entry.status = HealthStatus::Suspended;
                tracing::warn!("[Health] Account {} SUSPENDED after timeout", masked);
                false
            }
            ErrorKind::Auth => {
                if entry.auth_error_times.len() >= self.cfg.auth_disable_threshold {
                    entry.status = HealthStatus::Disabled;
                    tracing::warn!(
                        "[Health] Account {} DISABLED: {} auth errors in window",
                        masked,
                        entry.auth_error_times.len()
                    );
                    return false;
                }
                if entry.consecutive_failures >= self.cfg.auth_cooldown_failures {
                    Self::start_cooldown(&mut entry, now, self.cfg.cooldown, &masked);
                }
                true
            }
            ErrorKind::RateLimit => {
                Self::start_cooldown(&mut entry, now, self.cfg.cooldown, &masked);
                true
            }
            ErrorKind::Network => {
                if entry.consecutive_failures >= self.cfg.network_probation_failures {
                    entry.status = HealthStatus::Probation;
                    tracing::info!("[Health] Account {} on PROBATION (network)", masked);
                }
                true
            }
            ErrorKind::NotFound => true,
            ErrorKind::Unknown => {
                if entry.consecutive_failures >= self.cfg.unknown_probation_failures {
                    entry.status = HealthStatus::Probation;
                    tracing::info!("[Health] Account {} on PROBATION (unknown)", masked);
                }
                true
            }
        }
    }

    fn start_cooldown(
        entry: &mut AccountHealth,
        now: DateTime<Utc>,
        cooldown: Duration,
        masked: &str,
    ) {
        entry.status = HealthStatus::Cooldown;
        entry.cooldown_until = Some(now + cooldown);
        tracing::info!(
            "[Health] Account {} cooling down for {}s",
            masked,
            cooldown.num_seconds()
        );
    }

    /// Periodic maintenance: trim windows, expire cooldowns, reset idle
    /// error counters. Returns usernames of non-terminal accounts idle
    /// longer than the cooldown duration, for a dry-run login upstream.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut revive = Vec::new();

        for mut item in self.entries.iter_mut() {
            let username = item.key().clone();
            let entry = item.value_mut();

            Self::trim_window(&mut entry.request_timestamps, now, self.cfg.window);
            Self::trim_window(&mut entry.auth_error_times, now, self.cfg.auth_error_window);

            if entry.status == HealthStatus::Cooldown {
                let expired = entry.cooldown_until.map_or(true, |until| now >= until);
                if expired {
                    entry.status = HealthStatus::Probation;
                    entry.cooldown_until = None;
                    tracing::info!(
                        "[Health] Account {} cooldown expired, on PROBATION",
                        mask_username(&username)
                    );
                }
            }

            if let Some(touched) = entry.counters_touched_at {
                if now - touched >= self.cfg.idle_counter_reset {
                    entry.reset_error_counters();
                    tracing::debug!(
                        "[Health] Account {} idle error counters reset",
                        mask_username(&username)
                    );
                }
            }

            if !entry.status.is_sink() {
                if let Some(last_used) = entry.last_used {
                    if now - last_used > self.cfg.cooldown {
                        revive.push(username);
                    }
                }
            }
        }

        revive
    }

    // ── Snapshots for the stats report ─────────────────────────────────

    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for item in self.entries.iter() {
            *counts.entry(item.value().status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Mean success rate over non-terminal accounts; None when there are
    /// none.
    pub fn mean_success_rate(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for item in self.entries.iter() {
            if !item.value().status.is_sink() {
                sum += item.value().success_rate();
                n += 1;
            }
        }
        (n > 0).then(|| sum / n as f64)
    }

    /// Mean fraction of the rate window in use across tracked accounts.
    pub fn window_occupancy(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for item in self.entries.iter() {
            sum += item.value().request_timestamps.len() as f64
                / self.cfg.requests_per_window as f64;
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    fn trim_window(
        timestamps: &mut std::collections::VecDeque<DateTime<Utc>>,
        now: DateTime<Utc>,
        window: Duration,
    ) {
        let cutoff = now - window;
        while timestamps.front().map_or(false, |t| *t < cutoff) {
            timestamps.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthConfig::default())
    }

    fn small_window_tracker(cap: usize, window_secs: i64) -> HealthTracker {
        let mut cfg = HealthConfig::default();
        cfg.requests_per_window = cap;
        cfg.window = Duration::seconds(window_secs);
        HealthTracker::new(cfg)
    }

    #[test]
    fn test_lazy_entry_is_healthy() {
        let t = tracker();
        assert_eq!(t.status_of("alice"), HealthStatus::Healthy);
        assert_eq!(t.snapshot("alice").request_count, 0);
    }

    #[test]
    fn test_window_refuses_at_capacity() {
        let t = small_window_tracker(2, 60);
        assert_eq!(t.can_request("alice"), Admission::Ready);
        t.record_request("alice");
        t.record_request("alice");

        match t.can_request("alice") {
            Admission::RateLimited(wait) => {
                assert!(wait <= StdDuration::from_secs(60));
                assert!(wait > StdDuration::from_secs(55));
            }
            Admission::Ready => panic!("window at capacity must refuse"),
        }
        // Another account is unaffected
        assert_eq!(t.can_request("bob"), Admission::Ready);
    }

    #[test]
    fn test_window_invariant_holds_after_trim() {
        let t = small_window_tracker(5, 60);
        for _ in 0..5 {
            t.record_request("alice");
        }
        let _ = t.can_request("alice");
        assert!(t.snapshot("alice").request_timestamps.len() <= 5);
    }

    #[test]
    fn test_locked_is_terminal() {
        let t = tracker();
        let keep = t.on_failure("alice", ErrorKind::AccountLocked, "code 326");
        assert!(!keep);
        assert_eq!(t.status_of("alice"), HealthStatus::Locked);

        // A later benign failure does not leave the sink
        let keep = t.on_failure("alice", ErrorKind::NotFound, "404");
        assert!(!keep);
        assert_eq!(t.status_of("alice"), HealthStatus::Locked);
    }

    #[test]
    fn test_suspended_on_401_and_timeout() {
        let t = tracker();
        assert!(!t.on_failure("alice", ErrorKind::AccountSuspended, "status 401"));
        assert_eq!(t.status_of("alice"), HealthStatus::Suspended);

        assert!(!t.on_failure("bob", ErrorKind::Timeout, "operation timed out"));
        assert_eq!(t.status_of("bob"), HealthStatus::Suspended);
    }

    #[test]
    fn test_auth_cooldown_after_consecutive_failures() {
        let t = tracker();
        for i in 0..4 {
            assert!(t.on_failure("alice", ErrorKind::Auth, "login failed"));
            assert_eq!(t.status_of("alice"), HealthStatus::Healthy, "failure {}", i);
        }
        assert!(t.on_failure("alice", ErrorKind::Auth, "login failed"));
        assert_eq!(t.status_of("alice"), HealthStatus::Cooldown);
        assert!(t.snapshot("alice").cooldown_until.is_some());
    }

    #[test]
    fn test_rate_limit_cooldown_is_immediate() {
        let t = tracker();
        assert!(t.on_failure("alice", ErrorKind::RateLimit, "429"));
        assert_eq!(t.status_of("alice"), HealthStatus::Cooldown);
    }

    #[test]
    fn test_network_probation_threshold() {
        let t = tracker();
        for _ in 0..9 {
            t.on_failure("alice", ErrorKind::Network, "connection refused");
        }
        assert_eq!(t.status_of("alice"), HealthStatus::Healthy);
        t.on_failure("alice", ErrorKind::Network, "connection refused");
        assert_eq!(t.status_of("alice"), HealthStatus::Probation);
    }

    #[test]
    fn test_not_found_decrements_failures() {
        let t = tracker();
        t.on_failure("alice", ErrorKind::Network, "connection refused");
        t.on_failure("alice", ErrorKind::Network, "connection refused");
        assert_eq!(t.snapshot("alice").consecutive_failures, 2);

        assert!(t.on_failure("alice", ErrorKind::NotFound, "404"));
        assert_eq!(t.snapshot("alice").consecutive_failures, 1);
        assert_eq!(t.status_of("alice"), HealthStatus::Healthy);
    }

    #[test]
    fn test_auth_disable_threshold_in_window() {
        let mut cfg = HealthConfig::default();
        cfg.auth_disable_threshold = 3;
        // Keep the consecutive-failure cooldown out of the way
        cfg.auth_cooldown_failures = 100;
        let t = HealthTracker::new(cfg);

        assert!(t.on_failure("alice", ErrorKind::Auth, "login failed"));
        assert!(t.on_failure("alice", ErrorKind::Auth, "login failed"));
        assert!(!t.on_failure("alice", ErrorKind::Auth, "login failed"));
        assert_eq!(t.status_of("alice"), HealthStatus::Disabled);
    }

    #[test]
    fn test_probation_promotes_after_three_successes() {
        let t = tracker();
        for _ in 0..10 {
            t.on_failure("alice", ErrorKind::Network, "socket hang up");
        }
        assert_eq!(t.status_of("alice"), HealthStatus::Probation);

        t.on_success("alice", 120);
        t.on_success("alice", 130);
        assert_eq!(t.status_of("alice"), HealthStatus::Probation);
        t.on_success("alice", 110);
        assert_eq!(t.status_of("alice"), HealthStatus::Healthy);
    }

    #[test]
    fn test_failure_resets_promotion_streak() {
        let t = tracker();
        for _ in 0..10 {
            t.on_failure("alice", ErrorKind::Network, "socket hang up");
        }
        t.on_success("alice", 100);
        t.on_success("alice", 100);
        t.on_failure("alice", ErrorKind::Unknown, "odd");
        t.on_success("alice", 100);
        t.on_success("alice", 100);
        // Streak restarted; still one short
        assert_eq!(t.status_of("alice"), HealthStatus::Probation);
        t.on_success("alice", 100);
        assert_eq!(t.status_of("alice"), HealthStatus::Healthy);
    }

    #[test]
    fn test_sweep_expires_cooldown_to_probation() {
        let t = tracker();
        t.on_failure("alice", ErrorKind::RateLimit, "429");
        assert_eq!(t.status_of("alice"), HealthStatus::Cooldown);

        // Backdate the deadline, then sweep
        t.entries.get_mut("alice").unwrap().cooldown_until =
            Some(Utc::now() - Duration::seconds(1));
        t.sweep();
        assert_eq!(t.status_of("alice"), HealthStatus::Probation);
    }

    #[test]
    fn test_sweep_resets_idle_counters() {
        let t = tracker();
        t.on_failure("alice", ErrorKind::Unknown, "odd");
        {
            let mut entry = t.entries.get_mut("alice").unwrap();
            entry.counters_touched_at = Some(Utc::now() - Duration::minutes(20));
        }
        t.sweep();
        let snap = t.snapshot("alice");
        assert!(snap.error_counts.is_empty());
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn test_sweep_reports_idle_accounts_for_revival() {
        let t = tracker();
        t.record_request("alice");
        t.record_request("bob");
        {
            let mut alice = t.entries.get_mut("alice").unwrap();
            alice.last_used = Some(Utc::now() - Duration::minutes(10));
        }
        {
            // Sinks are never revived
            let mut bob = t.entries.get_mut("bob").unwrap();
            bob.last_used = Some(Utc::now() - Duration::minutes(10));
            bob.status = HealthStatus::Suspended;
        }

        let revive = t.sweep();
        assert_eq!(revive, vec!["alice".to_string()]);
    }

    #[test]
    fn test_status_counts_and_mean_rate() {
        let t = tracker();
        t.record_request("alice");
        t.on_success("alice", 100);
        t.on_failure("bob", ErrorKind::AccountSuspended, "status 401");

        let counts = t.status_counts();
        assert_eq!(counts.get("HEALTHY"), Some(&1));
        assert_eq!(counts.get("SUSPENDED"), Some(&1));

        // Only the non-terminal account contributes
        assert_eq!(t.mean_success_rate(), Some(1.0));
    }
}
