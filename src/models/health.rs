use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Bounded history caps
pub const ERROR_HISTORY_CAP: usize = 25;
pub const RESPONSE_TIME_CAP: usize = 50;

/// Per-account health state machine states.
///
/// LOCKED, SUSPENDED and DISABLED are sinks: once entered they are left only
/// by admin action (or a process restart, since health is in-memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Probation,
    Cooldown,
    Disabled,
    Locked,
    Suspended,
}

impl HealthStatus {
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Locked | Self::Suspended | Self::Disabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Probation => "PROBATION",
            Self::Cooldown => "COOLDOWN",
            Self::Disabled => "DISABLED",
            Self::Locked => "LOCKED",
            Self::Suspended => "SUSPENDED",
        }
    }
}

/// Classified failure categories for upstream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    Network,
    RateLimit,
    Auth,
    NotFound,
    AccountLocked,
    AccountSuspended,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::RateLimit => "RATE_LIMIT",
            Self::Auth => "AUTH",
            Self::NotFound => "NOT_FOUND",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountSuspended => "ACCOUNT_SUSPENDED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// In-memory health record for one account. Not persisted across restarts.
#[derive(Debug, Clone, Serialize)]
pub struct AccountHealth {
    pub status: HealthStatus,
    pub request_count: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Most recent classified failures, oldest first
    pub error_history: VecDeque<ErrorRecord>,
    /// Round-trip times in milliseconds, oldest first
    pub response_times: VecDeque<u64>,
    /// Dispatch timestamps inside the rate-limit window, oldest first
    pub request_timestamps: VecDeque<DateTime<Utc>>,
    /// AUTH failure timestamps, trimmed to the disable window (24 h)
    pub auth_error_times: VecDeque<DateTime<Utc>>,
    pub error_counts: HashMap<ErrorKind, u64>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Last time any error counter moved, for idle resets
    pub counters_touched_at: Option<DateTime<Utc>>,
}

impl AccountHealth {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            request_count: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            error_history: VecDeque::new(),
            response_times: VecDeque::new(),
            request_timestamps: VecDeque::new(),
            auth_error_times: VecDeque::new(),
            error_counts: HashMap::new(),
            cooldown_until: None,
            last_used: None,
            last_success: None,
            counters_touched_at: None,
        }
    }

    pub fn push_error(&mut self, record: ErrorRecord) {
        if self.error_history.len() >= ERROR_HISTORY_CAP {
            self.error_history.pop_front();
        }
        *self.error_counts.entry(record.kind).or_insert(0) += 1;
        self.counters_touched_at = Some(record.at);
        self.error_history.push_back(record);
    }

    pub fn push_response_time(&mut self, rtt_ms: u64) {
        if self.response_times.len() >= RESPONSE_TIME_CAP {
            self.response_times.pop_front();
        }
        self.response_times.push_back(rtt_ms);
    }

    /// `(request_count − recent_errors) / request_count`, clamped to [0, 1].
    ///
    /// `recent_errors` is the length of the bounded error-history ring, so
    /// this is not a sliding ratio; an account with no requests reads 1.0.
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 1.0;
        }
        let errors = self.error_history.len() as f64;
        ((self.request_count as f64 - errors) / self.request_count as f64).clamp(0.0, 1.0)
    }

    /// Whether a cooldown is still holding the account at `now`.
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.status == HealthStatus::Cooldown
            && self.cooldown_until.map_or(false, |until| now < until)
    }

    pub fn reset_error_counters(&mut self) {
        self.error_counts.clear();
        self.consecutive_failures = 0;
        self.counters_touched_at = None;
    }
}

impl Default for AccountHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(kind: ErrorKind) -> ErrorRecord {
        ErrorRecord {
            kind,
            at: Utc::now(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut health = AccountHealth::new();
        for _ in 0..(ERROR_HISTORY_CAP + 10) {
            health.push_error(record(ErrorKind::Network));
        }
        assert_eq!(health.error_history.len(), ERROR_HISTORY_CAP);
        assert_eq!(
            health.error_counts[&ErrorKind::Network],
            (ERROR_HISTORY_CAP + 10) as u64
        );
    }

    #[test]
    fn test_response_times_are_bounded() {
        let mut health = AccountHealth::new();
        for rtt in 0..(RESPONSE_TIME_CAP as u64 + 5) {
            health.push_response_time(rtt);
        }
        assert_eq!(health.response_times.len(), RESPONSE_TIME_CAP);
        // Oldest entries were evicted
        assert_eq!(*health.response_times.front().unwrap(), 5);
    }

    #[test]
    fn test_success_rate() {
        let mut health = AccountHealth::new();
        assert_eq!(health.success_rate(), 1.0);

        health.request_count = 10;
        health.push_error(record(ErrorKind::Unknown));
        health.push_error(record(ErrorKind::Unknown));
        assert!((health.success_rate() - 0.8).abs() < f64::EPSILON);

        // More recorded errors than requests clamps to zero
        health.request_count = 1;
        assert_eq!(health.success_rate(), 0.0);
    }

    #[test]
    fn test_is_cooling() {
        let now = Utc::now();
        let mut health = AccountHealth::new();
        health.status = HealthStatus::Cooldown;
        health.cooldown_until = Some(now + Duration::seconds(30));
        assert!(health.is_cooling(now));
        assert!(!health.is_cooling(now + Duration::seconds(31)));

        health.status = HealthStatus::Healthy;
        assert!(!health.is_cooling(now));
    }

    #[test]
    fn test_sink_states() {
        assert!(HealthStatus::Locked.is_sink());
        assert!(HealthStatus::Suspended.is_sink());
        assert!(HealthStatus::Disabled.is_sink());
        assert!(!HealthStatus::Healthy.is_sink());
        assert!(!HealthStatus::Probation.is_sink());
        assert!(!HealthStatus::Cooldown.is_sink());
    }
}
