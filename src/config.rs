//! Configuration Types
//!
//! Tunables for the token manager, with defaults sized for hourly-expiring
//! provider tokens.

use std::time::Duration;

/// Retry policy for the refresh call itself.
///
/// The inter-attempt delay is a pure function of the attempt index:
/// `initial_delay * multiplier^attempt`, capped at `max_delay`. Deterministic
/// by design so the schedule can be unit-tested without sleeping.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per refresh, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Cap on the inter-attempt delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after the given zero-based attempt fails.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Token manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lead time for the reactive path: a record is stale once
    /// `now + lead_time >= expiry`.
    pub reactive_lead_time: Duration,
    /// Lead time for the background monitor. Larger than the reactive lead
    /// so the proactive refresh generally wins the race against callers.
    pub monitor_lead_time: Duration,
    /// Interval between monitor sweeps.
    pub monitor_interval: Duration,
    /// Upper bound on a single monitor-initiated refresh, so a hung provider
    /// call cannot wedge the sweep.
    pub monitor_refresh_timeout: Duration,
    /// Timeout for the token endpoint HTTP call.
    pub http_timeout: Duration,
    /// Minimum gap between repeat alerts for one open failure episode.
    pub notify_cooldown: Duration,
    /// Number of timestamped backups retained per identity.
    pub backup_retention: usize,
    /// Retry policy for the refresh call.
    pub retry: RetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reactive_lead_time: Duration::from_secs(300),
            monitor_lead_time: Duration::from_secs(600),
            monitor_interval: Duration::from_secs(120),
            monitor_refresh_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
            notify_cooldown: Duration::from_secs(3600),
            backup_retention: 5,
            retry: RetryConfig::default(),
        }
    }
}
