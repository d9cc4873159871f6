//! Per-account attempt throttle for voucher validation and redemption,
//! backed by DashMap.
//!
//! Guessing voucher codes is cheap for an attacker, so a boundary exposing
//! `validate`/`preview_apply` checks here first. Redemption gets its own,
//! lower cap.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use marketplace_core::config::ThrottleConfig;
use marketplace_core::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Which cap an attempt counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Validation,
    Redemption,
}

/// Per-key fixed one-minute window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

/// Result returned by `check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

pub struct AttemptThrottle {
    windows: DashMap<(String, AttemptKind), AttemptWindow>,
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
}

impl AttemptThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn limit(&self, kind: AttemptKind) -> u32 {
        match kind {
            AttemptKind::Validation => self.config.validation_per_minute,
            AttemptKind::Redemption => self.config.redemption_per_minute,
        }
    }

    /// Check (and consume) one attempt for `account_id`.
    pub fn check(&self, account_id: &str, kind: AttemptKind) -> ThrottleResult {
        let limit = self.limit(kind);
        let now = self.clock.now();

        let mut entry = self
            .windows
            .entry((account_id.to_string(), kind))
            .or_insert_with(|| AttemptWindow {
                count: 0,
                window_start: now,
            });

        if now.signed_duration_since(entry.window_start) >= Duration::minutes(1) {
            entry.count = 0;
            entry.window_start = now;
        }
        let reset_at = entry.window_start + Duration::minutes(1);

        if entry.count < limit {
            entry.count += 1;
            ThrottleResult {
                allowed: true,
                remaining: limit - entry.count,
                reset_at,
                limit,
            }
        } else {
            metrics::counter!("loyalty.throttled_attempts").increment(1);
            warn!(account_id, kind = ?kind, limit, "Attempt throttled");
            ThrottleResult {
                allowed: false,
                remaining: 0,
                reset_at,
                limit,
            }
        }
    }

    /// Current window for a key, if any.
    pub fn usage(&self, account_id: &str, kind: AttemptKind) -> Option<AttemptWindow> {
        self.windows
            .get(&(account_id.to_string(), kind))
            .map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_core::ManualClock;

    fn throttle(clock: Arc<ManualClock>) -> AttemptThrottle {
        AttemptThrottle::with_clock(
            ThrottleConfig {
                validation_per_minute: 5,
                redemption_per_minute: 2,
            },
            clock,
        )
    }

    #[test]
    fn test_validation_cap() {
        let limiter = throttle(Arc::new(ManualClock::default()));

        for i in 0..5 {
            let result = limiter.check("user:1", AttemptKind::Validation);
            assert!(result.allowed, "attempt {i} should be allowed");
        }

        let result = limiter.check("user:1", AttemptKind::Validation);
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(limiter.usage("user:1", AttemptKind::Validation).unwrap().count, 5);
    }

    #[test]
    fn test_kinds_and_accounts_are_independent() {
        let limiter = throttle(Arc::new(ManualClock::default()));
        assert!(limiter.check("user:1", AttemptKind::Redemption).allowed);
        assert!(limiter.check("user:1", AttemptKind::Redemption).allowed);
        assert!(!limiter.check("user:1", AttemptKind::Redemption).allowed);

        assert!(limiter.check("user:1", AttemptKind::Validation).allowed);
        assert!(limiter.check("user:2", AttemptKind::Redemption).allowed);
    }

    #[test]
    fn test_window_resets_after_a_minute() {
        let clock = Arc::new(ManualClock::default());
        let limiter = throttle(clock.clone());
        limiter.check("user:1", AttemptKind::Redemption);
        limiter.check("user:1", AttemptKind::Redemption);
        assert!(!limiter.check("user:1", AttemptKind::Redemption).allowed);

        clock.advance(Duration::seconds(61));
        let result = limiter.check("user:1", AttemptKind::Redemption);
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.limit, 2);
    }
}
