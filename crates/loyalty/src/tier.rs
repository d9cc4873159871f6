//! Tier computation over lifetime-earned points.
//!
//! Pure functions of the active config's ladder. Tiers only ever move up:
//! `promote` never returns a tier ranked below the current one.

use marketplace_core::loyalty::TierStatus;

use crate::config_store::ActiveConfig;

pub struct TierEngine<'a> {
    config: &'a ActiveConfig,
}

impl<'a> TierEngine<'a> {
    pub fn new(config: &'a ActiveConfig) -> Self {
        Self { config }
    }

    /// Highest rung whose threshold does not exceed `lifetime_earned`, plus
    /// progress toward the next rung.
    pub fn evaluate(&self, lifetime_earned: u64) -> TierStatus {
        let ladder = self.config.ladder();
        let index = ladder
            .iter()
            .rposition(|level| level.threshold <= lifetime_earned)
            .unwrap_or(0);
        let current = &ladder[index];

        match ladder.get(index + 1) {
            Some(next) => {
                let floor = current.threshold.min(lifetime_earned);
                let band = next.threshold - floor;
                let progressed = lifetime_earned - floor;
                TierStatus {
                    tier: current.name.clone(),
                    next_tier: Some(next.name.clone()),
                    points_to_next: next.threshold - lifetime_earned,
                    progress_percent: (progressed as f64 / band as f64 * 100.0).clamp(0.0, 100.0),
                }
            }
            None => TierStatus {
                tier: current.name.clone(),
                next_tier: None,
                points_to_next: 0,
                progress_percent: 100.0,
            },
        }
    }

    /// Advisory earning multiplier for `tier`.
    pub fn multiplier(&self, tier: &str) -> Option<f64> {
        self.config.multiplier(tier)
    }

    /// Points a caller should award for spending `amount` at `tier`. Unknown
    /// tiers earn at the base rate.
    pub fn suggested_points(&self, tier: &str, amount: f64) -> u64 {
        if !(amount.is_finite() && amount > 0.0) {
            return 0;
        }
        let multiplier = self
            .multiplier(tier)
            .unwrap_or(self.config.ladder()[0].multiplier);
        (amount * self.config.program.accrual_rate * multiplier).floor() as u64
    }

    /// The tier an account should hold after reaching `lifetime_earned`,
    /// or `None` when `current` already ranks at or above it.
    pub fn promote(&self, current: &str, lifetime_earned: u64) -> Option<String> {
        let computed = self.evaluate(lifetime_earned).tier;
        let computed_rank = self.config.rank(&computed);
        match self.config.rank(current) {
            Some(current_rank) if Some(current_rank) >= computed_rank => None,
            // A tier the ladder no longer names is replaced by the computed one.
            _ => Some(computed),
        }
    }

    /// Status for an account that holds `stored_tier`. The stored tier wins
    /// over the computed one so a retroactive reduction never shows a
    /// downgrade.
    pub fn status_for(&self, stored_tier: &str, lifetime_earned: u64) -> TierStatus {
        let computed = self.evaluate(lifetime_earned);
        let Some(stored_rank) = self.config.rank(stored_tier) else {
            return computed;
        };
        if self.config.rank(&computed.tier) >= Some(stored_rank) {
            return computed;
        }

        let ladder = self.config.ladder();
        match ladder.get(stored_rank + 1) {
            Some(next) => TierStatus {
                tier: stored_tier.to_string(),
                next_tier: Some(next.name.clone()),
                points_to_next: next.threshold.saturating_sub(lifetime_earned),
                progress_percent: 0.0,
            },
            None => TierStatus {
                tier: stored_tier.to_string(),
                next_tier: None,
                points_to_next: 0,
                progress_percent: 100.0,
            },
        }
    }
}
