//! Versioned program configuration with a single active snapshot.
//!
//! Every ledger and voucher operation fetches `ConfigStore::active()` once at
//! its start and uses that snapshot for the whole operation.

use chrono::{DateTime, Duration, Months, Utc};
use marketplace_core::config::LoyaltyProgramConfig;
use marketplace_core::{Clock, LoyaltyError, LoyaltyResult, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const DENOMINATION_EPSILON: f64 = 1e-9;
const POINTS_COST_TOLERANCE: f64 = 1e-6;
const MAX_CODE_PREFIX_LEN: usize = 8;

/// One rung of the tier ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierLevel {
    pub name: String,
    pub threshold: u64,
    pub multiplier: f64,
}

/// A validated, immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub version: u64,
    pub activated_at: DateTime<Utc>,
    /// Program parameters with denominations sorted and de-duplicated.
    pub program: LoyaltyProgramConfig,
    ladder: Vec<TierLevel>,
}

impl ActiveConfig {
    fn build(
        mut program: LoyaltyProgramConfig,
        version: u64,
        activated_at: DateTime<Utc>,
    ) -> LoyaltyResult<Self> {
        if !(program.accrual_rate.is_finite() && program.accrual_rate > 0.0) {
            return Err(invalid("accrual_rate must be a positive number"));
        }
        if !(program.redemption_rate.is_finite() && program.redemption_rate > 0.0) {
            return Err(invalid("redemption_rate must be a positive number"));
        }

        if program.voucher_denominations.is_empty() {
            return Err(invalid("voucher_denominations must not be empty"));
        }
        if let Some(bad) = program
            .voucher_denominations
            .iter()
            .find(|d| !(d.is_finite() && **d > 0.0))
        {
            return Err(invalid(format!("denomination {bad} must be positive")));
        }
        program.voucher_denominations.sort_by(|a, b| a.total_cmp(b));
        program
            .voucher_denominations
            .dedup_by(|a, b| (*a - *b).abs() < DENOMINATION_EPSILON);
        for denomination in &program.voucher_denominations {
            if whole_points(*denomination, program.redemption_rate).is_none() {
                return Err(invalid(format!(
                    "denomination {denomination} does not convert to a whole number of points at rate {}",
                    program.redemption_rate
                )));
            }
        }

        if program.voucher_validity_days == 0 {
            return Err(invalid("voucher_validity_days must be at least 1"));
        }
        if program.points_expiry_months == 0 {
            return Err(invalid("points_expiry_months must be at least 1"));
        }
        if program.code_prefix.is_empty()
            || program.code_prefix.len() > MAX_CODE_PREFIX_LEN
            || !program
                .code_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(invalid(format!(
                "code_prefix must be 1-{MAX_CODE_PREFIX_LEN} uppercase letters or digits"
            )));
        }

        let ladder = build_ladder(&program)?;

        Ok(Self {
            version,
            activated_at,
            program,
            ladder,
        })
    }

    /// Tier ladder ordered by ascending threshold, base tier first.
    pub fn ladder(&self) -> &[TierLevel] {
        &self.ladder
    }

    pub fn base_tier(&self) -> &str {
        &self.ladder[0].name
    }

    /// Position of `tier` on the ladder; `None` for names the ladder no
    /// longer contains.
    pub fn rank(&self, tier: &str) -> Option<usize> {
        self.ladder.iter().position(|level| level.name == tier)
    }

    pub fn multiplier(&self, tier: &str) -> Option<f64> {
        self.ladder
            .iter()
            .find(|level| level.name == tier)
            .map(|level| level.multiplier)
    }

    pub fn denominations(&self) -> &[f64] {
        &self.program.voucher_denominations
    }

    /// Points needed to buy a voucher of `denomination`, or `None` when the
    /// denomination is not offered.
    pub fn points_cost(&self, denomination: f64) -> Option<u64> {
        self.program
            .voucher_denominations
            .iter()
            .find(|offered| (**offered - denomination).abs() < DENOMINATION_EPSILON)
            .and_then(|offered| whole_points(*offered, self.program.redemption_rate))
    }

    pub fn voucher_validity(&self) -> Duration {
        Duration::days(i64::from(self.program.voucher_validity_days))
    }

    /// Earning activity before this instant makes a balance eligible for
    /// expiry.
    pub fn points_expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_months(Months::new(self.program.points_expiry_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn invalid(reason: impl Into<String>) -> LoyaltyError {
    LoyaltyError::ConfigInvalid(reason.into())
}

fn whole_points(denomination: f64, redemption_rate: f64) -> Option<u64> {
    let exact = denomination / redemption_rate;
    let rounded = exact.round();
    if rounded < 1.0 || (exact - rounded).abs() > POINTS_COST_TOLERANCE * exact.max(1.0) {
        return None;
    }
    Some(rounded as u64)
}

fn build_ladder(program: &LoyaltyProgramConfig) -> LoyaltyResult<Vec<TierLevel>> {
    if program.base_tier.is_empty() {
        return Err(invalid("base_tier must be named"));
    }

    let mut floors: Vec<(String, u64)> = program
        .tier_thresholds
        .iter()
        .map(|(name, floor)| (name.clone(), *floor))
        .collect();
    floors.sort_by_key(|(_, floor)| *floor);

    match floors.iter().position(|(name, _)| *name == program.base_tier) {
        Some(0) => {}
        Some(_) => {
            return Err(invalid(format!(
                "base tier '{}' must have the lowest threshold",
                program.base_tier
            )))
        }
        None => floors.insert(0, (program.base_tier.clone(), 0)),
    }

    for pair in floors.windows(2) {
        if pair[1].1 <= pair[0].1 {
            return Err(invalid(format!(
                "tier thresholds must be strictly ascending: '{}' ({}) then '{}' ({})",
                pair[0].0, pair[0].1, pair[1].0, pair[1].1
            )));
        }
    }

    let mut ladder = Vec::with_capacity(floors.len());
    for (name, threshold) in floors {
        let multiplier = *program
            .tier_multipliers
            .get(&name)
            .ok_or_else(|| invalid(format!("tier '{name}' has no multiplier")))?;
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(invalid(format!("multiplier for '{name}' must be positive")));
        }
        ladder.push(TierLevel {
            name,
            threshold,
            multiplier,
        });
    }

    for pair in ladder.windows(2) {
        if pair[1].multiplier < pair[0].multiplier {
            return Err(invalid(format!(
                "tier multipliers must be non-decreasing: '{}' ({}) then '{}' ({})",
                pair[0].name, pair[0].multiplier, pair[1].name, pair[1].multiplier
            )));
        }
    }

    Ok(ladder)
}

/// Holds exactly one active configuration plus the snapshots it replaced.
pub struct ConfigStore {
    active: RwLock<Arc<ActiveConfig>>,
    history: Mutex<Vec<Arc<ActiveConfig>>>,
    clock: Arc<dyn Clock>,
}

impl ConfigStore {
    /// Create a store whose first active snapshot is `program` (version 1).
    pub fn new(program: LoyaltyProgramConfig) -> LoyaltyResult<Self> {
        Self::with_clock(program, Arc::new(SystemClock))
    }

    /// Like `new`, stamping activations with `clock`.
    pub fn with_clock(
        program: LoyaltyProgramConfig,
        clock: Arc<dyn Clock>,
    ) -> LoyaltyResult<Self> {
        let initial = Arc::new(ActiveConfig::build(program, 1, clock.now())?);
        info!(
            version = initial.version,
            tiers = initial.ladder.len(),
            denominations = ?initial.program.voucher_denominations,
            "Loyalty config initialized"
        );
        Ok(Self {
            active: RwLock::new(initial),
            history: Mutex::new(Vec::new()),
            clock,
        })
    }

    /// Current snapshot.
    pub fn active(&self) -> Arc<ActiveConfig> {
        self.active.read().clone()
    }

    /// Validate and atomically swap in a new snapshot. On failure the
    /// previous snapshot stays active.
    pub fn activate(&self, program: LoyaltyProgramConfig) -> LoyaltyResult<Arc<ActiveConfig>> {
        let mut active = self.active.write();
        let next = match ActiveConfig::build(program, active.version + 1, self.clock.now()) {
            Ok(next) => Arc::new(next),
            Err(e) => {
                warn!(version = active.version, error = %e, "Rejected loyalty config");
                return Err(e);
            }
        };

        let previous = std::mem::replace(&mut *active, next.clone());
        self.history.lock().push(previous);

        info!(
            version = next.version,
            redemption_rate = next.program.redemption_rate,
            "Loyalty config activated"
        );
        Ok(next)
    }

    /// Deactivated snapshots, oldest first.
    pub fn history(&self) -> Vec<Arc<ActiveConfig>> {
        self.history.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn program() -> LoyaltyProgramConfig {
        LoyaltyProgramConfig {
            voucher_denominations: vec![500.0, 100.0, 100.0],
            redemption_rate: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_snapshot_is_version_one() {
        let store = ConfigStore::new(program()).unwrap();
        let active = store.active();
        assert_eq!(active.version, 1);
        assert_eq!(active.denominations(), &[100.0, 500.0]);
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_points_cost_from_redemption_rate() {
        let store = ConfigStore::new(program()).unwrap();
        let active = store.active();
        assert_eq!(active.points_cost(100.0), Some(1000));
        assert_eq!(active.points_cost(500.0), Some(5000));
        assert_eq!(active.points_cost(250.0), None);
    }

    #[test]
    fn test_ladder_prepends_base_tier() {
        let store = ConfigStore::new(program()).unwrap();
        let active = store.active();
        let names: Vec<&str> = active.ladder().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["bronze", "silver", "gold", "platinum"]);
        assert_eq!(active.ladder()[0].threshold, 0);
        assert_eq!(active.multiplier("gold"), Some(1.5));
        assert_eq!(active.rank("silver"), Some(1));
        assert_eq!(active.rank("diamond"), None);
    }

    #[test]
    fn test_activate_replaces_and_keeps_history() {
        let store = ConfigStore::new(program()).unwrap();
        let mut next = program();
        next.redemption_rate = 0.05;

        let activated = store.activate(next).unwrap();
        assert_eq!(activated.version, 2);
        assert_eq!(store.active().version, 2);
        assert_eq!(store.active().points_cost(100.0), Some(2000));

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
    }

    #[test]
    fn test_activation_times_come_from_clock() {
        let clock = Arc::new(marketplace_core::ManualClock::default());
        let store = ConfigStore::with_clock(program(), clock.clone()).unwrap();
        assert_eq!(store.active().activated_at, clock.now());

        clock.advance(Duration::days(3));
        let next = store.activate(program()).unwrap();
        assert_eq!(next.activated_at, clock.now());
        assert_eq!(store.history()[0].activated_at, clock.now() - Duration::days(3));
    }

    #[test]
    fn test_rejected_config_keeps_previous_active() {
        let store = ConfigStore::new(program()).unwrap();
        let mut bad = program();
        bad.voucher_denominations.clear();

        let err = store.activate(bad).unwrap_err();
        assert!(matches!(err, LoyaltyError::ConfigInvalid(_)));
        assert_eq!(store.active().version, 1);
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_duplicate_thresholds_rejected() {
        let mut bad = program();
        bad.tier_thresholds = BTreeMap::from([
            ("silver".to_string(), 1000),
            ("gold".to_string(), 1000),
        ]);
        assert!(matches!(
            ConfigStore::new(bad),
            Err(LoyaltyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_decreasing_multiplier_rejected() {
        let mut bad = program();
        bad.tier_multipliers.insert("gold".to_string(), 1.1);
        assert!(matches!(
            ConfigStore::new(bad),
            Err(LoyaltyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_missing_base_multiplier_rejected() {
        let mut bad = program();
        bad.tier_multipliers.remove("bronze");
        assert!(matches!(
            ConfigStore::new(bad),
            Err(LoyaltyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_non_positive_denomination_rejected() {
        let mut bad = program();
        bad.voucher_denominations = vec![100.0, -5.0];
        assert!(matches!(
            ConfigStore::new(bad),
            Err(LoyaltyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_fractional_points_cost_rejected() {
        let mut bad = program();
        bad.redemption_rate = 0.3;
        bad.voucher_denominations = vec![100.0];
        assert!(matches!(
            ConfigStore::new(bad),
            Err(LoyaltyError::ConfigInvalid(_))
        ));
    }
}
