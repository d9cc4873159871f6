use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `LOYALTY__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub loyalty: LoyaltyProgramConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// How long a mutation waits for a contended account before giving up.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_validation_per_minute")]
    pub validation_per_minute: u32,
    #[serde(default = "default_redemption_per_minute")]
    pub redemption_per_minute: u32,
}

fn default_lock_timeout_ms() -> u64 {
    250
}
fn default_validation_per_minute() -> u32 {
    10
}
fn default_redemption_per_minute() -> u32 {
    3
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            validation_per_minute: default_validation_per_minute(),
            redemption_per_minute: default_redemption_per_minute(),
        }
    }
}

// ─── Loyalty Program Config ─────────────────────────────────────────────────

/// Raw loyalty program parameters. Validation happens when a snapshot is
/// activated, not at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoyaltyProgramConfig {
    /// Points awarded per currency unit spent.
    #[serde(default = "default_accrual_rate")]
    pub accrual_rate: f64,
    /// Currency value of one point (0.1 means 10 points buy 1 unit).
    #[serde(default = "default_redemption_rate")]
    pub redemption_rate: f64,
    #[serde(default = "default_min_redemption_points")]
    pub min_redemption_points: u64,
    #[serde(default = "default_voucher_denominations")]
    pub voucher_denominations: Vec<f64>,
    /// Tier name to cumulative lifetime-points floor.
    #[serde(default = "default_tier_thresholds")]
    pub tier_thresholds: BTreeMap<String, u64>,
    /// Tier name to advisory earning multiplier.
    #[serde(default = "default_tier_multipliers")]
    pub tier_multipliers: BTreeMap<String, f64>,
    /// Tier held by accounts below the lowest threshold.
    #[serde(default = "default_base_tier")]
    pub base_tier: String,
    #[serde(default = "default_points_expiry_months")]
    pub points_expiry_months: u32,
    #[serde(default = "default_voucher_validity_days")]
    pub voucher_validity_days: u32,
    /// Flat award for a submitted review.
    #[serde(default = "default_review_points")]
    pub review_points: u64,
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,
}

fn default_accrual_rate() -> f64 {
    1.0
}
fn default_redemption_rate() -> f64 {
    0.1
}
fn default_min_redemption_points() -> u64 {
    500
}
fn default_voucher_denominations() -> Vec<f64> {
    vec![50.0, 100.0, 250.0, 500.0]
}
fn default_tier_thresholds() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("silver".to_string(), 1_000),
        ("gold".to_string(), 5_000),
        ("platinum".to_string(), 15_000),
    ])
}
fn default_tier_multipliers() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("bronze".to_string(), 1.0),
        ("silver".to_string(), 1.25),
        ("gold".to_string(), 1.5),
        ("platinum".to_string(), 2.0),
    ])
}
fn default_base_tier() -> String {
    "bronze".to_string()
}
fn default_points_expiry_months() -> u32 {
    12
}
fn default_voucher_validity_days() -> u32 {
    90
}
fn default_review_points() -> u64 {
    50
}
fn default_code_prefix() -> String {
    "MKT".to_string()
}

impl Default for LoyaltyProgramConfig {
    fn default() -> Self {
        Self {
            accrual_rate: default_accrual_rate(),
            redemption_rate: default_redemption_rate(),
            min_redemption_points: default_min_redemption_points(),
            voucher_denominations: default_voucher_denominations(),
            tier_thresholds: default_tier_thresholds(),
            tier_multipliers: default_tier_multipliers(),
            base_tier: default_base_tier(),
            points_expiry_months: default_points_expiry_months(),
            voucher_validity_days: default_voucher_validity_days(),
            review_points: default_review_points(),
            code_prefix: default_code_prefix(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (`LOYALTY__LEDGER__LOCK_TIMEOUT_MS=500`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("LOYALTY")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("loyalty.voucher_denominations"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_populated() {
        let config = AppConfig::default();
        assert_eq!(config.loyalty.base_tier, "bronze");
        assert_eq!(config.loyalty.tier_thresholds.get("silver"), Some(&1_000));
        assert_eq!(config.ledger.lock_timeout_ms, 250);
        assert!(config.throttle.redemption_per_minute < config.throttle.validation_per_minute);
    }

    #[test]
    fn test_partial_program_config_fills_defaults() {
        let raw = r#"{ "redemption_rate": 0.05, "voucher_denominations": [10.0] }"#;
        let program: LoyaltyProgramConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(program.redemption_rate, 0.05);
        assert_eq!(program.voucher_denominations, vec![10.0]);
        assert_eq!(program.voucher_validity_days, 90);
        assert_eq!(program.code_prefix, "MKT");
    }
}
