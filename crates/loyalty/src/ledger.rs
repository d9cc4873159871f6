//! Points ledger: earn, spend, administrative adjustment and inactivity
//! expiry over per-account transaction logs.
//!
//! Every mutation validates and commits under the account's lock, so either
//! the balance, counters and log all change together or nothing does.

use chrono::{DateTime, Utc};
use marketplace_core::loyalty::{
    Account, TierStatus, Transaction, TransactionCategory, TransactionRef,
};
use marketplace_core::{Clock, LoyaltyError, LoyaltyResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config_store::{ActiveConfig, ConfigStore};
use crate::store::{AccountRecord, AccountStore};
use crate::tier::TierEngine;

pub struct Ledger {
    config: Arc<ConfigStore>,
    store: Arc<AccountStore>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(config: Arc<ConfigStore>, store: Arc<AccountStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create the account for a new user. Opening an existing account
    /// returns it unchanged.
    pub fn open_account(&self, account_id: &str) -> LoyaltyResult<Account> {
        let config = self.config.active();
        self.store
            .with_account_or_open(account_id, config.base_tier(), self.now(), |record| {
                Ok(record.account().clone())
            })
    }

    /// Credit `points` to an account, creating it on first earn, and promote
    /// its tier when lifetime points cross a threshold.
    pub fn earn(
        &self,
        account_id: &str,
        points: i64,
        category: TransactionCategory,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> LoyaltyResult<Transaction> {
        if points <= 0 {
            return Err(LoyaltyError::InvalidAmount(format!(
                "earned points must be positive, got {points}"
            )));
        }
        if !category.is_earning() {
            return Err(LoyaltyError::InvalidAmount(format!(
                "category {} cannot earn points",
                category.as_str()
            )));
        }

        let config = self.config.active();
        let now = self.now();
        let transaction = self.store.with_account_or_open(
            account_id,
            config.base_tier(),
            now,
            |record| {
                ensure_headroom(record, points.unsigned_abs())?;
                let transaction = record.post(
                    points,
                    category,
                    description.to_string(),
                    reference,
                    None,
                    now,
                );
                promote_tier(&config, record);
                Ok(transaction)
            },
        )?;

        metrics::counter!("loyalty.points_earned").increment(points.unsigned_abs());
        debug!(
            account_id,
            points,
            category = category.as_str(),
            balance = transaction.balance_after,
            "Points earned"
        );
        Ok(transaction)
    }

    /// Debit `points` from an account.
    pub fn spend(
        &self,
        account_id: &str,
        points: i64,
        category: TransactionCategory,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> LoyaltyResult<Transaction> {
        if points <= 0 {
            return Err(LoyaltyError::InvalidAmount(format!(
                "spent points must be positive, got {points}"
            )));
        }
        if !category.is_spending() {
            return Err(LoyaltyError::InvalidAmount(format!(
                "category {} cannot spend points",
                category.as_str()
            )));
        }

        let (transaction, ()) = self.debit_with(
            account_id,
            points.unsigned_abs(),
            category,
            description.to_string(),
            0,
            |_| (reference, ()),
        )?;
        Ok(transaction)
    }

    /// Debit under the account lock after checking the balance covers both
    /// `points` and `min_balance`. `attach` runs after validation and before
    /// the transaction is appended; it must not fail.
    pub(crate) fn debit_with<T>(
        &self,
        account_id: &str,
        points: u64,
        category: TransactionCategory,
        description: String,
        min_balance: u64,
        attach: impl FnOnce(DateTime<Utc>) -> (Option<TransactionRef>, T),
    ) -> LoyaltyResult<(Transaction, T)> {
        let now = self.now();
        let result = self.store.with_account(account_id, |record| {
            let available = record.account().balance;
            let required = points.max(min_balance);
            if available < required {
                return Err(LoyaltyError::InsufficientBalance {
                    requested: required,
                    available,
                });
            }
            let delta = signed(points)?;
            let (reference, attached) = attach(now);
            let transaction = record.post(-delta, category, description, reference, None, now);
            Ok((transaction, attached))
        });

        match &result {
            Ok((transaction, _)) => {
                metrics::counter!("loyalty.points_spent").increment(points);
                debug!(
                    account_id,
                    points,
                    category = category.as_str(),
                    balance = transaction.balance_after,
                    "Points spent"
                );
            }
            Err(e) => debug!(account_id, points, error = %e, "Spend rejected"),
        }
        result
    }

    /// Support correction: any non-zero delta, never taking the balance
    /// below zero. Positive corrections count as earned points.
    pub fn admin_adjust(
        &self,
        account_id: &str,
        delta: i64,
        actor: &str,
        reason: &str,
    ) -> LoyaltyResult<Transaction> {
        if delta == 0 {
            return Err(LoyaltyError::InvalidAmount(
                "adjustment must be non-zero".to_string(),
            ));
        }

        let config = self.config.active();
        let now = self.now();
        let apply = |record: &mut AccountRecord| -> LoyaltyResult<Transaction> {
            let magnitude = delta.unsigned_abs();
            if delta < 0 && magnitude > record.account().balance {
                return Err(LoyaltyError::InsufficientBalance {
                    requested: magnitude,
                    available: record.account().balance,
                });
            }
            if delta > 0 {
                ensure_headroom(record, magnitude)?;
            }
            let transaction = record.post(
                delta,
                TransactionCategory::AdminAdjustment,
                reason.to_string(),
                None,
                Some(actor.to_string()),
                now,
            );
            if delta > 0 {
                promote_tier(&config, record);
            }
            Ok(transaction)
        };

        let transaction = if delta > 0 {
            self.store
                .with_account_or_open(account_id, config.base_tier(), now, apply)?
        } else {
            self.store.with_account(account_id, apply)?
        };

        info!(
            account_id,
            delta,
            actor,
            reason,
            balance = transaction.balance_after,
            "Admin adjustment applied"
        );
        Ok(transaction)
    }

    /// Expire the whole balance of an account whose last earning activity is
    /// older than the configured window. Returns `None` when nothing expired.
    pub fn expire_points(&self, account_id: &str) -> LoyaltyResult<Option<Transaction>> {
        let config = self.config.active();
        let now = self.now();
        let cutoff = config.points_expiry_cutoff(now);

        let expired = self.store.with_account(account_id, |record| {
            let account = record.account();
            let last_activity = account.last_earn_at.unwrap_or(account.created_at);
            if account.balance == 0 || last_activity >= cutoff {
                return Ok(None);
            }
            let balance = account.balance;
            let description = format!(
                "{balance} points expired after {} months without earning",
                config.program.points_expiry_months
            );
            let delta = signed(balance)?;
            Ok(Some(record.post(
                -delta,
                TransactionCategory::Expiry,
                description,
                None,
                None,
                now,
            )))
        })?;

        if let Some(transaction) = &expired {
            metrics::counter!("loyalty.points_expired").increment(transaction.delta.unsigned_abs());
            info!(
                account_id,
                points = transaction.delta.unsigned_abs(),
                "Points expired"
            );
        }
        Ok(expired)
    }

    /// Run `expire_points` over every account. Accounts that are busy are
    /// skipped and picked up on the next run.
    pub fn expire_all_points(&self) -> Vec<Transaction> {
        let mut expired = Vec::new();
        for account_id in self.store.account_ids() {
            match self.expire_points(&account_id) {
                Ok(Some(transaction)) => expired.push(transaction),
                Ok(None) => {}
                Err(e) => warn!(account_id = %account_id, error = %e, "Skipped points expiry"),
            }
        }
        expired
    }

    pub fn account(&self, account_id: &str) -> LoyaltyResult<Account> {
        self.store
            .with_account(account_id, |record| Ok(record.account().clone()))
    }

    /// Transactions in creation order.
    pub fn transactions(&self, account_id: &str) -> LoyaltyResult<Vec<Transaction>> {
        self.store
            .with_account(account_id, |record| Ok(record.transactions().to_vec()))
    }

    pub fn tier_status(&self, account_id: &str) -> LoyaltyResult<TierStatus> {
        let config = self.config.active();
        let account = self.account(account_id)?;
        Ok(TierEngine::new(&config).status_for(&account.tier, account.lifetime_earned))
    }

    /// Replay the account's log against its stored balance and counters.
    pub fn verify(&self, account_id: &str) -> LoyaltyResult<()> {
        let record = self.store.snapshot(account_id)?;
        record
            .verify()
            .map_err(|detail| LoyaltyError::LedgerCorrupted {
                account_id: account_id.to_string(),
                detail,
            })
    }
}

fn signed(points: u64) -> LoyaltyResult<i64> {
    i64::try_from(points)
        .map_err(|_| LoyaltyError::InvalidAmount(format!("{points} points is out of range")))
}

fn ensure_headroom(record: &AccountRecord, points: u64) -> LoyaltyResult<()> {
    let account = record.account();
    let fits = account
        .lifetime_earned
        .checked_add(points)
        .and_then(|earned| i64::try_from(earned).ok())
        .is_some();
    if fits {
        Ok(())
    } else {
        Err(LoyaltyError::InvalidAmount(format!(
            "crediting {points} points would overflow the account"
        )))
    }
}

fn promote_tier(config: &ActiveConfig, record: &mut AccountRecord) {
    let account = record.account();
    let Some(new_tier) = TierEngine::new(config).promote(&account.tier, account.lifetime_earned)
    else {
        return;
    };

    metrics::counter!("loyalty.tier_upgrades").increment(1);
    info!(
        account_id = %account.account_id,
        old = %account.tier,
        new = %new_tier,
        lifetime_earned = account.lifetime_earned,
        "Tier upgrade"
    );
    record.set_tier(new_tier);
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_core::config::LoyaltyProgramConfig;
    use marketplace_core::ManualClock;
    use std::time::Duration;

    fn ledger_with_clock(clock: Arc<ManualClock>) -> Ledger {
        let config = Arc::new(
            ConfigStore::with_clock(LoyaltyProgramConfig::default(), clock.clone()).unwrap(),
        );
        let store = Arc::new(AccountStore::new(Duration::from_millis(100)));
        Ledger::new(config, store, clock)
    }

    fn ledger() -> Ledger {
        ledger_with_clock(Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_earn_creates_account_and_promotes() {
        let ledger = ledger();
        let tx = ledger
            .earn("user-1", 500, TransactionCategory::EarnBooking, "booking", None)
            .unwrap();
        assert_eq!(tx.balance_after, 500);
        assert_eq!(ledger.account("user-1").unwrap().tier, "bronze");

        ledger
            .earn(
                "user-1",
                600,
                TransactionCategory::EarnBooking,
                "booking",
                Some(TransactionRef::Booking("bk-2".into())),
            )
            .unwrap();
        let account = ledger.account("user-1").unwrap();
        assert_eq!(account.balance, 1100);
        assert_eq!(account.lifetime_earned, 1100);
        assert_eq!(account.tier, "silver");
    }

    #[test]
    fn test_earn_rejects_non_positive() {
        let ledger = ledger();
        for points in [0, -5] {
            let err = ledger
                .earn("user-1", points, TransactionCategory::EarnReview, "x", None)
                .unwrap_err();
            assert!(matches!(err, LoyaltyError::InvalidAmount(_)));
        }
        assert!(matches!(
            ledger.account("user-1"),
            Err(LoyaltyError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_earn_rejects_spending_category() {
        let ledger = ledger();
        let err = ledger
            .earn("user-1", 10, TransactionCategory::RedeemVoucher, "x", None)
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidAmount(_)));
    }

    #[test]
    fn test_spend_insufficient_changes_nothing() {
        let ledger = ledger();
        ledger
            .earn("user-1", 100, TransactionCategory::EarnReview, "review", None)
            .unwrap();
        let err = ledger
            .spend("user-1", 101, TransactionCategory::RedeemVoucher, "voucher", None)
            .unwrap_err();
        assert!(matches!(
            err,
            LoyaltyError::InsufficientBalance {
                requested: 101,
                available: 100
            }
        ));
        assert_eq!(ledger.account("user-1").unwrap().balance, 100);
        assert_eq!(ledger.transactions("user-1").unwrap().len(), 1);
    }

    #[test]
    fn test_spend_records_negative_delta() {
        let ledger = ledger();
        ledger
            .earn("user-1", 100, TransactionCategory::EarnReview, "review", None)
            .unwrap();
        let tx = ledger
            .spend("user-1", 40, TransactionCategory::RedeemVoucher, "voucher", None)
            .unwrap();
        assert_eq!(tx.delta, -40);
        assert_eq!(tx.balance_after, 60);
        let account = ledger.account("user-1").unwrap();
        assert_eq!(account.lifetime_redeemed, 40);
        assert!(account.is_balanced());
    }

    #[test]
    fn test_spend_unknown_account() {
        let err = ledger()
            .spend("ghost", 1, TransactionCategory::RedeemVoucher, "x", None)
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::AccountNotFound(_)));
    }

    #[test]
    fn test_admin_adjust_floor_and_tier_persistence() {
        let ledger = ledger();
        ledger
            .earn("user-1", 1200, TransactionCategory::EarnBooking, "booking", None)
            .unwrap();
        assert_eq!(ledger.account("user-1").unwrap().tier, "silver");

        let err = ledger.admin_adjust("user-1", -1201, "ops", "too much").unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientBalance { .. }));

        let tx = ledger.admin_adjust("user-1", -1200, "ops", "fraud reversal").unwrap();
        assert_eq!(tx.balance_after, 0);
        assert_eq!(tx.actor.as_deref(), Some("ops"));

        let account = ledger.account("user-1").unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.lifetime_earned, 0);
        assert_eq!(account.tier, "silver");
        assert!(ledger.verify("user-1").is_ok());

        let status = ledger.tier_status("user-1").unwrap();
        assert_eq!(status.tier, "silver");
    }

    #[test]
    fn test_admin_adjust_zero_rejected() {
        let err = ledger().admin_adjust("user-1", 0, "ops", "noop").unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidAmount(_)));
    }

    #[test]
    fn test_expire_points_after_inactivity() {
        let clock = Arc::new(ManualClock::default());
        let ledger = ledger_with_clock(clock.clone());
        ledger
            .earn("user-1", 300, TransactionCategory::EarnBooking, "booking", None)
            .unwrap();

        assert!(ledger.expire_points("user-1").unwrap().is_none());

        clock.advance(chrono::Duration::days(370));
        let tx = ledger.expire_points("user-1").unwrap().unwrap();
        assert_eq!(tx.delta, -300);
        assert_eq!(tx.category, TransactionCategory::Expiry);

        let account = ledger.account("user-1").unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.lifetime_redeemed, 300);
        assert!(ledger.expire_points("user-1").unwrap().is_none());
        assert!(ledger.verify("user-1").is_ok());
    }

    #[test]
    fn test_expire_all_points_skips_recent() {
        let clock = Arc::new(ManualClock::default());
        let ledger = ledger_with_clock(clock.clone());
        ledger
            .earn("old", 50, TransactionCategory::EarnReview, "review", None)
            .unwrap();
        clock.advance(chrono::Duration::days(400));
        ledger
            .earn("fresh", 70, TransactionCategory::EarnReview, "review", None)
            .unwrap();

        let expired = ledger.expire_all_points();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].account_id, "old");
        assert_eq!(ledger.account("fresh").unwrap().balance, 70);
    }

    #[test]
    fn test_open_account_is_idempotent() {
        let ledger = ledger();
        let first = ledger.open_account("user-1").unwrap();
        ledger
            .earn("user-1", 5, TransactionCategory::EarnReview, "review", None)
            .unwrap();
        let again = ledger.open_account("user-1").unwrap();
        assert_eq!(first.created_at, again.created_at);
        assert_eq!(again.balance, 5);
    }
}
