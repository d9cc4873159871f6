//! Loyalty engine: one handle over the config store, the points ledger and
//! the voucher manager, plus intake helpers for the booking and review
//! subsystems.
//!
//! Intake is explicit. The booking and review owners call these helpers
//! when their own records complete; nothing here reacts to other writes, and
//! callers remain responsible for not reporting the same booking twice.

use marketplace_core::config::AppConfig;
use marketplace_core::loyalty::{Transaction, TransactionCategory, TransactionRef};
use marketplace_core::{Clock, LoyaltyError, LoyaltyResult, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config_store::ConfigStore;
use crate::ledger::Ledger;
use crate::store::AccountStore;
use crate::tier::TierEngine;
use crate::voucher::VoucherManager;

pub struct LoyaltyEngine {
    config: Arc<ConfigStore>,
    ledger: Arc<Ledger>,
    vouchers: Arc<VoucherManager>,
}

impl LoyaltyEngine {
    pub fn new(app: &AppConfig) -> LoyaltyResult<Self> {
        Self::with_clock(app, Arc::new(SystemClock))
    }

    pub fn with_clock(app: &AppConfig, clock: Arc<dyn Clock>) -> LoyaltyResult<Self> {
        let lock_timeout = Duration::from_millis(app.ledger.lock_timeout_ms);
        let config = Arc::new(ConfigStore::with_clock(app.loyalty.clone(), clock.clone())?);
        let store = Arc::new(AccountStore::new(lock_timeout));
        let ledger = Arc::new(Ledger::new(config.clone(), store, clock));
        let vouchers = Arc::new(VoucherManager::new(ledger.clone(), lock_timeout));

        info!(
            lock_timeout_ms = app.ledger.lock_timeout_ms,
            base_tier = %config.active().base_tier(),
            "Loyalty engine initialized"
        );
        Ok(Self {
            config,
            ledger,
            vouchers,
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn vouchers(&self) -> &Arc<VoucherManager> {
        &self.vouchers
    }

    /// Award points for a completed booking worth `amount`, scaled by the
    /// account's tier multiplier. Returns `None` when the amount is too small
    /// to earn a whole point.
    pub fn record_booking_completed(
        &self,
        account_id: &str,
        booking_id: &str,
        amount: f64,
    ) -> LoyaltyResult<Option<Transaction>> {
        let config = self.config.active();
        let tier = match self.ledger.account(account_id) {
            Ok(account) => account.tier,
            Err(LoyaltyError::AccountNotFound(_)) => config.base_tier().to_string(),
            Err(e) => return Err(e),
        };
        let points = TierEngine::new(&config).suggested_points(&tier, amount);
        if points == 0 {
            debug!(account_id, booking_id, amount, "Booking too small to earn points");
            return Ok(None);
        }

        let points = i64::try_from(points).unwrap_or(i64::MAX);
        self.ledger
            .earn(
                account_id,
                points,
                TransactionCategory::EarnBooking,
                &format!("Completed booking {booking_id}"),
                Some(TransactionRef::Booking(booking_id.to_string())),
            )
            .map(Some)
    }

    /// Award the flat review bonus.
    pub fn record_review_submitted(
        &self,
        account_id: &str,
        review_id: &str,
    ) -> LoyaltyResult<Option<Transaction>> {
        let config = self.config.active();
        let points = config.program.review_points;
        if points == 0 {
            return Ok(None);
        }

        let points = i64::try_from(points).unwrap_or(i64::MAX);
        self.ledger
            .earn(
                account_id,
                points,
                TransactionCategory::EarnReview,
                &format!("Review {review_id}"),
                Some(TransactionRef::Review(review_id.to_string())),
            )
            .map(Some)
    }

    /// Inactivity expiry across accounts, then a voucher expiry sweep.
    /// Neither is required for correctness.
    pub fn run_maintenance(&self) -> (usize, usize) {
        let points = self.ledger.expire_all_points().len();
        let vouchers = self.vouchers.sweep_expired();
        info!(
            expired_balances = points,
            expired_vouchers = vouchers,
            "Loyalty maintenance complete"
        );
        (points, vouchers)
    }
}
