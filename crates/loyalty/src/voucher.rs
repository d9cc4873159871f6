//! Voucher lifecycle: redeem points for a fixed-value voucher, then apply,
//! cancel (full refund), or let it expire.
//!
//! States: `active` → `used` | `expired` | `cancelled`, all terminal.
//! Expiry is lazy: every read or mutation first flips an active voucher past
//! its expiry to `expired`. `sweep_expired` does the same in bulk but nothing
//! depends on it running.
//!
//! A voucher is consumed whole. Applying a 100 voucher to a 60 purchase
//! discounts 60 and forfeits the remaining 40; there is no partial balance.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use marketplace_core::loyalty::{
    ApplyOutcome, ApplyPreview, Transaction, TransactionCategory, TransactionRef, Voucher,
    VoucherPayload, VoucherStatus,
};
use marketplace_core::{LoyaltyError, LoyaltyResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::code::{generate_code, validate_code, with_suffix};
use crate::ledger::Ledger;

/// Fresh random codes tried before falling back to a numeric suffix.
const RANDOM_CODE_ATTEMPTS: u32 = 5;

pub struct VoucherManager {
    ledger: Arc<Ledger>,
    vouchers: DashMap<String, Arc<Mutex<Voucher>>>,
    /// Codes issued to each account, in issue order.
    by_account: DashMap<String, Vec<String>>,
    lock_timeout: Duration,
}

impl VoucherManager {
    pub fn new(ledger: Arc<Ledger>, lock_timeout: Duration) -> Self {
        Self {
            ledger,
            vouchers: DashMap::new(),
            by_account: DashMap::new(),
            lock_timeout,
        }
    }

    /// Exchange points for an active voucher worth `denomination`.
    pub fn redeem(&self, account_id: &str, denomination: f64) -> LoyaltyResult<Voucher> {
        let config = self.ledger.config().active();
        let Some(points_cost) = config.points_cost(denomination) else {
            warn!(account_id, denomination, "Denomination not offered");
            return Err(LoyaltyError::DenominationNotOffered(denomination));
        };
        let validity = config.voucher_validity();
        let prefix = config.program.code_prefix.as_str();

        let (_, voucher) = self.ledger.debit_with(
            account_id,
            points_cost,
            TransactionCategory::RedeemVoucher,
            format!("Redeemed {points_cost} points for a {denomination} voucher"),
            config.program.min_redemption_points,
            |now| {
                let voucher = self.mint(
                    account_id,
                    denomination,
                    points_cost,
                    config.version,
                    prefix,
                    now,
                    validity,
                );
                (Some(TransactionRef::Voucher(voucher.code.clone())), voucher)
            },
        )?;

        metrics::counter!("loyalty.vouchers_redeemed").increment(1);
        info!(
            account_id,
            code = %voucher.code,
            face_value = voucher.face_value,
            points_cost,
            expires_at = %voucher.expires_at,
            "Voucher redeemed"
        );
        Ok(voucher)
    }

    /// Insert a new active voucher under a globally unique code.
    #[allow(clippy::too_many_arguments)]
    fn mint(
        &self,
        account_id: &str,
        face_value: f64,
        points_cost: u64,
        config_version: u64,
        prefix: &str,
        now: DateTime<Utc>,
        validity: ChronoDuration,
    ) -> Voucher {
        let mut rng = rand::thread_rng();
        let base = generate_code(prefix, now, &mut rng);
        let mut candidate = base.clone();
        let mut collisions = 0;

        loop {
            match self.vouchers.entry(candidate) {
                Entry::Vacant(slot) => {
                    let voucher = Voucher {
                        code: slot.key().clone(),
                        account_id: account_id.to_string(),
                        face_value,
                        points_cost,
                        status: VoucherStatus::Active,
                        config_version,
                        created_at: now,
                        expires_at: now + validity,
                        used_at: None,
                        usage_amount: 0.0,
                        purchase_ref: None,
                        cancelled_at: None,
                        cancel_reason: None,
                    };
                    slot.insert(Arc::new(Mutex::new(voucher.clone())));
                    self.by_account
                        .entry(account_id.to_string())
                        .or_default()
                        .push(voucher.code.clone());
                    return voucher;
                }
                Entry::Occupied(taken) => {
                    collisions += 1;
                    metrics::counter!("loyalty.voucher_code_collisions").increment(1);
                    debug!(code = %taken.key(), collisions, "Voucher code collision");
                    candidate = if collisions < RANDOM_CODE_ATTEMPTS {
                        generate_code(prefix, now, &mut rng)
                    } else {
                        with_suffix(&base, collisions - RANDOM_CODE_ATTEMPTS + 2)
                    };
                }
            }
        }
    }

    /// Usable voucher owned by `account_id`.
    pub fn validate(&self, code: &str, account_id: &str) -> LoyaltyResult<Voucher> {
        self.with_voucher(code, account_id, |voucher, _| {
            ensure_active(voucher)?;
            Ok(voucher.clone())
        })
    }

    /// Discount breakdown without consuming the voucher.
    pub fn preview_apply(
        &self,
        code: &str,
        account_id: &str,
        amount: f64,
    ) -> LoyaltyResult<ApplyPreview> {
        ensure_purchase_amount(amount)?;
        self.with_voucher(code, account_id, |voucher, _| {
            ensure_active(voucher)?;
            Ok(voucher.preview(amount))
        })
    }

    /// Consume the voucher against a purchase. The full face value is marked
    /// used even when the purchase is smaller.
    pub fn apply(
        &self,
        code: &str,
        account_id: &str,
        amount: f64,
        purchase_ref: &str,
    ) -> LoyaltyResult<ApplyOutcome> {
        ensure_purchase_amount(amount)?;
        let (outcome, preview) = self.with_voucher(code, account_id, |voucher, now| {
            if voucher.status == VoucherStatus::Used {
                return Err(LoyaltyError::AlreadyUsed);
            }
            ensure_active(voucher)?;

            let preview = voucher.preview(amount);
            voucher.status = VoucherStatus::Used;
            voucher.used_at = Some(now);
            voucher.usage_amount = voucher.face_value;
            voucher.purchase_ref = Some(purchase_ref.to_string());
            Ok((
                ApplyOutcome {
                    discount: preview.discount,
                    final_amount: preview.final_amount,
                },
                preview,
            ))
        })?;

        metrics::counter!("loyalty.vouchers_applied").increment(1);
        info!(
            account_id,
            code,
            purchase_ref,
            discount = outcome.discount,
            wasted = preview.wasted_amount,
            "Voucher applied"
        );
        Ok(outcome)
    }

    /// Cancel an active voucher and refund its full points cost.
    ///
    /// The refund is an earning transaction, so it raises `lifetime_earned`
    /// again after the redemption counted the cost as redeemed. Repeated
    /// redeem and cancel cycles therefore move an account up the tier
    /// ladder.
    pub fn cancel(&self, code: &str, account_id: &str, reason: &str) -> LoyaltyResult<Transaction> {
        let refund = self.with_voucher(code, account_id, |voucher, now| {
            ensure_active(voucher)?;
            let points_cost = voucher.points_cost;
            let points = i64::try_from(points_cost).map_err(|_| {
                LoyaltyError::InvalidAmount(format!("{points_cost} points is out of range"))
            })?;

            let refund = self.ledger.earn(
                account_id,
                points,
                TransactionCategory::RefundVoucherCancelled,
                &format!("Refund for cancelled voucher {}: {reason}", voucher.code),
                Some(TransactionRef::Voucher(voucher.code.clone())),
            )?;

            voucher.status = VoucherStatus::Cancelled;
            voucher.cancelled_at = Some(now);
            voucher.cancel_reason = Some(reason.to_string());
            Ok(refund)
        })?;

        metrics::counter!("loyalty.vouchers_cancelled").increment(1);
        info!(
            account_id,
            code,
            reason,
            refunded = refund.delta,
            "Voucher cancelled"
        );
        Ok(refund)
    }

    /// The voucher in whatever state it is in, for display.
    pub fn find(&self, code: &str, account_id: &str) -> LoyaltyResult<Voucher> {
        self.with_voucher(code, account_id, |voucher, _| Ok(voucher.clone()))
    }

    pub fn payload(&self, code: &str, account_id: &str) -> LoyaltyResult<VoucherPayload> {
        self.with_voucher(code, account_id, |voucher, _| Ok(voucher.payload()))
    }

    /// Every voucher owned by `account_id`, oldest first, with lazy expiry
    /// applied. Only this account's vouchers are locked.
    pub fn vouchers_for(&self, account_id: &str) -> LoyaltyResult<Vec<Voucher>> {
        let codes = self
            .by_account
            .get(account_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let now = self.ledger.now();
        let mut owned = Vec::with_capacity(codes.len());
        for code in codes {
            let Some(slot) = self.vouchers.get(&code).map(|entry| entry.value().clone()) else {
                continue;
            };
            let mut voucher = self.lock(&slot)?;
            refresh(&mut *voucher, now);
            owned.push(voucher.clone());
        }
        owned.sort_by_key(|v| v.created_at);
        Ok(owned)
    }

    /// Flip every expired-but-active voucher. Idempotent; vouchers that are
    /// busy are left for lazy expiry.
    pub fn sweep_expired(&self) -> usize {
        let now = self.ledger.now();
        let expired = self
            .slots()
            .iter()
            .filter_map(|slot| slot.try_lock_for(self.lock_timeout))
            .map(|mut voucher| refresh(&mut *voucher, now))
            .filter(|flipped| *flipped)
            .count();
        if expired > 0 {
            info!(expired, "Voucher expiry sweep");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.vouchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vouchers.is_empty()
    }

    fn slots(&self) -> Vec<Arc<Mutex<Voucher>>> {
        self.vouchers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn lock<'a>(
        &self,
        slot: &'a Mutex<Voucher>,
    ) -> LoyaltyResult<parking_lot::MutexGuard<'a, Voucher>> {
        slot.try_lock_for(self.lock_timeout).ok_or_else(|| {
            metrics::counter!("loyalty.lock_timeouts").increment(1);
            LoyaltyError::ConcurrentModification("voucher".to_string())
        })
    }

    /// Format check, lookup, lock, lazy expiry, ownership check, then `f`.
    /// A voucher owned by someone else is reported as not found.
    fn with_voucher<R>(
        &self,
        code: &str,
        account_id: &str,
        f: impl FnOnce(&mut Voucher, DateTime<Utc>) -> LoyaltyResult<R>,
    ) -> LoyaltyResult<R> {
        let code = validate_code(code)?;
        let slot = self
            .vouchers
            .get(code)
            .map(|entry| entry.value().clone())
            .ok_or(LoyaltyError::NotFound)?;

        let mut voucher = self.lock(&slot)?;
        let now = self.ledger.now();
        refresh(&mut *voucher, now);
        if voucher.account_id != account_id {
            return Err(LoyaltyError::NotFound);
        }
        f(&mut *voucher, now)
    }
}

fn refresh(voucher: &mut Voucher, now: DateTime<Utc>) -> bool {
    let flipped = voucher.refresh_expiry(now);
    if flipped {
        metrics::counter!("loyalty.vouchers_expired").increment(1);
        debug!(code = %voucher.code, expires_at = %voucher.expires_at, "Voucher expired");
    }
    flipped
}

fn ensure_active(voucher: &Voucher) -> LoyaltyResult<()> {
    match voucher.status.unusable_reason() {
        None => Ok(()),
        Some(reason) => Err(LoyaltyError::NotUsable(reason)),
    }
}

fn ensure_purchase_amount(amount: f64) -> LoyaltyResult<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(LoyaltyError::InvalidAmount(format!(
            "purchase amount must be positive, got {amount}"
        )))
    }
}
