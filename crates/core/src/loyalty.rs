//! Loyalty ledger domain types: accounts, immutable transactions, tier
//! status, and fixed-value vouchers.
//!
//! Points are integers. Currency amounts (voucher face values, purchase
//! totals) are whole-currency `f64` values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UnusableReason;

// ─── Accounts ───────────────────────────────────────────────────────────────

/// Per-user points balance and lifetime counters.
///
/// `balance == lifetime_earned - lifetime_redeemed` holds after every
/// committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub balance: u64,
    pub lifetime_earned: u64,
    /// Every non-administrative debit: voucher redemptions and expiries.
    pub lifetime_redeemed: u64,
    /// Highest tier ever reached. Never lowered automatically.
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub last_earn_at: Option<DateTime<Utc>>,
    pub last_redeem_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(account_id: &str, base_tier: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            balance: 0,
            lifetime_earned: 0,
            lifetime_redeemed: 0,
            tier: base_tier.to_string(),
            created_at: now,
            last_earn_at: None,
            last_redeem_at: None,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.lifetime_earned.checked_sub(self.lifetime_redeemed) == Some(self.balance)
    }
}

// ─── Transactions ───────────────────────────────────────────────────────────

/// What caused a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    EarnBooking,
    EarnReview,
    EarnReferral,
    EarnPromotion,
    RedeemVoucher,
    RefundVoucherCancelled,
    AdminAdjustment,
    Expiry,
}

impl TransactionCategory {
    /// Categories accepted by `Ledger::earn`.
    pub fn is_earning(&self) -> bool {
        matches!(
            self,
            TransactionCategory::EarnBooking
                | TransactionCategory::EarnReview
                | TransactionCategory::EarnReferral
                | TransactionCategory::EarnPromotion
                | TransactionCategory::RefundVoucherCancelled
        )
    }

    /// Categories accepted by `Ledger::spend`.
    pub fn is_spending(&self) -> bool {
        matches!(
            self,
            TransactionCategory::RedeemVoucher | TransactionCategory::Expiry
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionCategory::EarnBooking => "earn_booking",
            TransactionCategory::EarnReview => "earn_review",
            TransactionCategory::EarnReferral => "earn_referral",
            TransactionCategory::EarnPromotion => "earn_promotion",
            TransactionCategory::RedeemVoucher => "redeem_voucher",
            TransactionCategory::RefundVoucherCancelled => "refund_voucher_cancelled",
            TransactionCategory::AdminAdjustment => "admin_adjustment",
            TransactionCategory::Expiry => "expiry",
        }
    }
}

/// Link from a ledger entry to the object that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TransactionRef {
    Booking(String),
    Review(String),
    Referral(String),
    Voucher(String),
}

/// One immutable, signed ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: String,
    /// Position in the account's log, starting at 1.
    pub sequence: u64,
    /// Never zero.
    pub delta: i64,
    pub balance_after: u64,
    pub category: TransactionCategory,
    pub description: String,
    pub reference: Option<TransactionRef>,
    /// Operator responsible for an administrative adjustment.
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Tiers ──────────────────────────────────────────────────────────────────

/// Tier standing computed from lifetime-earned points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStatus {
    pub tier: String,
    pub next_tier: Option<String>,
    pub points_to_next: u64,
    /// Progress through the current band, 0.0..=100.0.
    pub progress_percent: f64,
}

// ─── Vouchers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherStatus {
    Active,
    Used,
    Expired,
    Cancelled,
}

impl VoucherStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VoucherStatus::Active)
    }

    /// Reason a voucher in this status cannot be used, `None` when active.
    pub fn unusable_reason(&self) -> Option<UnusableReason> {
        match self {
            VoucherStatus::Active => None,
            VoucherStatus::Used => Some(UnusableReason::Used),
            VoucherStatus::Expired => Some(UnusableReason::Expired),
            VoucherStatus::Cancelled => Some(UnusableReason::Cancelled),
        }
    }
}

/// A fixed-value voucher bought with points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub code: String,
    pub account_id: String,
    pub face_value: f64,
    pub points_cost: u64,
    pub status: VoucherStatus,
    /// Version of the program config the voucher was issued under.
    pub config_version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    /// Zero until used, then the full face value.
    pub usage_amount: f64,
    pub purchase_ref: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Voucher {
    /// Lazy expiry: flips an active voucher past its expiry to `Expired`.
    /// Returns true when the status changed.
    pub fn refresh_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == VoucherStatus::Active && now > self.expires_at {
            self.status = VoucherStatus::Expired;
            true
        } else {
            false
        }
    }

    /// Discount breakdown for applying this voucher to `amount`.
    pub fn preview(&self, amount: f64) -> ApplyPreview {
        let discount = self.face_value.min(amount);
        ApplyPreview {
            discount,
            final_amount: amount - discount,
            wasted_amount: self.face_value - discount,
        }
    }

    pub fn payload(&self) -> VoucherPayload {
        VoucherPayload {
            kind: "voucher".to_string(),
            code: self.code.clone(),
            face_value: self.face_value,
            account_id: self.account_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Read-only result of previewing a voucher against a purchase amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApplyPreview {
    pub discount: f64,
    pub final_amount: f64,
    /// Face value forfeited because the purchase was smaller.
    pub wasted_amount: f64,
}

/// Result of consuming a voucher against a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub discount: f64,
    pub final_amount: f64,
}

/// Machine-readable voucher data for scanning or display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    pub face_value: f64,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VoucherPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
