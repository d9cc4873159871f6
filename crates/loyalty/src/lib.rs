//! Loyalty ledger: points accrual, tier standing, and fixed-value voucher
//! redemption over an append-only transaction log.
//!
//! Accounts are serialized per account id; different accounts never contend.
//! Storage is in-memory (`DashMap`) for development; the `AccountStore`
//! boundary is where a database-backed implementation slots in.

pub mod code;
pub mod config_store;
pub mod engine;
pub mod ledger;
pub mod store;
pub mod tier;
pub mod voucher;

pub use config_store::{ActiveConfig, ConfigStore, TierLevel};
pub use engine::LoyaltyEngine;
pub use ledger::Ledger;
pub use store::AccountStore;
pub use tier::TierEngine;
pub use voucher::VoucherManager;
