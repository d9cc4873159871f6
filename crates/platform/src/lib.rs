//! Boundary helpers for callers that expose the loyalty ledger over a
//! network: attempt throttling for voucher validation and redemption.

pub mod rate_limit;

pub use rate_limit::{AttemptKind, AttemptThrottle, ThrottleResult};
