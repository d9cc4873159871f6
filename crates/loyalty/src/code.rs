//! Voucher code format: `{PREFIX}-{YYYYMMDD}-{6 base36 chars}`, with an
//! optional `-{n}` suffix when random candidates keep colliding.

use chrono::{DateTime, Utc};
use marketplace_core::{LoyaltyError, LoyaltyResult};
use rand::Rng;

/// Longest code accepted from untrusted input.
pub const MAX_CODE_LEN: usize = 40;

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const RANDOM_LEN: usize = 6;

pub fn generate_code<R: Rng + ?Sized>(
    prefix: &str,
    issued_at: DateTime<Utc>,
    rng: &mut R,
) -> String {
    let random: String = (0..RANDOM_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{prefix}-{}-{random}", issued_at.format("%Y%m%d"))
}

pub fn with_suffix(code: &str, counter: u32) -> String {
    format!("{code}-{counter}")
}

/// Allow-list check applied before any lookup: non-empty, at most
/// `MAX_CODE_LEN` bytes, only `A-Z`, `0-9` and `-`.
pub fn validate_code(input: &str) -> LoyaltyResult<&str> {
    if input.is_empty() || input.len() > MAX_CODE_LEN {
        return Err(LoyaltyError::MalformedCode);
    }
    if !input
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(LoyaltyError::MalformedCode);
    }
    Ok(input)
}
