use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type LoyaltyResult<T> = Result<T, LoyaltyError>;

/// Why a voucher cannot take part in the requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusableReason {
    Expired,
    Used,
    Cancelled,
}

impl std::fmt::Display for UnusableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            UnusableReason::Expired => "voucher has expired",
            UnusableReason::Used => "voucher has already been used",
            UnusableReason::Cancelled => "voucher was cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient balance: requested {requested} points, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("Denomination {0} is not offered")]
    DenominationNotOffered(f64),

    #[error("Voucher not found")]
    NotFound,

    #[error("Voucher not usable: {0}")]
    NotUsable(UnusableReason),

    #[error("Voucher already used")]
    AlreadyUsed,

    #[error("Concurrent modification on {0}, retry the request")]
    ConcurrentModification(String),

    #[error("Invalid loyalty configuration: {0}")]
    ConfigInvalid(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Malformed voucher code")]
    MalformedCode,

    #[error("Ledger corrupted for account {account_id}: {detail}")]
    LedgerCorrupted { account_id: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoyaltyError {
    /// Only lost lock races are worth retrying; everything else is terminal
    /// for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoyaltyError::ConcurrentModification(_))
    }

    /// Text suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            LoyaltyError::InvalidAmount(_) => "The amount must be greater than zero.".to_string(),
            LoyaltyError::InsufficientBalance { requested, available } => format!(
                "You need {requested} points but only have {available}."
            ),
            LoyaltyError::DenominationNotOffered(value) => {
                format!("Vouchers worth {value} are not available.")
            }
            LoyaltyError::NotFound | LoyaltyError::MalformedCode => {
                "We couldn't find that voucher.".to_string()
            }
            LoyaltyError::NotUsable(UnusableReason::Expired) => {
                "This voucher has expired.".to_string()
            }
            LoyaltyError::NotUsable(UnusableReason::Used) | LoyaltyError::AlreadyUsed => {
                "This voucher has already been used.".to_string()
            }
            LoyaltyError::NotUsable(UnusableReason::Cancelled) => {
                "This voucher was cancelled.".to_string()
            }
            LoyaltyError::ConcurrentModification(_) => {
                "Your account is busy, please try again.".to_string()
            }
            LoyaltyError::AccountNotFound(_) => "No loyalty account was found.".to_string(),
            _ => "Something went wrong with the loyalty program.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unusable_reasons_are_distinct() {
        let expired = LoyaltyError::NotUsable(UnusableReason::Expired).user_message();
        let used = LoyaltyError::NotUsable(UnusableReason::Used).user_message();
        let cancelled = LoyaltyError::NotUsable(UnusableReason::Cancelled).user_message();
        let missing = LoyaltyError::NotFound.user_message();

        assert_ne!(expired, used);
        assert_ne!(used, cancelled);
        assert_ne!(cancelled, missing);
        assert_ne!(expired, missing);
    }

    #[test]
    fn test_only_concurrent_modification_retries() {
        assert!(LoyaltyError::ConcurrentModification("acct".into()).is_retryable());
        assert!(!LoyaltyError::AlreadyUsed.is_retryable());
        assert!(!LoyaltyError::InsufficientBalance {
            requested: 10,
            available: 5
        }
        .is_retryable());
    }
}
