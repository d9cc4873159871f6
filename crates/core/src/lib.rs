pub mod clock;
pub mod config;
pub mod error;
pub mod loyalty;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, LoyaltyProgramConfig};
pub use error::{LoyaltyError, LoyaltyResult, UnusableReason};
