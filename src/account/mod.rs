pub mod deposit;
pub mod leaderboard;
pub mod ledger;

pub use deposit::{Deposit, Holding, SECONDS_PER_YEAR};
pub use leaderboard::{Leaderboard, LeaderboardEntry};
pub use ledger::{AccountLedger, Conversion, TradeStats};
