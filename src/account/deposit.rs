use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

/// Which balance a deposit was taken from and is paid back to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Holding {
    Cash,
    Asset(String),
}

impl std::fmt::Display for Holding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Holding::Cash => write!(f, "cash"),
            Holding::Asset(symbol) => write!(f, "{}", symbol),
        }
    }
}

/// Interest-bearing deposit
///
/// Interest compounds into `principal` and is paid out to the source balance
/// as it accrues, so only `deposited` is still owed on withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub id: Uuid,
    pub holding: Holding,
    pub principal: f64,
    /// Amount originally deposited
    pub deposited: f64,
    pub annual_rate: f64,
    pub opened_at: DateTime<Utc>,
}

impl Deposit {
    pub fn new(holding: Holding, amount: f64, annual_rate: f64, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            holding,
            principal: amount,
            deposited: amount,
            annual_rate,
            opened_at,
        }
    }

    /// Grow principal by `principal * rate * elapsed / year`; returns the interest added
    pub fn accrue(&mut self, elapsed_seconds: f64) -> f64 {
        if !(elapsed_seconds.is_finite() && elapsed_seconds > 0.0) {
            return 0.0;
        }
        let delta = self.principal * self.annual_rate * elapsed_seconds / SECONDS_PER_YEAR;
        self.principal += delta;
        delta
    }

    pub fn interest_earned(&self) -> f64 {
        self.principal - self.deposited
    }

    /// What withdrawing returns; interest has already been credited
    pub fn payout(&self) -> f64 {
        self.deposited
    }
}
