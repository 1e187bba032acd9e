use super::deposit::{Deposit, Holding};
use crate::error::TradeError;
use crate::models::TradeSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Tolerance for "exactly enough" balance checks
const BALANCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeStats {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub total_profit: f64,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.successful_trades as f64 / self.total_trades as f64 * 100.0
        }
    }
}

/// Result of a spot buy/sell between cash and an asset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversion {
    pub asset: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    /// Cash that left (buy) or entered (sell) the account
    pub cash: f64,
    pub fee: f64,
}

/// Cash, asset balances, trade statistics and deposits
///
/// Every mutating method validates fully before touching a balance.
#[derive(Debug, Clone)]
pub struct AccountLedger {
    cash: f64,
    asset_balances: BTreeMap<String, f64>,
    stats: TradeStats,
    deposits: Vec<Deposit>,
    conversion_fee: f64,
}

impl AccountLedger {
    pub fn new(initial_cash: f64, conversion_fee: f64) -> Self {
        Self {
            cash: initial_cash.max(0.0),
            asset_balances: BTreeMap::new(),
            stats: TradeStats::default(),
            deposits: Vec::new(),
            conversion_fee,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn asset_balance(&self, asset: &str) -> f64 {
        self.asset_balances.get(asset).copied().unwrap_or(0.0)
    }

    pub fn asset_balances(&self) -> &BTreeMap<String, f64> {
        &self.asset_balances
    }

    pub fn stats(&self) -> &TradeStats {
        &self.stats
    }

    pub fn deposits(&self) -> &[Deposit] {
        &self.deposits
    }

    pub fn conversion_fee(&self) -> f64 {
        self.conversion_fee
    }

    pub fn balance_of(&self, holding: &Holding) -> f64 {
        match holding {
            Holding::Cash => self.cash,
            Holding::Asset(symbol) => self.asset_balance(symbol),
        }
    }

    pub fn can_afford(&self, amount: f64) -> bool {
        amount.is_finite() && amount >= 0.0 && amount <= self.cash + BALANCE_EPSILON
    }

    pub fn debit(&mut self, amount: f64) -> Result<(), TradeError> {
        check_amount(amount)?;
        if !self.can_afford(amount) {
            return Err(TradeError::InsufficientFunds {
                required: amount,
                available: self.cash,
            });
        }
        self.cash = (self.cash - amount).max(0.0);
        Ok(())
    }

    pub fn credit(&mut self, amount: f64) -> Result<(), TradeError> {
        check_amount(amount)?;
        self.cash += amount;
        Ok(())
    }

    /// Count one closed position
    pub fn record_trade(&mut self, pnl: f64) {
        self.stats.total_trades += 1;
        if pnl > 0.0 {
            self.stats.successful_trades += 1;
        }
        self.stats.total_profit += pnl;
    }

    /// Spend `cash_amount` on `asset` at `price`, minus the conversion fee
    pub fn buy_asset(
        &mut self,
        asset: &str,
        cash_amount: f64,
        price: f64,
    ) -> Result<Conversion, TradeError> {
        check_positive(cash_amount)?;
        check_price(price)?;
        if !self.can_afford(cash_amount) {
            return Err(TradeError::InsufficientFunds {
                required: cash_amount,
                available: self.cash,
            });
        }

        let fee = cash_amount * self.conversion_fee;
        let quantity = (cash_amount - fee) / price;

        self.cash = (self.cash - cash_amount).max(0.0);
        *self.asset_balances.entry(asset.to_string()).or_insert(0.0) += quantity;

        Ok(Conversion {
            asset: asset.to_string(),
            side: TradeSide::Buy,
            quantity,
            price,
            cash: cash_amount,
            fee,
        })
    }

    /// Sell `quantity` of `asset` at `price`, minus the conversion fee
    pub fn sell_asset(
        &mut self,
        asset: &str,
        quantity: f64,
        price: f64,
    ) -> Result<Conversion, TradeError> {
        check_positive(quantity)?;
        check_price(price)?;
        let held = self.asset_balance(asset);
        if quantity > held + BALANCE_EPSILON {
            return Err(TradeError::InsufficientFunds {
                required: quantity,
                available: held,
            });
        }

        let gross = quantity * price;
        let fee = gross * self.conversion_fee;

        self.set_asset_balance(asset, held - quantity);
        self.cash += gross - fee;

        Ok(Conversion {
            asset: asset.to_string(),
            side: TradeSide::Sell,
            quantity,
            price,
            cash: gross - fee,
            fee,
        })
    }

    /// Settle a filled limit buy: `quantity` at exactly `price`, no fee
    pub fn settle_buy(
        &mut self,
        asset: &str,
        quantity: f64,
        price: f64,
    ) -> Result<Conversion, TradeError> {
        check_positive(quantity)?;
        check_price(price)?;
        let cost = quantity * price;
        self.debit(cost)?;
        *self.asset_balances.entry(asset.to_string()).or_insert(0.0) += quantity;

        Ok(Conversion {
            asset: asset.to_string(),
            side: TradeSide::Buy,
            quantity,
            price,
            cash: cost,
            fee: 0.0,
        })
    }

    /// Settle a filled limit sell: `quantity` at exactly `price`, no fee
    pub fn settle_sell(
        &mut self,
        asset: &str,
        quantity: f64,
        price: f64,
    ) -> Result<Conversion, TradeError> {
        check_positive(quantity)?;
        check_price(price)?;
        let held = self.asset_balance(asset);
        if quantity > held + BALANCE_EPSILON {
            return Err(TradeError::InsufficientFunds {
                required: quantity,
                available: held,
            });
        }
        let proceeds = quantity * price;
        self.set_asset_balance(asset, held - quantity);
        self.cash += proceeds;

        Ok(Conversion {
            asset: asset.to_string(),
            side: TradeSide::Sell,
            quantity,
            price,
            cash: proceeds,
            fee: 0.0,
        })
    }

    /// Move `amount` from a balance into a new deposit
    pub fn open_deposit(
        &mut self,
        holding: Holding,
        amount: f64,
        annual_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<Uuid, TradeError> {
        check_positive(amount)?;
        if !(annual_rate.is_finite() && annual_rate >= 0.0) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "annual rate must be >= 0, got {}",
                annual_rate
            )));
        }

        let available = self.balance_of(&holding);
        if amount > available + BALANCE_EPSILON {
            return Err(TradeError::InsufficientFunds {
                required: amount,
                available,
            });
        }

        match &holding {
            Holding::Cash => self.cash = (self.cash - amount).max(0.0),
            Holding::Asset(symbol) => {
                let symbol = symbol.clone();
                self.set_asset_balance(&symbol, available - amount);
            }
        }

        let deposit = Deposit::new(holding, amount, annual_rate, now);
        let id = deposit.id;
        tracing::info!(
            "Opened deposit {} of {:.4} {} at {:.2}% APY",
            id,
            amount,
            deposit.holding,
            annual_rate * 100.0
        );
        self.deposits.push(deposit);
        Ok(id)
    }

    /// Accrue interest on every deposit and credit it to the deposit's balance
    ///
    /// Returns the total interest credited.
    pub fn accrue_deposits(&mut self, elapsed_seconds: f64) -> f64 {
        let credits: Vec<(Holding, f64)> = self
            .deposits
            .iter_mut()
            .map(|d| (d.holding.clone(), d.accrue(elapsed_seconds)))
            .filter(|(_, delta)| *delta > 0.0)
            .collect();

        let mut total = 0.0;
        for (holding, delta) in credits {
            self.credit_holding(&holding, delta);
            total += delta;
        }
        total
    }

    /// Close a deposit, returning the deposited amount to its balance
    pub fn withdraw_deposit(&mut self, id: Uuid) -> Result<Deposit, TradeError> {
        let index = self
            .deposits
            .iter()
            .position(|d| d.id == id)
            .ok_or(TradeError::OrderNotFound(id))?;
        let deposit = self.deposits.remove(index);
        self.credit_holding(&deposit.holding, deposit.payout());

        tracing::info!(
            "Withdrew deposit {}: {:.4} {} (interest paid {:.4})",
            deposit.id,
            deposit.payout(),
            deposit.holding,
            deposit.interest_earned()
        );
        Ok(deposit)
    }

    /// Cash + asset holdings + deposits, valued at `prices`
    pub fn wealth(&self, prices: &HashMap<String, f64>) -> f64 {
        let price = |symbol: &str| prices.get(symbol).copied().unwrap_or(0.0);

        let assets: f64 = self
            .asset_balances
            .iter()
            .map(|(symbol, qty)| qty * price(symbol))
            .sum();
        let deposits: f64 = self
            .deposits
            .iter()
            .map(|d| match &d.holding {
                Holding::Cash => d.payout(),
                Holding::Asset(symbol) => d.payout() * price(symbol),
            })
            .sum();

        self.cash + assets + deposits
    }

    /// Rebuild from persisted parts; negative or non-finite balances are dropped
    pub fn restore(
        &mut self,
        cash: Option<f64>,
        asset_balances: Option<BTreeMap<String, f64>>,
        stats: Option<TradeStats>,
        deposits: Option<Vec<Deposit>>,
    ) {
        if let Some(cash) = cash.filter(|c| c.is_finite() && *c >= 0.0) {
            self.cash = cash;
        }
        if let Some(balances) = asset_balances {
            self.asset_balances = balances
                .into_iter()
                .filter(|(_, qty)| qty.is_finite() && *qty > 0.0)
                .collect();
        }
        if let Some(stats) = stats {
            self.stats = stats;
        }
        if let Some(deposits) = deposits {
            self.deposits = deposits
                .into_iter()
                .filter(|d| d.principal.is_finite() && d.principal > 0.0)
                .collect();
        }
    }

    fn credit_holding(&mut self, holding: &Holding, amount: f64) {
        match holding {
            Holding::Cash => self.cash += amount,
            Holding::Asset(symbol) => {
                *self.asset_balances.entry(symbol.clone()).or_insert(0.0) += amount;
            }
        }
    }

    fn set_asset_balance(&mut self, asset: &str, quantity: f64) {
        if quantity > BALANCE_EPSILON {
            self.asset_balances.insert(asset.to_string(), quantity);
        } else {
            self.asset_balances.remove(asset);
        }
    }
}

fn check_amount(amount: f64) -> Result<(), TradeError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(TradeError::InvalidAmount(amount))
    }
}

fn check_positive(amount: f64) -> Result<(), TradeError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(TradeError::InvalidAmount(amount))
    }
}

fn check_price(price: f64) -> Result<(), TradeError> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(TradeError::InvalidOrderParameters(format!(
            "price must be positive, got {}",
            price
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::deposit::SECONDS_PER_YEAR;

    #[test]
    fn test_debit_credit() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        assert!(ledger.can_afford(1000.0));
        assert!(!ledger.can_afford(1000.01));

        ledger.debit(400.0).unwrap();
        assert_eq!(ledger.cash(), 600.0);
        ledger.credit(50.0).unwrap();
        assert_eq!(ledger.cash(), 650.0);
    }

    #[test]
    fn test_debit_insufficient_leaves_balance() {
        let mut ledger = AccountLedger::new(100.0, 0.0);
        let err = ledger.debit(150.0).unwrap_err();
        assert_eq!(
            err,
            TradeError::InsufficientFunds {
                required: 150.0,
                available: 100.0
            }
        );
        assert_eq!(ledger.cash(), 100.0);
    }

    #[test]
    fn test_rejects_invalid_amounts() {
        let mut ledger = AccountLedger::new(100.0, 0.0);
        assert!(matches!(ledger.debit(-1.0), Err(TradeError::InvalidAmount(_))));
        assert!(matches!(ledger.credit(f64::NAN), Err(TradeError::InvalidAmount(_))));
        assert_eq!(ledger.cash(), 100.0);
    }

    #[test]
    fn test_record_trade_stats() {
        let mut ledger = AccountLedger::new(0.0, 0.0);
        ledger.record_trade(100.0);
        ledger.record_trade(-30.0);
        ledger.record_trade(0.0);

        let stats = ledger.stats();
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.successful_trades, 1);
        assert_eq!(stats.total_profit, 70.0);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let stats = TradeStats {
            total_trades: 2,
            successful_trades: 1,
            total_profit: 5.5,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalTrades"], 2);
        assert_eq!(json["successfulTrades"], 1);
        assert_eq!(json["totalProfit"], 5.5);
    }

    #[test]
    fn test_buy_and_sell_with_fee() {
        let mut ledger = AccountLedger::new(1000.0, 0.005);

        let buy = ledger.buy_asset("VKoin", 100.0, 10.0).unwrap();
        assert!((buy.fee - 0.5).abs() < 1e-12);
        assert!((buy.quantity - 9.95).abs() < 1e-12);
        assert_eq!(ledger.cash(), 900.0);
        assert!((ledger.asset_balance("VKoin") - 9.95).abs() < 1e-12);

        let sell = ledger.sell_asset("VKoin", 9.95, 20.0).unwrap();
        assert!((sell.cash - 9.95 * 20.0 * 0.995).abs() < 1e-9);
        assert_eq!(ledger.asset_balance("VKoin"), 0.0);
        assert!(ledger.asset_balances().is_empty());
    }

    #[test]
    fn test_sell_more_than_held_rejected() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        ledger.buy_asset("VKoin", 100.0, 10.0).unwrap();

        let err = ledger.sell_asset("VKoin", 11.0, 10.0).unwrap_err();
        assert!(matches!(err, TradeError::InsufficientFunds { .. }));
        assert_eq!(ledger.asset_balance("VKoin"), 10.0);
        assert_eq!(ledger.cash(), 900.0);
    }

    #[test]
    fn test_settle_limit_fills_without_fee() {
        let mut ledger = AccountLedger::new(1000.0, 0.005);
        ledger.settle_buy("VKoin", 5.0, 100.0).unwrap();
        assert_eq!(ledger.cash(), 500.0);
        assert_eq!(ledger.asset_balance("VKoin"), 5.0);

        ledger.settle_sell("VKoin", 5.0, 120.0).unwrap();
        assert_eq!(ledger.cash(), 1100.0);

        assert!(ledger.settle_buy("VKoin", 20.0, 100.0).is_err());
        assert_eq!(ledger.cash(), 1100.0);
    }

    #[test]
    fn test_deposit_lifecycle() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        let id = ledger
            .open_deposit(Holding::Cash, 100.0, 0.12, Utc::now())
            .unwrap();
        assert_eq!(ledger.cash(), 900.0);

        let interest = ledger.accrue_deposits(SECONDS_PER_YEAR);
        assert!((interest - 12.0).abs() < 1e-9);
        assert!((ledger.deposits()[0].principal - 112.0).abs() < 1e-9);
        // Interest lands in cash as it accrues
        assert!((ledger.cash() - 912.0).abs() < 1e-9);

        let deposit = ledger.withdraw_deposit(id).unwrap();
        assert!((deposit.principal - 112.0).abs() < 1e-9);
        assert!((ledger.cash() - 1012.0).abs() < 1e-9);
        assert!(ledger.deposits().is_empty());

        assert_eq!(
            ledger.withdraw_deposit(id),
            Err(TradeError::OrderNotFound(id))
        );
    }

    #[test]
    fn test_asset_deposit() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        ledger.buy_asset("VKoin", 500.0, 50.0).unwrap();

        let holding = Holding::Asset("VKoin".to_string());
        assert!(ledger.open_deposit(holding.clone(), 20.0, 0.1, Utc::now()).is_err());

        let id = ledger.open_deposit(holding, 4.0, 0.1, Utc::now()).unwrap();
        assert_eq!(ledger.asset_balance("VKoin"), 6.0);
        ledger.withdraw_deposit(id).unwrap();
        assert_eq!(ledger.asset_balance("VKoin"), 10.0);
    }

    #[test]
    fn test_deposit_interest_credited_each_accrual() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        ledger.buy_asset("VKoin", 500.0, 50.0).unwrap();
        ledger
            .open_deposit(Holding::Asset("VKoin".to_string()), 10.0, 0.12, Utc::now())
            .unwrap();
        ledger.open_deposit(Holding::Cash, 100.0, 0.12, Utc::now()).unwrap();

        let mut cash = ledger.cash();
        for _ in 0..4 {
            ledger.accrue_deposits(SECONDS_PER_YEAR / 4.0);
            assert!(ledger.cash() > cash);
            cash = ledger.cash();
        }
        // 100 * (1.03^4 - 1) paid out so far
        assert!((ledger.cash() - 400.0 - 12.550881).abs() < 1e-6);
        assert!((ledger.asset_balance("VKoin") - 1.2550881).abs() < 1e-6);

        let prices = HashMap::from([("VKoin".to_string(), 50.0)]);
        let wealth = ledger.wealth(&prices);
        let id = ledger.deposits()[1].id;
        ledger.withdraw_deposit(id).unwrap();
        // Withdrawing moves value, never creates it
        assert!((ledger.wealth(&prices) - wealth).abs() < 1e-9);
        assert!((ledger.cash() - 512.550881).abs() < 1e-6);
    }

    #[test]
    fn test_wealth() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        ledger.buy_asset("VKoin", 500.0, 50.0).unwrap();
        ledger.open_deposit(Holding::Cash, 100.0, 0.1, Utc::now()).unwrap();

        let prices = HashMap::from([("VKoin".to_string(), 60.0)]);
        // 400 cash + 10 * 60 + 100 deposit
        assert!((ledger.wealth(&prices) - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_restore_drops_bad_values() {
        let mut ledger = AccountLedger::new(1000.0, 0.0);
        let balances = BTreeMap::from([
            ("VKoin".to_string(), 3.0),
            ("Broken".to_string(), -1.0),
        ]);
        ledger.restore(Some(-5.0), Some(balances), None, None);

        assert_eq!(ledger.cash(), 1000.0);
        assert_eq!(ledger.asset_balance("VKoin"), 3.0);
        assert_eq!(ledger.asset_balance("Broken"), 0.0);
    }
}
