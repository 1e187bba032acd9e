// Single owner of all trading state
pub mod activity;
pub mod events;

pub use activity::ActivityLog;
pub use events::{BalanceSnapshot, SimEvent};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::account::{AccountLedger, Conversion, Deposit, Holding, Leaderboard};
use crate::config::Settings;
use crate::error::TradeError;
use crate::execution::{
    ClosedTrade, ConditionalOrder, OpenRequest, OrderKind, OrderManager, Position,
    PositionManager, Trigger,
};
use crate::market::{MarketFeed, MarketUpdate, PriceGenerator};
use crate::models::{
    Candle, ExitReason, Notification, OrderSize, Severity, Side, Timeframe, TradeSide,
};
use crate::persistence::StoredState;

const EVENT_CAPACITY: usize = 1024;

/// Market, positions, orders and balances behind one `&mut self`
///
/// Every user intent and every market event goes through here, so at most
/// one trade mutation is ever in flight.
pub struct TradingSession {
    market: MarketFeed,
    positions: PositionManager,
    orders: OrderManager,
    ledger: AccountLedger,
    leaderboard: Leaderboard,
    activity: ActivityLog,
    events: broadcast::Sender<SimEvent>,
    timeframe: Timeframe,
    default_leverage: f64,
    auto_stop_pct: Option<f64>,
    auto_take_pct: Option<f64>,
    default_apy: f64,
    last_accrual: Option<DateTime<Utc>>,
    dirty: bool,
}

impl TradingSession {
    pub fn from_settings(settings: &Settings) -> Self {
        let generator = match settings.market.seed {
            Some(seed) => PriceGenerator::new(seed, settings.generator.clone()),
            None => PriceGenerator::from_entropy(settings.generator.clone()),
        };
        let market = MarketFeed::new(
            settings.assets.clone(),
            generator,
            settings.market.candle_mode,
            settings.market.timeframe,
            settings.market.history_len,
            settings.market.tick_interval_ms as f64 / 1000.0,
        );
        let trading = &settings.trading;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            market,
            positions: PositionManager::new(
                trading.max_leverage,
                trading.single_position,
                trading.pnl_basis,
            ),
            orders: OrderManager::new(trading.stop_validation, trading.clamp_offset),
            ledger: AccountLedger::new(trading.initial_cash, trading.conversion_fee),
            leaderboard: Leaderboard::new(),
            activity: ActivityLog::default(),
            events,
            timeframe: settings.market.timeframe,
            default_leverage: trading.default_leverage,
            auto_stop_pct: trading.auto_stop_pct,
            auto_take_pct: trading.auto_take_pct,
            default_apy: settings.deposits.default_apy,
            last_accrual: None,
            dirty: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SimEvent> {
        self.events.clone()
    }

    pub fn market(&self) -> &MarketFeed {
        &self.market
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn default_leverage(&self) -> f64 {
        self.default_leverage
    }

    pub fn default_apy(&self) -> f64 {
        self.default_apy
    }

    /// True if state changed since the last call
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Advance the synthetic market and accrue deposits
    ///
    /// Returns the number of assets that produced a candle update.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let updates = self.market.tick(now);
        let count = updates.len();
        for update in updates {
            self.process_update(update, now);
        }
        self.accrue(now);
        count
    }

    /// Accrue deposit interest for the time since the previous call
    pub fn accrue(&mut self, now: DateTime<Utc>) -> f64 {
        let elapsed = self
            .last_accrual
            .map(|last| (now - last).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        self.last_accrual = Some(now);

        if elapsed <= 0.0 || self.ledger.deposits().is_empty() {
            return 0.0;
        }
        let interest = self.ledger.accrue_deposits(elapsed);
        self.dirty = true;
        self.emit_balance();
        interest
    }

    pub fn apply_external_candle(&mut self, asset: &str, candle: Candle, now: DateTime<Utc>) {
        if let Some(update) = self.market.apply_external_candle(asset, candle) {
            self.process_update(update, now);
        }
    }

    pub fn apply_external_sample(&mut self, asset: &str, price: f64, now: DateTime<Utc>) {
        if let Some(update) = self.market.apply_external_sample(asset, price, now) {
            self.process_update(update, now);
        }
    }

    /// Flip an asset between external and synthetic prices
    pub fn set_feed_online(&mut self, asset: &str, online: bool, now: DateTime<Utc>) {
        if !self.market.set_online(asset, online) {
            return;
        }
        if online {
            self.notify(format!("{}: live prices connected", asset), Severity::Info, now);
        } else {
            self.notify(
                format!("{}: live feed lost, using simulated prices", asset),
                Severity::Warning,
                now,
            );
        }
    }

    pub fn seed_history(&mut self, asset: &str, candles: Vec<Candle>) -> Result<(), TradeError> {
        self.market.seed_history(asset, candles)
    }

    pub fn open_position(
        &mut self,
        asset: &str,
        side: Side,
        size: OrderSize,
        leverage: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Position, TradeError> {
        let price = self.market.price_of(asset)?;
        let request = OpenRequest::new(
            asset,
            side,
            size,
            leverage.unwrap_or(self.default_leverage),
        );
        let position = self
            .positions
            .open(&mut self.ledger, request, price, now)?
            .clone();

        if let Err(err) =
            self.orders
                .attach_brackets(&position, self.auto_stop_pct, self.auto_take_pct, now)
        {
            tracing::warn!("Could not attach automatic stop/take for {}: {}", asset, err);
        }

        self.market.record_trade_impact(asset, side.sign());
        self.dirty = true;
        self.notify(
            format!(
                "Opened {} {} {:.4} @ {:.2} (x{})",
                side, asset, position.quantity, price, position.leverage
            ),
            Severity::Success,
            now,
        );
        self.emit(SimEvent::PositionChanged {
            asset: asset.to_string(),
            position: Some(position.clone()),
        });
        self.emit_balance();
        Ok(position)
    }

    /// Close the position on `asset` at the current price
    pub fn close_position(&mut self, asset: &str, now: DateTime<Utc>) -> Result<ClosedTrade, TradeError> {
        let price = self.market.price_of(asset)?;
        self.finish_close(asset, price, ExitReason::Manual, now)
    }

    pub fn set_stop_loss(
        &mut self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        let position = self.require_position(asset)?;
        let order = self.orders.set_stop_loss(&position, price, now)?;
        self.dirty = true;
        Ok(order)
    }

    pub fn set_take_profit(
        &mut self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        let position = self.require_position(asset)?;
        let order = self.orders.set_take_profit(&position, price, now)?;
        self.dirty = true;
        Ok(order)
    }

    /// Rest a limit order; balances are checked now and again at fill time
    pub fn place_limit_order(
        &mut self,
        asset: &str,
        side: TradeSide,
        size: OrderSize,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        if !self.market.contains(asset) {
            return Err(TradeError::UnknownAsset(asset.to_string()));
        }
        if price.is_finite() && price > 0.0 {
            let quantity = size.quantity_at(price);
            match side {
                TradeSide::Buy if !self.ledger.can_afford(quantity * price) => {
                    return Err(TradeError::InsufficientFunds {
                        required: quantity * price,
                        available: self.ledger.cash(),
                    });
                }
                TradeSide::Sell if quantity > self.ledger.asset_balance(asset) => {
                    return Err(TradeError::InsufficientFunds {
                        required: quantity,
                        available: self.ledger.asset_balance(asset),
                    });
                }
                _ => {}
            }
        }

        let order = self.orders.place_limit(asset, side, size, price, now)?;
        self.dirty = true;
        Ok(order)
    }

    pub fn cancel_order(&mut self, id: Uuid) -> Result<ConditionalOrder, TradeError> {
        let order = self.orders.cancel(id)?;
        self.dirty = true;
        Ok(order)
    }

    /// Spot-buy `asset` for `cash_amount` at the market price
    pub fn buy_asset(
        &mut self,
        asset: &str,
        cash_amount: f64,
        now: DateTime<Utc>,
    ) -> Result<Conversion, TradeError> {
        let price = self.market.price_of(asset)?;
        let conversion = self.ledger.buy_asset(asset, cash_amount, price)?;
        self.market.record_trade_impact(asset, 1.0);
        self.after_conversion(&conversion, now);
        Ok(conversion)
    }

    /// Spot-sell `quantity` of `asset` at the market price
    pub fn sell_asset(
        &mut self,
        asset: &str,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Result<Conversion, TradeError> {
        let price = self.market.price_of(asset)?;
        let conversion = self.ledger.sell_asset(asset, quantity, price)?;
        self.market.record_trade_impact(asset, -1.0);
        self.after_conversion(&conversion, now);
        Ok(conversion)
    }

    pub fn open_deposit(
        &mut self,
        holding: Holding,
        amount: f64,
        annual_rate: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, TradeError> {
        if let Holding::Asset(symbol) = &holding {
            if !self.market.contains(symbol) {
                return Err(TradeError::UnknownAsset(symbol.clone()));
            }
        }
        let rate = annual_rate.unwrap_or(self.default_apy);
        let label = holding.to_string();
        let id = self.ledger.open_deposit(holding, amount, rate, now)?;
        self.last_accrual.get_or_insert(now);
        self.dirty = true;
        self.notify(
            format!("Deposited {:.2} {} at {:.1}% APY", amount, label, rate * 100.0),
            Severity::Success,
            now,
        );
        self.emit_balance();
        Ok(id)
    }

    pub fn withdraw_deposit(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Deposit, TradeError> {
        let deposit = self.ledger.withdraw_deposit(id)?;
        self.dirty = true;
        self.notify(
            format!(
                "Withdrew {:.4} {} ({:.4} interest paid over its life)",
                deposit.payout(),
                deposit.holding,
                deposit.interest_earned()
            ),
            Severity::Success,
            now,
        );
        self.emit_balance();
        Ok(deposit)
    }

    /// Switch every asset to a new candle interval
    pub fn switch_timeframe(&mut self, timeframe: Timeframe, now: DateTime<Utc>) -> Result<(), TradeError> {
        for symbol in self.market.symbols() {
            self.market.switch_timeframe(&symbol, timeframe, now)?;
        }
        self.timeframe = timeframe;
        self.dirty = true;
        Ok(())
    }

    pub fn set_default_leverage(&mut self, leverage: f64) -> Result<(), TradeError> {
        if !(leverage >= 1.0 && leverage <= self.positions.max_leverage()) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "leverage must be within 1..={}, got {}",
                self.positions.max_leverage(),
                leverage
            )));
        }
        self.default_leverage = leverage;
        self.dirty = true;
        Ok(())
    }

    /// Ledger wealth plus what open positions would return if closed now
    pub fn wealth(&self) -> f64 {
        let prices = self.market.prices();
        self.ledger.wealth(&prices) + self.positions.open_equity(&prices)
    }

    pub fn balance_snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            cash: self.ledger.cash(),
            assets: self.ledger.asset_balances().clone(),
            stats: self.ledger.stats().clone(),
        }
    }

    /// Persistable view of the session
    pub fn snapshot(&self) -> StoredState {
        let protective = |stop: bool| {
            self.orders
                .orders()
                .iter()
                .filter(|o| match o.kind {
                    OrderKind::StopLoss { .. } => stop,
                    OrderKind::TakeProfit { .. } => !stop,
                    OrderKind::Limit { .. } => false,
                })
                .map(|o| (o.asset.clone(), o.trigger_price))
                .collect()
        };

        StoredState {
            balance: Some(self.ledger.cash()),
            assets: Some(self.ledger.asset_balances().clone()),
            positions: Some(self.positions.open_positions().to_vec()),
            stats: Some(self.ledger.stats().clone()),
            stop_loss: Some(protective(true)),
            take_profit: Some(protective(false)),
            orders: Some(self.orders.orders().to_vec()),
            leverage: Some(self.default_leverage),
            timeframe: Some(self.timeframe),
            deposits: Some(self.ledger.deposits().to_vec()),
            leaderboard: Some(self.leaderboard.entries().to_vec()),
        }
    }

    /// Load persisted state; missing or unusable fields keep their defaults
    pub fn restore(&mut self, state: StoredState, now: DateTime<Utc>) {
        self.ledger
            .restore(state.balance, state.assets, state.stats, state.deposits);

        if let Some(positions) = state.positions {
            let known: Vec<Position> = positions
                .into_iter()
                .filter(|p| self.market.contains(&p.asset))
                .collect();
            self.positions.restore(known);
        }

        match state.orders {
            Some(orders) => {
                let valid: Vec<ConditionalOrder> = orders
                    .into_iter()
                    .filter(|o| self.market.contains(&o.asset))
                    .filter(|o| !o.kind.is_protective() || self.positions.has_open_position(&o.asset))
                    .collect();
                self.orders.restore(valid);
            }
            None => self.restore_protective(state.stop_loss, state.take_profit, now),
        }

        if let Some(leverage) = state.leverage {
            if let Err(err) = self.set_default_leverage(leverage) {
                tracing::warn!("Ignoring persisted leverage: {}", err);
            }
        }
        if let Some(timeframe) = state.timeframe {
            if timeframe != self.timeframe {
                if let Err(err) = self.switch_timeframe(timeframe, now) {
                    tracing::warn!("Ignoring persisted timeframe: {}", err);
                }
            }
        }
        if let Some(entries) = state.leaderboard {
            self.leaderboard = Leaderboard::from_entries(entries);
        }

        if !self.ledger.deposits().is_empty() {
            self.last_accrual = Some(now);
        }
        self.dirty = false;
        tracing::info!(
            "Restored session: cash {:.2}, {} open positions, {} orders",
            self.ledger.cash(),
            self.positions.open_positions().len(),
            self.orders.orders().len()
        );
    }

    pub fn notify(&mut self, message: String, severity: Severity, now: DateTime<Utc>) {
        let notification = Notification {
            message,
            severity,
            at: now,
        };
        self.activity.push(notification.clone());
        self.emit(SimEvent::Notification(notification));
    }

    fn restore_protective(
        &mut self,
        stop_loss: Option<BTreeMap<String, f64>>,
        take_profit: Option<BTreeMap<String, f64>>,
        now: DateTime<Utc>,
    ) {
        for (asset, price) in stop_loss.unwrap_or_default() {
            if let Some(position) = self.positions.position(&asset).cloned() {
                if let Err(err) = self.orders.set_stop_loss(&position, price, now) {
                    tracing::warn!("Ignoring persisted stop loss for {}: {}", asset, err);
                }
            }
        }
        for (asset, price) in take_profit.unwrap_or_default() {
            if let Some(position) = self.positions.position(&asset).cloned() {
                if let Err(err) = self.orders.set_take_profit(&position, price, now) {
                    tracing::warn!("Ignoring persisted take profit for {}: {}", asset, err);
                }
            }
        }
    }

    fn process_update(&mut self, update: MarketUpdate, now: DateTime<Utc>) {
        let MarketUpdate {
            asset,
            price,
            update,
            range,
            shock,
            event_started,
        } = update;

        self.emit(SimEvent::PriceUpdate {
            asset: asset.clone(),
            price,
        });
        self.emit(SimEvent::CandleUpdate {
            asset: asset.clone(),
            candle: update.candle,
            is_new_candle: update.is_new_candle,
        });

        if let Some(shock) = shock {
            let (text, severity) = if shock.multiplier() < 1.0 {
                ("crashed", Severity::Error)
            } else {
                ("pumped", Severity::Success)
            };
            self.notify(
                format!("{} {} x{:.2}!", asset, text, shock.multiplier()),
                severity,
                now,
            );
        }
        if let Some(event) = event_started {
            self.notify(
                format!(
                    "Breaking news: {} volatility x{:.1} for {} ticks",
                    asset, event.multiplier, event.remaining_ticks
                ),
                Severity::Warning,
                now,
            );
        }

        for trigger in self.orders.on_candle(&asset, &range) {
            self.execute_trigger(trigger, now);
        }
    }

    fn execute_trigger(&mut self, trigger: Trigger, now: DateTime<Utc>) {
        let Trigger { order, fill_price } = trigger;
        match order.kind {
            OrderKind::StopLoss { .. } | OrderKind::TakeProfit { .. } => {
                let reason = if matches!(order.kind, OrderKind::StopLoss { .. }) {
                    ExitReason::StopLoss
                } else {
                    ExitReason::TakeProfit
                };
                if let Err(err) = self.finish_close(&order.asset, fill_price, reason, now) {
                    tracing::warn!("{} for {} could not close: {}", reason, order.asset, err);
                }
            }
            OrderKind::Limit { side, size } => {
                let quantity = size.quantity_at(fill_price);
                let result = match side {
                    TradeSide::Buy => self.ledger.settle_buy(&order.asset, quantity, fill_price),
                    TradeSide::Sell => self.ledger.settle_sell(&order.asset, quantity, fill_price),
                };
                self.dirty = true;
                match result {
                    Ok(conversion) => {
                        tracing::info!(
                            "Limit {} filled: {} {:.4} @ ${:.4}",
                            side,
                            order.asset,
                            quantity,
                            fill_price
                        );
                        self.notify(
                            format!(
                                "Limit {} filled: {:.4} {} @ {:.2}",
                                side, conversion.quantity, order.asset, fill_price
                            ),
                            Severity::Success,
                            now,
                        );
                        self.record_score(now);
                        self.emit_balance();
                    }
                    Err(err) => {
                        tracing::warn!("Limit order {} cancelled at fill: {}", order.id, err);
                        self.notify(
                            format!("Limit {} for {} cancelled: {}", side, order.asset, err),
                            Severity::Error,
                            now,
                        );
                    }
                }
            }
        }
    }

    fn finish_close(
        &mut self,
        asset: &str,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, TradeError> {
        let trade = self
            .positions
            .close(&mut self.ledger, asset, price, reason, now)?;
        self.orders.clear_position_orders(asset);
        self.market
            .record_trade_impact(asset, -trade.position.side.sign());
        self.dirty = true;

        let severity = if trade.pnl >= 0.0 {
            Severity::Success
        } else {
            Severity::Error
        };
        let message = match reason {
            ExitReason::Manual => format!(
                "Closed {} {} @ {:.2}: P&L {:+.2}",
                trade.position.side, asset, price, trade.pnl
            ),
            _ => format!(
                "{} triggered: {} closed @ {:.2}, P&L {:+.2}",
                reason, asset, price, trade.pnl
            ),
        };
        self.notify(message, severity, now);
        self.record_score(now);
        self.emit(SimEvent::PositionChanged {
            asset: asset.to_string(),
            position: None,
        });
        self.emit_balance();
        Ok(trade)
    }

    fn after_conversion(&mut self, conversion: &Conversion, now: DateTime<Utc>) {
        self.dirty = true;
        self.notify(
            format!(
                "{} {:.4} {} @ {:.2} (fee {:.2})",
                conversion.side, conversion.quantity, conversion.asset, conversion.price, conversion.fee
            ),
            Severity::Success,
            now,
        );
        self.record_score(now);
        self.emit_balance();
    }

    fn record_score(&mut self, now: DateTime<Utc>) {
        let wealth = self.wealth();
        if let Some(rank) = self.leaderboard.record(wealth, now) {
            tracing::debug!("Wealth {:.2} ranked #{} locally", wealth, rank);
        }
    }

    fn require_position(&self, asset: &str) -> Result<Position, TradeError> {
        self.positions
            .position(asset)
            .cloned()
            .ok_or_else(|| TradeError::NoOpenPosition {
                asset: asset.to_string(),
            })
    }

    fn emit_balance(&self) {
        self.emit(SimEvent::BalanceChanged(self.balance_snapshot()));
    }

    fn emit(&self, event: SimEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    #[cfg(test)]
    pub(crate) fn market_mut(&mut self) -> &mut MarketFeed {
        &mut self.market
    }
}
