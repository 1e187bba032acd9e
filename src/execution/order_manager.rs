use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position_manager::Position;
use crate::error::TradeError;
use crate::models::{Candle, OrderSize, Side, TradeSide};

/// What to do with stop/take values on the wrong side of entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopValidation {
    /// Reject with `InvalidOrderParameters`
    Strict,
    /// Replace with entry adjusted by the clamp offset
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
    /// Protective exit for a position of `side`
    StopLoss { side: Side },
    TakeProfit { side: Side },
    /// Resting spot order filled exactly at its trigger price
    Limit { side: TradeSide, size: OrderSize },
}

impl OrderKind {
    pub fn is_protective(&self) -> bool {
        matches!(self, OrderKind::StopLoss { .. } | OrderKind::TakeProfit { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOrder {
    pub id: Uuid,
    pub asset: String,
    pub kind: OrderKind,
    pub trigger_price: f64,
    pub created_at: DateTime<Utc>,
}

/// An order that fired on a candle, with the price it executes at
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub order: ConditionalOrder,
    pub fill_price: f64,
}

/// Pending stop-loss, take-profit and limit orders
pub struct OrderManager {
    orders: Vec<ConditionalOrder>,
    validation: StopValidation,
    clamp_offset: f64,
}

impl OrderManager {
    pub fn new(validation: StopValidation, clamp_offset: f64) -> Self {
        Self {
            orders: Vec::new(),
            validation,
            clamp_offset,
        }
    }

    pub fn validation(&self) -> StopValidation {
        self.validation
    }

    /// Set (or replace) the stop-loss of `position`; returns the stored order
    pub fn set_stop_loss(
        &mut self,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        let price = self.validate_exit(position, price, true)?;
        Ok(self.replace_protective(
            &position.asset,
            OrderKind::StopLoss {
                side: position.side,
            },
            price,
            now,
        ))
    }

    /// Set (or replace) the take-profit of `position`; returns the stored order
    pub fn set_take_profit(
        &mut self,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        let price = self.validate_exit(position, price, false)?;
        Ok(self.replace_protective(
            &position.asset,
            OrderKind::TakeProfit {
                side: position.side,
            },
            price,
            now,
        ))
    }

    /// Attach an automatic stop/take pair `pct` away from entry
    pub fn attach_brackets(
        &mut self,
        position: &Position,
        stop_pct: Option<f64>,
        take_pct: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), TradeError> {
        let sign = position.side.sign();
        if let Some(pct) = stop_pct {
            self.set_stop_loss(position, position.entry_price * (1.0 - sign * pct), now)?;
        }
        if let Some(pct) = take_pct {
            self.set_take_profit(position, position.entry_price * (1.0 + sign * pct), now)?;
        }
        Ok(())
    }

    /// Rest a limit order; fills when a candle trades through `price`
    pub fn place_limit(
        &mut self,
        asset: &str,
        side: TradeSide,
        size: OrderSize,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ConditionalOrder, TradeError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "limit price must be positive, got {}",
                price
            )));
        }
        let quantity = size.quantity_at(price);
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(TradeError::InvalidAmount(quantity));
        }

        let order = ConditionalOrder {
            id: Uuid::new_v4(),
            asset: asset.to_string(),
            kind: OrderKind::Limit { side, size },
            trigger_price: price,
            created_at: now,
        };
        tracing::info!("Placed {} limit for {} @ ${:.4}", side, asset, price);
        self.orders.push(order.clone());
        Ok(order)
    }

    pub fn cancel(&mut self, id: Uuid) -> Result<ConditionalOrder, TradeError> {
        let index = self
            .orders
            .iter()
            .position(|o| o.id == id)
            .ok_or(TradeError::OrderNotFound(id))?;
        Ok(self.orders.remove(index))
    }

    /// Drop the stop/take orders of a position that just closed
    pub fn clear_position_orders(&mut self, asset: &str) -> Vec<ConditionalOrder> {
        let (removed, kept) = std::mem::take(&mut self.orders)
            .into_iter()
            .partition(|o| o.asset == asset && o.kind.is_protective());
        self.orders = kept;
        removed
    }

    pub fn orders(&self) -> &[ConditionalOrder] {
        &self.orders
    }

    pub fn orders_for<'a>(&'a self, asset: &'a str) -> impl Iterator<Item = &'a ConditionalOrder> {
        self.orders.iter().filter(move |o| o.asset == asset)
    }

    pub fn stop_loss(&self, asset: &str) -> Option<&ConditionalOrder> {
        self.orders
            .iter()
            .find(|o| o.asset == asset && matches!(o.kind, OrderKind::StopLoss { .. }))
    }

    pub fn take_profit(&self, asset: &str) -> Option<&ConditionalOrder> {
        self.orders
            .iter()
            .find(|o| o.asset == asset && matches!(o.kind, OrderKind::TakeProfit { .. }))
    }

    /// Evaluate every order on `asset` against a candle's full range
    ///
    /// Triggered orders are removed and returned; protective exits come first.
    /// When stop and take are both inside one candle the stop wins.
    pub fn on_candle(&mut self, asset: &str, candle: &Candle) -> Vec<Trigger> {
        let mut triggers = Vec::new();

        let stop = self
            .stop_loss(asset)
            .and_then(|o| stop_fill(o, candle).map(|fill| (o.id, fill)));
        let take = self
            .take_profit(asset)
            .and_then(|o| take_fill(o, candle).map(|fill| (o.id, fill)));
        if let Some((id, fill_price)) = stop.or(take) {
            if let Some(order) = self.remove(id) {
                triggers.push(Trigger { order, fill_price });
            }
        }

        let limit_ids: Vec<Uuid> = self
            .orders_for(asset)
            .filter(|o| matches!(o.kind, OrderKind::Limit { .. }) && candle.contains(o.trigger_price))
            .map(|o| o.id)
            .collect();
        for id in limit_ids {
            if let Some(order) = self.remove(id) {
                let fill_price = order.trigger_price;
                triggers.push(Trigger { order, fill_price });
            }
        }

        triggers
    }

    /// Replace pending orders with persisted ones
    pub fn restore(&mut self, orders: Vec<ConditionalOrder>) {
        self.orders = orders
            .into_iter()
            .filter(|o| o.trigger_price.is_finite() && o.trigger_price > 0.0)
            .collect();
    }

    fn remove(&mut self, id: Uuid) -> Option<ConditionalOrder> {
        let index = self.orders.iter().position(|o| o.id == id)?;
        Some(self.orders.remove(index))
    }

    fn replace_protective(
        &mut self,
        asset: &str,
        kind: OrderKind,
        price: f64,
        now: DateTime<Utc>,
    ) -> ConditionalOrder {
        let is_stop = matches!(kind, OrderKind::StopLoss { .. });
        self.orders.retain(|o| {
            let same_slot = o.asset == asset
                && o.kind.is_protective()
                && matches!(o.kind, OrderKind::StopLoss { .. }) == is_stop;
            !same_slot
        });

        let order = ConditionalOrder {
            id: Uuid::new_v4(),
            asset: asset.to_string(),
            kind,
            trigger_price: price,
            created_at: now,
        };
        tracing::info!(
            "{} for {} set at ${:.4}",
            if is_stop { "Stop loss" } else { "Take profit" },
            asset,
            price
        );
        self.orders.push(order.clone());
        order
    }

    /// Long stop below entry, long take above; inverted for shorts
    fn validate_exit(&self, position: &Position, price: f64, is_stop: bool) -> Result<f64, TradeError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeError::InvalidOrderParameters(format!(
                "trigger price must be positive, got {}",
                price
            )));
        }

        let entry = position.entry_price;
        // +1 when the level must be above entry
        let direction = (if is_stop { -1.0 } else { 1.0 }) * position.side.sign();
        if (price - entry) * direction > 0.0 {
            return Ok(price);
        }

        let label = if is_stop { "stop-loss" } else { "take-profit" };
        match self.validation {
            StopValidation::Strict => Err(TradeError::InvalidOrderParameters(format!(
                "{} {:.4} must be {} entry {:.4} for a {} position",
                label,
                price,
                if direction > 0.0 { "above" } else { "below" },
                entry,
                position.side
            ))),
            StopValidation::Clamp => {
                let clamped = entry * (1.0 + direction * self.clamp_offset);
                tracing::warn!(
                    "Clamped {} {:.4} to {:.4} for {} {}",
                    label,
                    price,
                    clamped,
                    position.side,
                    position.asset
                );
                Ok(clamped)
            }
        }
    }
}

/// Fill price if the stop is hit; the open if the candle gapped through it
fn stop_fill(order: &ConditionalOrder, candle: &Candle) -> Option<f64> {
    let level = order.trigger_price;
    match order.kind {
        OrderKind::StopLoss { side: Side::Long } if candle.low <= level => {
            Some(if candle.open <= level { candle.open } else { level })
        }
        OrderKind::StopLoss { side: Side::Short } if candle.high >= level => {
            Some(if candle.open >= level { candle.open } else { level })
        }
        _ => None,
    }
}

fn take_fill(order: &ConditionalOrder, candle: &Candle) -> Option<f64> {
    let level = order.trigger_price;
    match order.kind {
        OrderKind::TakeProfit { side: Side::Long } if candle.high >= level => {
            Some(if candle.open >= level { candle.open } else { level })
        }
        OrderKind::TakeProfit { side: Side::Short } if candle.low <= level => {
            Some(if candle.open <= level { candle.open } else { level })
        }
        _ => None,
    }
}
