use super::aggregator::{CandleAggregator, CandleUpdate};
use super::generator::{AssetDynamics, MarketEvent, PriceGenerator, Shock};
use crate::error::TradeError;
use crate::models::{AssetConfig, Candle, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How synthetic ticks become candles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleMode {
    /// One full OHLC step per tick, merged into the current timeframe bucket
    Synthetic,
    /// One price sample per tick, bucketed by timeframe
    Aggregated,
}

/// Candle change for one asset, produced by a tick or an external source
#[derive(Debug, Clone, PartialEq)]
pub struct MarketUpdate {
    pub asset: String,
    pub price: f64,
    pub update: CandleUpdate,
    /// Price path covered by this update alone; orders are matched against it
    pub range: Candle,
    pub shock: Option<Shock>,
    pub event_started: Option<MarketEvent>,
}

struct TrackedAsset {
    config: AssetConfig,
    price: f64,
    dynamics: AssetDynamics,
    aggregator: CandleAggregator,
    /// External source is driving this asset
    online: bool,
    last_tick: Option<DateTime<Utc>>,
}

/// Drives prices and candles for every configured asset
pub struct MarketFeed {
    assets: Vec<TrackedAsset>,
    generator: PriceGenerator,
    mode: CandleMode,
    tick_seconds: f64,
    history_len: usize,
}

impl MarketFeed {
    /// Create a feed for the given assets
    ///
    /// # Arguments
    /// * `tick_seconds` - nominal tick length, used as dt for synthetic candles
    pub fn new(
        assets: Vec<AssetConfig>,
        generator: PriceGenerator,
        mode: CandleMode,
        timeframe: Timeframe,
        history_len: usize,
        tick_seconds: f64,
    ) -> Self {
        let assets = assets
            .into_iter()
            .map(|config| TrackedAsset {
                price: config.price,
                config,
                dynamics: AssetDynamics::default(),
                aggregator: CandleAggregator::new(timeframe, history_len),
                online: false,
                last_tick: None,
            })
            .collect();

        Self {
            assets,
            generator,
            mode,
            tick_seconds: tick_seconds.max(0.001),
            history_len,
        }
    }

    pub fn mode(&self) -> CandleMode {
        self.mode
    }

    pub fn history_len(&self) -> usize {
        self.history_len
    }

    /// Advance every offline asset by one step
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<MarketUpdate> {
        let mut updates = Vec::with_capacity(self.assets.len());
        let now_ts = now.timestamp();

        for tracked in self.assets.iter_mut().filter(|a| !a.online) {
            let update = match self.mode {
                CandleMode::Synthetic => {
                    let bucket = tracked.aggregator.timeframe().bucket_start(now_ts);
                    let (step_candle, step) = self.generator.next_candle(
                        &mut tracked.dynamics,
                        tracked.price,
                        tracked.config.volatility,
                        self.tick_seconds,
                        bucket,
                    );
                    // Within the open bucket, merge into the open candle
                    let candle = match tracked.aggregator.latest() {
                        Some(open) if open.time >= bucket => Candle {
                            time: open.time,
                            open: open.open,
                            high: open.high.max(step_candle.high),
                            low: open.low.min(step_candle.low),
                            close: step_candle.close,
                        },
                        _ => step_candle,
                    };
                    tracked.aggregator.append_candle(candle).map(|update| MarketUpdate {
                        asset: tracked.config.symbol.clone(),
                        price: candle.close,
                        update,
                        range: step_candle,
                        shock: step.shock,
                        event_started: step.event_started,
                    })
                }
                CandleMode::Aggregated => {
                    let dt = tracked
                        .last_tick
                        .map(|last| (now - last).num_milliseconds() as f64 / 1000.0)
                        .filter(|dt| *dt > 0.0)
                        .unwrap_or(self.tick_seconds);
                    let step = self.generator.step(
                        &mut tracked.dynamics,
                        tracked.price,
                        tracked.config.volatility,
                        dt,
                    );
                    let range = path_between(tracked.price, step.price, now_ts);
                    tracked
                        .aggregator
                        .append_sample(step.price, now_ts)
                        .map(|update| MarketUpdate {
                            asset: tracked.config.symbol.clone(),
                            price: step.price,
                            update,
                            range,
                            shock: step.shock,
                            event_started: step.event_started,
                        })
                }
            };

            tracked.last_tick = Some(now);
            if let Some(update) = update {
                tracked.price = update.price;
                if let Some(shock) = update.shock {
                    tracing::info!(asset = %update.asset, ?shock, price = update.price, "Market shock");
                }
                updates.push(update);
            }
        }

        tracing::debug!(assets = updates.len(), "Market tick");
        updates
    }

    pub fn current_price(&self, asset: &str) -> Option<f64> {
        self.find(asset).map(|a| a.price)
    }

    /// Current price or `UnknownAsset`
    pub fn price_of(&self, asset: &str) -> Result<f64, TradeError> {
        self.current_price(asset)
            .ok_or_else(|| TradeError::UnknownAsset(asset.to_string()))
    }

    pub fn prices(&self) -> HashMap<String, f64> {
        self.assets
            .iter()
            .map(|a| (a.config.symbol.clone(), a.price))
            .collect()
    }

    pub fn candles(&self, asset: &str) -> Option<Vec<Candle>> {
        self.find(asset).map(|a| a.aggregator.candles())
    }

    pub fn latest_candle(&self, asset: &str) -> Option<Candle> {
        self.find(asset).and_then(|a| a.aggregator.latest().copied())
    }

    pub fn timeframe(&self, asset: &str) -> Option<Timeframe> {
        self.find(asset).map(|a| a.aggregator.timeframe())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.config.symbol.clone()).collect()
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.find(asset).is_some()
    }

    /// Change the candle interval of one asset, keeping its running price
    ///
    /// History restarts with a flat candle at the current price.
    pub fn switch_timeframe(
        &mut self,
        asset: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<(), TradeError> {
        let tracked = self.find_mut(asset)?;
        tracked.aggregator.reset(timeframe);
        tracked
            .aggregator
            .append_candle(Candle::flat(timeframe.bucket_start(now.timestamp()), tracked.price));
        tracked.last_tick = None;

        tracing::info!(asset, timeframe = %timeframe, price = tracked.price, "Switched timeframe");
        Ok(())
    }

    /// Replace an asset's history (e.g. from an exchange); price follows the last close
    pub fn seed_history(&mut self, asset: &str, candles: Vec<Candle>) -> Result<(), TradeError> {
        let tracked = self.find_mut(asset)?;
        tracked.aggregator.seed(candles);
        if let Some(last) = tracked.aggregator.latest() {
            tracked.price = last.close;
        }
        Ok(())
    }

    /// Restore a persisted price without touching history
    pub fn set_price(&mut self, asset: &str, price: f64) -> Result<(), TradeError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(TradeError::InvalidAmount(price));
        }
        self.find_mut(asset)?.price = price;
        Ok(())
    }

    /// Push a candle from an external source
    pub fn apply_external_candle(&mut self, asset: &str, candle: Candle) -> Option<MarketUpdate> {
        let tracked = self.find_mut(asset).ok()?;
        let update = tracked.aggregator.append_candle(candle)?;
        tracked.price = candle.close;
        Some(MarketUpdate {
            asset: asset.to_string(),
            price: candle.close,
            update,
            range: candle,
            shock: None,
            event_started: None,
        })
    }

    /// Push a bare price (e.g. a polled FX rate)
    ///
    /// Folds into the open candle if synthetic candles already run ahead of `now`.
    pub fn apply_external_sample(
        &mut self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<MarketUpdate> {
        let tracked = self.find_mut(asset).ok()?;
        let now_ts = now.timestamp();
        let ts = match tracked.aggregator.latest() {
            Some(open) if open.time > now_ts => open.time,
            _ => now_ts,
        };
        let update = tracked.aggregator.append_sample(price, ts)?;
        let range = path_between(tracked.price, price, ts);
        tracked.price = price;
        Some(MarketUpdate {
            asset: asset.to_string(),
            price,
            update,
            range,
            shock: None,
            event_started: None,
        })
    }

    /// Toggle the external source for an asset; returns true if the flag changed
    ///
    /// Going offline keeps the last known price as the synthetic seed.
    pub fn set_online(&mut self, asset: &str, online: bool) -> bool {
        let Ok(tracked) = self.find_mut(asset) else {
            return false;
        };
        if tracked.online == online {
            return false;
        }
        tracked.online = online;
        tracked.last_tick = None;

        if online {
            tracing::info!(asset, "External feed online");
        } else {
            tracing::warn!(asset, price = tracked.price, "External feed offline, using synthetic prices");
        }
        true
    }

    pub fn is_online(&self, asset: &str) -> bool {
        self.find(asset).map(|a| a.online).unwrap_or(false)
    }

    /// Nudge the synthetic price of an asset (market impact of user trades)
    pub fn add_influence(&mut self, asset: &str, amount: f64) {
        if let Ok(tracked) = self.find_mut(asset) {
            tracked.dynamics.add_influence(amount);
        }
    }

    /// Market impact of one trade in the given direction (+1 buy pressure, -1 sell)
    pub fn record_trade_impact(&mut self, asset: &str, direction: f64) {
        let impact = self.generator.config().impact_per_trade * direction.signum();
        self.add_influence(asset, impact);
    }

    pub fn influence(&self, asset: &str) -> Option<f64> {
        self.find(asset).map(|a| a.dynamics.influence)
    }

    fn find(&self, asset: &str) -> Option<&TrackedAsset> {
        self.assets.iter().find(|a| a.config.symbol == asset)
    }

    fn find_mut(&mut self, asset: &str) -> Result<&mut TrackedAsset, TradeError> {
        self.assets
            .iter_mut()
            .find(|a| a.config.symbol == asset)
            .ok_or_else(|| TradeError::UnknownAsset(asset.to_string()))
    }
}

/// Straight move from `from` to `to`
fn path_between(from: f64, to: f64, time: i64) -> Candle {
    Candle {
        time,
        open: from,
        high: from.max(to),
        low: from.min(to),
        close: to,
    }
}
