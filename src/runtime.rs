//! Async driver around [`TradingSession`]
//!
//! One task owns the session and serializes everything that touches it:
//! timer ticks, user commands, live feed events and FX rates. Callers talk
//! to it through a cloneable [`SimulatorHandle`].

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::account::{Conversion, Deposit, Holding, TradeStats};
use crate::api::{FeedEvent, FeedEventKind, FeedSubscription, FxRate, FxRateSource, PriceSource};
use crate::config::FeedSymbol;
use crate::error::{SimulatorError, TradeError};
use crate::execution::{ClosedTrade, ConditionalOrder, Position};
use crate::models::{Notification, OrderSize, Side, Timeframe, TradeSide};
use crate::persistence::{load_state, save_state, KeyValueStore};
use crate::session::{SimEvent, TradingSession};

const COMMAND_CAPACITY: usize = 64;
const FEED_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, TradeError>>;

enum Command {
    OpenPosition {
        asset: String,
        side: Side,
        size: OrderSize,
        leverage: Option<f64>,
        reply: Reply<Position>,
    },
    ClosePosition {
        asset: String,
        reply: Reply<ClosedTrade>,
    },
    SetStopLoss {
        asset: String,
        price: f64,
        reply: Reply<ConditionalOrder>,
    },
    SetTakeProfit {
        asset: String,
        price: f64,
        reply: Reply<ConditionalOrder>,
    },
    PlaceLimit {
        asset: String,
        side: TradeSide,
        size: OrderSize,
        price: f64,
        reply: Reply<ConditionalOrder>,
    },
    CancelOrder {
        id: Uuid,
        reply: Reply<ConditionalOrder>,
    },
    BuyAsset {
        asset: String,
        cash: f64,
        reply: Reply<Conversion>,
    },
    SellAsset {
        asset: String,
        quantity: f64,
        reply: Reply<Conversion>,
    },
    OpenDeposit {
        holding: Holding,
        amount: f64,
        annual_rate: Option<f64>,
        reply: Reply<Uuid>,
    },
    WithdrawDeposit {
        id: Uuid,
        reply: Reply<Deposit>,
    },
    SwitchTimeframe {
        timeframe: Timeframe,
        reply: Reply<()>,
    },
    SetLeverage {
        leverage: f64,
        reply: Reply<()>,
    },
    Summary {
        reply: oneshot::Sender<SessionSummary>,
    },
}

/// Point-in-time view of the session for display
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub cash: f64,
    pub assets: BTreeMap<String, f64>,
    pub prices: HashMap<String, f64>,
    pub positions: Vec<Position>,
    pub orders: Vec<ConditionalOrder>,
    pub deposits: Vec<Deposit>,
    pub stats: TradeStats,
    pub wealth: f64,
    pub timeframe: Timeframe,
    pub leverage: f64,
    pub recent_activity: Vec<Notification>,
}

impl SessionSummary {
    fn of(session: &TradingSession) -> Self {
        Self {
            cash: session.ledger().cash(),
            assets: session.ledger().asset_balances().clone(),
            prices: session.market().prices(),
            positions: session.positions().open_positions().to_vec(),
            orders: session.orders().orders().to_vec(),
            deposits: session.ledger().deposits().to_vec(),
            stats: session.ledger().stats().clone(),
            wealth: session.wealth(),
            timeframe: session.timeframe(),
            leverage: session.default_leverage(),
            recent_activity: session.activity().iter().cloned().collect(),
        }
    }
}

struct LiveFeed {
    source: Arc<dyn PriceSource>,
    symbols: Vec<FeedSymbol>,
    history_limit: usize,
}

struct FxFeed {
    source: Arc<dyn FxRateSource>,
    asset: String,
    poll: Duration,
}

/// Owns a session plus the collaborators the loop needs
pub struct Simulator {
    session: TradingSession,
    store: Arc<dyn KeyValueStore>,
    tick_interval: Duration,
    feed: Option<LiveFeed>,
    fx: Option<FxFeed>,
}

impl Simulator {
    pub fn new(
        session: TradingSession,
        store: Arc<dyn KeyValueStore>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            session,
            store,
            tick_interval,
            feed: None,
            fx: None,
        }
    }

    /// Drive the listed assets from an external candle source
    pub fn with_price_source(
        mut self,
        source: Arc<dyn PriceSource>,
        symbols: Vec<FeedSymbol>,
        history_limit: usize,
    ) -> Self {
        self.feed = Some(LiveFeed {
            source,
            symbols,
            history_limit,
        });
        self
    }

    /// Feed polled FX rates into `asset` as price samples
    pub fn with_fx_source(mut self, source: Arc<dyn FxRateSource>, asset: &str, poll: Duration) -> Self {
        self.fx = Some(FxFeed {
            source,
            asset: asset.to_string(),
            poll,
        });
        self
    }

    pub fn session(&self) -> &TradingSession {
        &self.session
    }

    /// Load persisted state into the session
    pub async fn restore(&mut self) {
        let state = load_state(self.store.as_ref()).await;
        if state.is_empty() {
            tracing::info!("No stored state, starting a fresh session");
            return;
        }
        self.session.restore(state, Utc::now());
    }

    /// Start the loop; it stops on `SimulatorHandle::shutdown` or when every handle is dropped
    pub fn spawn(self) -> (SimulatorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = SimulatorHandle {
            commands: commands_tx,
            shutdown: Arc::new(shutdown_tx),
            events: self.session.event_sender(),
        };
        let task = tokio::spawn(self.run(commands_rx, shutdown_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let (feed_tx, mut feed_rx) = mpsc::channel(FEED_CAPACITY);
        let mut subscriptions = self.start_feeds(&feed_tx).await;

        let (fx_tx, mut fx_rx) = mpsc::channel(8);
        let fx_task = self.fx.as_ref().map(|fx| spawn_fx_poller(fx, fx_tx));

        let mut ticker = self.new_ticker();
        tracing::info!(
            "Simulator started: {} assets, tick every {:?}",
            self.session.market().symbols().len(),
            self.tick_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let updated = self.session.tick(Utc::now());
                    tracing::debug!("Tick updated {} assets", updated);
                    self.persist_if_dirty().await;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("All simulator handles dropped");
                        break;
                    };
                    if let Some(timeframe) = self.handle_command(command) {
                        subscriptions.clear();
                        self.take_feeds_offline();
                        subscriptions = self.start_feeds(&feed_tx).await;
                        ticker = self.new_ticker();
                        tracing::info!("Switched to {} candles", timeframe);
                    }
                    self.persist_if_dirty().await;
                }
                Some(event) = feed_rx.recv() => {
                    self.handle_feed_event(event);
                    self.persist_if_dirty().await;
                }
                Some(rate) = fx_rx.recv() => {
                    self.handle_fx_rate(rate);
                    self.persist_if_dirty().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown requested");
                        break;
                    }
                }
            }
        }

        drop(subscriptions);
        if let Some(task) = fx_task {
            task.abort();
        }
        if save_state(self.store.as_ref(), &self.session.snapshot()).await {
            tracing::info!("Final state saved");
        }
    }

    fn new_ticker(&self) -> Interval {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn persist_if_dirty(&mut self) {
        if self.session.take_dirty() {
            save_state(self.store.as_ref(), &self.session.snapshot()).await;
        }
    }

    /// Apply one command; returns the new timeframe after a successful switch
    fn handle_command(&mut self, command: Command) -> Option<Timeframe> {
        let now = Utc::now();
        let session = &mut self.session;
        match command {
            Command::OpenPosition {
                asset,
                side,
                size,
                leverage,
                reply,
            } => {
                let _ = reply.send(session.open_position(&asset, side, size, leverage, now));
            }
            Command::ClosePosition { asset, reply } => {
                let _ = reply.send(session.close_position(&asset, now));
            }
            Command::SetStopLoss { asset, price, reply } => {
                let _ = reply.send(session.set_stop_loss(&asset, price, now));
            }
            Command::SetTakeProfit { asset, price, reply } => {
                let _ = reply.send(session.set_take_profit(&asset, price, now));
            }
            Command::PlaceLimit {
                asset,
                side,
                size,
                price,
                reply,
            } => {
                let _ = reply.send(session.place_limit_order(&asset, side, size, price, now));
            }
            Command::CancelOrder { id, reply } => {
                let _ = reply.send(session.cancel_order(id));
            }
            Command::BuyAsset { asset, cash, reply } => {
                let _ = reply.send(session.buy_asset(&asset, cash, now));
            }
            Command::SellAsset {
                asset,
                quantity,
                reply,
            } => {
                let _ = reply.send(session.sell_asset(&asset, quantity, now));
            }
            Command::OpenDeposit {
                holding,
                amount,
                annual_rate,
                reply,
            } => {
                let _ = reply.send(session.open_deposit(holding, amount, annual_rate, now));
            }
            Command::WithdrawDeposit { id, reply } => {
                let _ = reply.send(session.withdraw_deposit(id, now));
            }
            Command::SwitchTimeframe { timeframe, reply } => {
                let result = session.switch_timeframe(timeframe, now);
                let switched = result.is_ok();
                let _ = reply.send(result);
                if switched {
                    return Some(timeframe);
                }
            }
            Command::SetLeverage { leverage, reply } => {
                let _ = reply.send(session.set_default_leverage(leverage));
            }
            Command::Summary { reply } => {
                let _ = reply.send(SessionSummary::of(session));
            }
        }
        None
    }

    /// Seed history and open live subscriptions for the current timeframe
    async fn start_feeds(&mut self, events: &mpsc::Sender<FeedEvent>) -> Vec<FeedSubscription> {
        let Some(feed) = &self.feed else {
            return Vec::new();
        };
        let timeframe = self.session.timeframe();
        let mut subscriptions = Vec::new();

        for FeedSymbol { asset, symbol } in &feed.symbols {
            if !self.session.market().contains(asset) {
                tracing::warn!("Feed symbol {} maps to unknown asset {}", symbol, asset);
                continue;
            }

            match feed
                .source
                .fetch_historical_candles(symbol, timeframe, feed.history_limit)
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    let count = candles.len();
                    match self.session.seed_history(asset, candles) {
                        Ok(()) => tracing::info!("Seeded {} with {} {} candles", asset, count, timeframe),
                        Err(e) => tracing::warn!("Could not seed {}: {}", asset, e),
                    }
                }
                Ok(_) => tracing::warn!("No history for {}, keeping synthetic seed", symbol),
                Err(e) => tracing::warn!("History for {} unavailable, keeping synthetic seed: {}", symbol, e),
            }

            match feed.source.subscribe(symbol, timeframe, events.clone()).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => tracing::warn!("Could not subscribe to {}: {}", symbol, e),
            }
        }
        subscriptions
    }

    fn take_feeds_offline(&mut self) {
        let Some(feed) = &self.feed else {
            return;
        };
        let assets: Vec<String> = feed.symbols.iter().map(|s| s.asset.clone()).collect();
        let now = Utc::now();
        for asset in assets {
            self.session.set_feed_online(&asset, false, now);
        }
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        let Some(feed) = &self.feed else {
            return;
        };
        // Events from a subscription opened before the last timeframe switch
        if event.timeframe != self.session.timeframe() {
            return;
        }
        let Some(asset) = feed
            .symbols
            .iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(&event.symbol))
            .map(|s| s.asset.clone())
        else {
            return;
        };

        let now = Utc::now();
        match event.kind {
            FeedEventKind::Candle { candle, is_final } => {
                if !self.session.market().is_online(&asset) {
                    self.session.set_feed_online(&asset, true, now);
                }
                tracing::debug!(
                    "{} candle {} close {} (final: {})",
                    asset,
                    candle.time,
                    candle.close,
                    is_final
                );
                self.session.apply_external_candle(&asset, candle, now);
            }
            FeedEventKind::Status { connected, text } => {
                tracing::info!("{} feed status: {}", event.symbol, text);
                self.session.set_feed_online(&asset, connected, now);
            }
        }
    }

    fn handle_fx_rate(&mut self, rate: FxRate) {
        let Some(fx) = &self.fx else {
            return;
        };
        let asset = fx.asset.clone();
        let now = Utc::now();
        tracing::debug!("{}/{} rate {} -> {}", rate.base, rate.quote, rate.rate, asset);
        // The rate replaces the synthetic walk for this asset
        if !self.session.market().is_online(&asset) {
            self.session.set_feed_online(&asset, true, now);
        }
        self.session.apply_external_sample(&asset, rate.rate, now);
    }
}

fn spawn_fx_poller(fx: &FxFeed, rates: mpsc::Sender<FxRate>) -> JoinHandle<()> {
    let source = Arc::clone(&fx.source);
    let poll = fx.poll;
    tokio::spawn(async move {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match source.fetch_rate().await {
                Ok(rate) => {
                    if rates.send(rate).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!("FX rate unavailable: {}", e),
            }
        }
    })
}

/// Cloneable front end to a running [`Simulator`]
#[derive(Clone)]
pub struct SimulatorHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<SimEvent>,
}

impl SimulatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SimulatorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SimulatorError::Stopped)?;
        rx.await.map_err(|_| SimulatorError::Stopped)
    }

    pub async fn open_position(
        &self,
        asset: &str,
        side: Side,
        size: OrderSize,
        leverage: Option<f64>,
    ) -> Result<Position, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::OpenPosition {
                asset,
                side,
                size,
                leverage,
                reply,
            })
            .await??)
    }

    pub async fn close_position(&self, asset: &str) -> Result<ClosedTrade, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::ClosePosition { asset, reply })
            .await??)
    }

    pub async fn set_stop_loss(&self, asset: &str, price: f64) -> Result<ConditionalOrder, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::SetStopLoss { asset, price, reply })
            .await??)
    }

    pub async fn set_take_profit(&self, asset: &str, price: f64) -> Result<ConditionalOrder, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::SetTakeProfit { asset, price, reply })
            .await??)
    }

    pub async fn place_limit_order(
        &self,
        asset: &str,
        side: TradeSide,
        size: OrderSize,
        price: f64,
    ) -> Result<ConditionalOrder, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::PlaceLimit {
                asset,
                side,
                size,
                price,
                reply,
            })
            .await??)
    }

    pub async fn cancel_order(&self, id: Uuid) -> Result<ConditionalOrder, SimulatorError> {
        Ok(self
            .request(|reply| Command::CancelOrder { id, reply })
            .await??)
    }

    pub async fn buy_asset(&self, asset: &str, cash: f64) -> Result<Conversion, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::BuyAsset { asset, cash, reply })
            .await??)
    }

    pub async fn sell_asset(&self, asset: &str, quantity: f64) -> Result<Conversion, SimulatorError> {
        let asset = asset.to_string();
        Ok(self
            .request(|reply| Command::SellAsset {
                asset,
                quantity,
                reply,
            })
            .await??)
    }

    pub async fn open_deposit(
        &self,
        holding: Holding,
        amount: f64,
        annual_rate: Option<f64>,
    ) -> Result<Uuid, SimulatorError> {
        Ok(self
            .request(|reply| Command::OpenDeposit {
                holding,
                amount,
                annual_rate,
                reply,
            })
            .await??)
    }

    pub async fn withdraw_deposit(&self, id: Uuid) -> Result<Deposit, SimulatorError> {
        Ok(self
            .request(|reply| Command::WithdrawDeposit { id, reply })
            .await??)
    }

    pub async fn switch_timeframe(&self, timeframe: Timeframe) -> Result<(), SimulatorError> {
        Ok(self
            .request(|reply| Command::SwitchTimeframe { timeframe, reply })
            .await??)
    }

    pub async fn set_leverage(&self, leverage: f64) -> Result<(), SimulatorError> {
        Ok(self
            .request(|reply| Command::SetLeverage { leverage, reply })
            .await??)
    }

    pub async fn summary(&self) -> Result<SessionSummary, SimulatorError> {
        self.request(|reply| Command::Summary { reply }).await
    }
}
