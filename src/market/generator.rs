use crate::models::Candle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape of the per-tick price change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceModel {
    /// `change = (u - 0.5) * volatility%`, linear in dt
    RandomWalk,
    /// `price * exp(drift + shock)`, shock scaled by sqrt(dt)
    Gbm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model: PriceModel,
    /// Per-second log drift (gbm only)
    pub drift: f64,
    /// Multiplier applied to accumulated influence after every tick
    pub influence_decay: f64,
    /// Influence added by one trade, signed by direction
    pub impact_per_trade: f64,
    pub price_floor: f64,
    /// Max relative wick length beyond the candle body
    pub wick_noise: f64,
    pub shock_probability: f64,
    pub crash_range: (f64, f64),
    pub pump_range: (f64, f64),
    pub event_probability: f64,
    pub event_multiplier_range: (f64, f64),
    pub event_duration_ticks: (u32, u32),
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: PriceModel::RandomWalk,
            drift: 0.0,
            influence_decay: 0.98,
            impact_per_trade: 0.002,
            price_floor: 0.01,
            wick_noise: 0.002,
            shock_probability: 0.005,
            crash_range: (0.3, 0.7),
            pump_range: (1.3, 2.0),
            event_probability: 0.01,
            event_multiplier_range: (1.5, 3.0),
            event_duration_ticks: (5, 30),
        }
    }
}

/// Temporary volatility regime ("news")
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketEvent {
    pub multiplier: f64,
    pub remaining_ticks: u32,
}

/// Rare multiplicative jump applied on top of the regular move
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shock {
    Crash(f64),
    Pump(f64),
}

impl Shock {
    pub fn multiplier(self) -> f64 {
        match self {
            Shock::Crash(m) | Shock::Pump(m) => m,
        }
    }
}

/// Per-asset generator state carried between ticks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetDynamics {
    pub influence: f64,
    pub event: Option<MarketEvent>,
}

impl AssetDynamics {
    pub fn add_influence(&mut self, amount: f64) {
        if amount.is_finite() {
            self.influence += amount;
        }
    }
}

/// Result of advancing one asset by one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceStep {
    pub price: f64,
    pub shock: Option<Shock>,
    pub event_started: Option<MarketEvent>,
}

/// Seedable synthetic price source
pub struct PriceGenerator {
    rng: StdRng,
    config: GeneratorConfig,
}

impl PriceGenerator {
    /// Create a generator with a seed for reproducibility
    pub fn new(seed: u64, config: GeneratorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config,
        }
    }

    /// Create a generator seeded from OS entropy
    pub fn from_entropy(config: GeneratorConfig) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            config,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Next price from the regular move only (no shocks, no events)
    ///
    /// # Arguments
    /// * `volatility` - percent scale of the move
    /// * `dt_seconds` - time since the previous sample
    /// * `influence` - additive bias of the shock term, e.g. from user trading
    pub fn next_price(
        &mut self,
        current_price: f64,
        volatility: f64,
        dt_seconds: f64,
        influence: f64,
    ) -> f64 {
        let floor = self.config.price_floor;
        let current = if current_price.is_finite() {
            current_price.max(floor)
        } else {
            floor
        };
        let dt = if dt_seconds.is_finite() {
            dt_seconds.max(0.0)
        } else {
            0.0
        };
        let sigma = volatility.abs() / 100.0;

        let next = match self.config.model {
            PriceModel::RandomWalk => {
                let u: f64 = self.rng.gen();
                let change = (u - 0.5) * sigma * dt + influence;
                current * (1.0 + change)
            }
            PriceModel::Gbm => {
                let z = self.standard_normal();
                let drift = (self.config.drift - 0.5 * sigma * sigma) * dt;
                let shock = sigma * dt.sqrt() * z + influence;
                current * (drift + shock).exp()
            }
        };

        if next.is_finite() {
            next.max(floor)
        } else {
            floor
        }
    }

    /// Advance one asset: event regime, regular move, rare shock, influence decay
    pub fn step(
        &mut self,
        dynamics: &mut AssetDynamics,
        current_price: f64,
        volatility: f64,
        dt_seconds: f64,
    ) -> PriceStep {
        let event_started = self.maybe_start_event(dynamics);
        let vol_scale = dynamics.event.map(|e| e.multiplier).unwrap_or(1.0);

        let mut price = self.next_price(
            current_price,
            volatility * vol_scale,
            dt_seconds,
            dynamics.influence,
        );

        let shock = self.maybe_shock();
        if let Some(shock) = shock {
            price = (price * shock.multiplier()).max(self.config.price_floor);
        }

        dynamics.influence *= self.config.influence_decay;
        if let Some(event) = dynamics.event.as_mut() {
            event.remaining_ticks = event.remaining_ticks.saturating_sub(1);
            if event.remaining_ticks == 0 {
                dynamics.event = None;
            }
        }

        PriceStep {
            price,
            shock,
            event_started,
        }
    }

    /// Generate a full candle that opens at the previous close
    pub fn next_candle(
        &mut self,
        dynamics: &mut AssetDynamics,
        last_close: f64,
        volatility: f64,
        dt_seconds: f64,
        time: i64,
    ) -> (Candle, PriceStep) {
        let floor = self.config.price_floor;
        let open = last_close.max(floor);
        let step = self.step(dynamics, open, volatility, dt_seconds);
        let close = step.price;

        let noise = self.config.wick_noise.max(0.0);
        let body_high = open.max(close);
        let body_low = open.min(close);
        let high = body_high * (1.0 + self.rng.gen::<f64>() * noise);
        let low = (body_low * (1.0 - self.rng.gen::<f64>() * noise)).max(floor.min(body_low));

        let candle = Candle {
            time,
            open,
            high,
            low,
            close,
        };
        (candle, step)
    }

    fn maybe_start_event(&mut self, dynamics: &mut AssetDynamics) -> Option<MarketEvent> {
        if dynamics.event.is_some() || self.rng.gen::<f64>() >= self.config.event_probability {
            return None;
        }

        let (lo, hi) = self.config.event_multiplier_range;
        let multiplier = self.uniform(lo, hi);
        let (min_ticks, max_ticks) = self.config.event_duration_ticks;
        let remaining_ticks = if max_ticks > min_ticks {
            self.rng.gen_range(min_ticks..=max_ticks)
        } else {
            min_ticks
        }
        .max(1);

        let event = MarketEvent {
            multiplier,
            remaining_ticks,
        };
        dynamics.event = Some(event);
        Some(event)
    }

    fn maybe_shock(&mut self) -> Option<Shock> {
        if self.rng.gen::<f64>() >= self.config.shock_probability {
            return None;
        }
        if self.rng.gen_bool(0.5) {
            let (lo, hi) = self.config.crash_range;
            Some(Shock::Crash(self.uniform(lo, hi)))
        } else {
            let (lo, hi) = self.config.pump_range;
            Some(Shock::Pump(self.uniform(lo, hi)))
        }
    }

    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.rng.gen::<f64>()
    }

    // Box-Muller
    fn standard_normal(&mut self) -> f64 {
        let u1 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> GeneratorConfig {
        GeneratorConfig {
            shock_probability: 0.0,
            event_probability: 0.0,
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn test_same_seed_same_path() {
        let mut a = PriceGenerator::new(42, GeneratorConfig::default());
        let mut b = PriceGenerator::new(42, GeneratorConfig::default());
        let mut da = AssetDynamics::default();
        let mut db = AssetDynamics::default();

        let mut pa = 100.0;
        let mut pb = 100.0;
        for _ in 0..200 {
            pa = a.step(&mut da, pa, 1.5, 1.0).price;
            pb = b.step(&mut db, pb, 1.5, 1.0).price;
        }
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_random_walk_bounded_by_volatility() {
        let mut gen = PriceGenerator::new(7, quiet_config());
        let mut price = 100.0;
        for _ in 0..500 {
            let next = gen.next_price(price, 2.0, 1.0, 0.0);
            // (u - 0.5) * 2% => at most 1% either way
            assert!((next / price - 1.0).abs() <= 0.01 + 1e-12);
            price = next;
        }
    }

    #[test]
    fn test_price_never_below_floor() {
        let config = GeneratorConfig {
            shock_probability: 0.5,
            crash_range: (0.3, 0.31),
            pump_range: (0.3, 0.31),
            ..GeneratorConfig::default()
        };
        let mut gen = PriceGenerator::new(1, config);
        let mut dynamics = AssetDynamics::default();
        let mut price = 1.0;
        for _ in 0..2_000 {
            price = gen.step(&mut dynamics, price, 50.0, 1.0).price;
            assert!(price >= 0.01);
        }
    }

    #[test]
    fn test_positive_influence_biases_upward() {
        let mut gen = PriceGenerator::new(3, quiet_config());
        // With zero volatility the move is exactly the influence
        let next = gen.next_price(100.0, 0.0, 1.0, 0.01);
        assert!((next - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_influence_decays_each_tick() {
        let mut gen = PriceGenerator::new(3, quiet_config());
        let mut dynamics = AssetDynamics::default();
        dynamics.add_influence(0.01);

        gen.step(&mut dynamics, 100.0, 1.0, 1.0);
        assert!((dynamics.influence - 0.0098).abs() < 1e-12);

        for _ in 0..300 {
            gen.step(&mut dynamics, 100.0, 1.0, 1.0);
        }
        assert!(dynamics.influence.abs() < 1e-4);
    }

    #[test]
    fn test_event_scales_volatility_then_expires() {
        let config = GeneratorConfig {
            shock_probability: 0.0,
            event_probability: 1.0,
            event_multiplier_range: (2.0, 2.0),
            event_duration_ticks: (3, 3),
            ..GeneratorConfig::default()
        };
        let mut gen = PriceGenerator::new(9, config);
        let mut dynamics = AssetDynamics::default();

        let step = gen.step(&mut dynamics, 100.0, 1.0, 1.0);
        let event = step.event_started.expect("event should start");
        assert_eq!(event.multiplier, 2.0);
        assert_eq!(dynamics.event.unwrap().remaining_ticks, 2);

        // No new event while one is active
        let step = gen.step(&mut dynamics, 100.0, 1.0, 1.0);
        assert!(step.event_started.is_none());
        gen.step(&mut dynamics, 100.0, 1.0, 1.0);
        assert!(dynamics.event.is_none());
    }

    #[test]
    fn test_shock_applies_multiplier() {
        let config = GeneratorConfig {
            shock_probability: 1.0,
            event_probability: 0.0,
            crash_range: (0.5, 0.5),
            pump_range: (1.5, 1.5),
            ..GeneratorConfig::default()
        };
        let mut gen = PriceGenerator::new(11, config);
        let mut dynamics = AssetDynamics::default();

        let step = gen.step(&mut dynamics, 100.0, 0.0, 1.0);
        match step.shock {
            Some(Shock::Crash(m)) => assert!((step.price - 100.0 * m).abs() < 1e-9),
            Some(Shock::Pump(m)) => assert!((step.price - 100.0 * m).abs() < 1e-9),
            None => panic!("shock probability 1.0 must shock"),
        }
    }

    #[test]
    fn test_gbm_stays_positive() {
        let config = GeneratorConfig {
            model: PriceModel::Gbm,
            ..GeneratorConfig::default()
        };
        let mut gen = PriceGenerator::new(5, config);
        let mut dynamics = AssetDynamics::default();
        let mut price = 50.0;
        for _ in 0..1_000 {
            price = gen.step(&mut dynamics, price, 5.0, 2.0).price;
            assert!(price > 0.0 && price.is_finite());
        }
    }

    #[test]
    fn test_next_candle_ohlc_consistency() {
        let mut gen = PriceGenerator::new(42, GeneratorConfig::default());
        let mut dynamics = AssetDynamics::default();
        let mut close = 100.0;

        for i in 0..500 {
            let (candle, _) = gen.next_candle(&mut dynamics, close, 3.0, 1.0, i * 60);
            assert_eq!(candle.open, close.max(0.01));
            assert!(candle.is_consistent(), "inconsistent candle {:?}", candle);
            close = candle.close;
        }
    }
}
