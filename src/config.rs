use crate::execution::{PnlBasis, StopValidation};
use crate::market::{CandleMode, GeneratorConfig};
use crate::models::{AssetConfig, Timeframe};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub tick_interval_ms: u64,
    pub timeframe: Timeframe,
    pub history_len: usize,
    pub candle_mode: CandleMode,
    /// Fixed seed for reproducible runs; entropy when absent
    pub seed: Option<u64>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            timeframe: Timeframe::M1,
            history_len: 100,
            candle_mode: CandleMode::Synthetic,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub initial_cash: f64,
    pub max_leverage: f64,
    pub default_leverage: f64,
    pub stop_validation: StopValidation,
    /// Relative distance from entry used when clamping bad stop/take values
    pub clamp_offset: f64,
    pub pnl_basis: PnlBasis,
    /// Attach a stop-loss this far from entry on every open (e.g. 0.05)
    pub auto_stop_pct: Option<f64>,
    pub auto_take_pct: Option<f64>,
    /// At most one open position for the whole account
    pub single_position: bool,
    pub conversion_fee: f64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            initial_cash: 1000.0,
            max_leverage: 100.0,
            default_leverage: 1.0,
            stop_validation: StopValidation::Strict,
            clamp_offset: 0.02,
            pnl_basis: PnlBasis::Margin,
            auto_stop_pct: None,
            auto_take_pct: None,
            single_position: false,
            conversion_fee: 0.005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositSettings {
    pub default_apy: f64,
}

impl Default for DepositSettings {
    fn default() -> Self {
        Self { default_apy: 0.12 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub redis_url: String,
    pub namespace: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from("coinsim-state.json"),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            namespace: "coinsim".to_string(),
        }
    }
}

/// Asset to exchange symbol mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSymbol {
    pub asset: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub enabled: bool,
    pub rest_url: String,
    pub ws_url: String,
    pub symbols: Vec<FeedSymbol>,
    pub read_timeout_secs: u64,
    pub history_limit: usize,
    pub requests_per_minute: u32,
    pub fx_url: String,
    pub fx_base: String,
    pub fx_quote: String,
    /// Asset whose price follows the polled FX rate
    pub fx_asset: Option<String>,
    pub fx_poll_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rest_url: "https://api.binance.com".to_string(),
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            symbols: vec![FeedSymbol {
                asset: "VKoin".to_string(),
                symbol: "BTCUSDT".to_string(),
            }],
            read_timeout_secs: 10,
            history_limit: 200,
            requests_per_minute: 600,
            fx_url: "https://api.exchangerate.host".to_string(),
            fx_base: "USD".to_string(),
            fx_quote: "RUB".to_string(),
            fx_asset: None,
            fx_poll_secs: 10,
        }
    }
}

impl FeedSettings {
    pub fn exchange_symbol(&self, asset: &str) -> Option<&str> {
        self.symbols
            .iter()
            .find(|s| s.asset == asset)
            .map(|s| s.symbol.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub market: MarketSettings,
    pub assets: Vec<AssetConfig>,
    pub generator: GeneratorConfig,
    pub trading: TradingSettings,
    pub deposits: DepositSettings,
    pub persistence: PersistenceSettings,
    pub feed: FeedSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            market: MarketSettings::default(),
            assets: default_assets(),
            generator: GeneratorConfig::default(),
            trading: TradingSettings::default(),
            deposits: DepositSettings::default(),
            persistence: PersistenceSettings::default(),
            feed: FeedSettings::default(),
        }
    }
}

fn default_assets() -> Vec<AssetConfig> {
    vec![
        AssetConfig::new("VKoin", 100.0, 1.5),
        AssetConfig::new("Memecoin", 50.0, 3.0),
        AssetConfig::new("Social Token", 200.0, 0.8),
    ]
}

impl Settings {
    /// Load defaults, then the optional TOML file, then `COINSIM_*` env overrides
    ///
    /// Nested keys use `__`, e.g. `COINSIM_TRADING__INITIAL_CASH=5000`.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("COINSIM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text (no env overrides)
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.market.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: String| Err(SettingsError::Invalid(msg));

        if self.assets.is_empty() {
            return invalid("at least one asset must be configured".into());
        }
        let mut seen = HashSet::new();
        for asset in &self.assets {
            if !seen.insert(asset.symbol.as_str()) {
                return invalid(format!("duplicate asset symbol '{}'", asset.symbol));
            }
            if !(asset.price.is_finite() && asset.price > 0.0) {
                return invalid(format!("asset '{}' price must be positive", asset.symbol));
            }
            if !(asset.volatility.is_finite() && asset.volatility > 0.0) {
                return invalid(format!(
                    "asset '{}' volatility must be positive",
                    asset.symbol
                ));
            }
        }

        if self.market.tick_interval_ms == 0 {
            return invalid("market.tick_interval_ms must be > 0".into());
        }
        if !(1..=10_000).contains(&self.market.history_len) {
            return invalid("market.history_len must be within 1..=10000".into());
        }

        let g = &self.generator;
        check_range("generator.crash_range", g.crash_range)?;
        check_range("generator.pump_range", g.pump_range)?;
        check_range("generator.event_multiplier_range", g.event_multiplier_range)?;
        if g.event_duration_ticks.0 > g.event_duration_ticks.1 {
            return invalid("generator.event_duration_ticks is inverted".into());
        }
        for (name, p) in [
            ("generator.shock_probability", g.shock_probability),
            ("generator.event_probability", g.event_probability),
            ("generator.influence_decay", g.influence_decay),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("{} must be within [0, 1]", name));
            }
        }
        if !(g.price_floor.is_finite() && g.price_floor > 0.0) {
            return invalid("generator.price_floor must be positive".into());
        }

        let t = &self.trading;
        if !(t.initial_cash.is_finite() && t.initial_cash >= 0.0) {
            return invalid("trading.initial_cash must be >= 0".into());
        }
        if !(t.max_leverage >= 1.0) {
            return invalid("trading.max_leverage must be >= 1".into());
        }
        if !(t.default_leverage >= 1.0 && t.default_leverage <= t.max_leverage) {
            return invalid("trading.default_leverage must be within [1, max_leverage]".into());
        }
        if !(0.0..1.0).contains(&t.conversion_fee) {
            return invalid("trading.conversion_fee must be within [0, 1)".into());
        }
        if !(t.clamp_offset > 0.0 && t.clamp_offset < 1.0) {
            return invalid("trading.clamp_offset must be within (0, 1)".into());
        }
        for (name, pct) in [
            ("trading.auto_stop_pct", t.auto_stop_pct),
            ("trading.auto_take_pct", t.auto_take_pct),
        ] {
            if let Some(pct) = pct {
                if !(pct > 0.0 && pct < 1.0) {
                    return invalid(format!("{} must be within (0, 1)", name));
                }
            }
        }

        if !(self.deposits.default_apy.is_finite() && self.deposits.default_apy >= 0.0) {
            return invalid("deposits.default_apy must be >= 0".into());
        }

        for mapping in &self.feed.symbols {
            if !seen.contains(mapping.asset.as_str()) {
                return invalid(format!("feed symbol for unknown asset '{}'", mapping.asset));
            }
        }
        if let Some(fx_asset) = &self.feed.fx_asset {
            if !seen.contains(fx_asset.as_str()) {
                return invalid(format!("feed.fx_asset '{}' is not a configured asset", fx_asset));
            }
        }

        Ok(())
    }
}

fn check_range(name: &str, (lo, hi): (f64, f64)) -> Result<(), SettingsError> {
    if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo <= hi) {
        return Err(SettingsError::Invalid(format!(
            "{} must be positive and ordered, got [{}, {}]",
            name, lo, hi
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PriceModel;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.assets.len(), 3);
        assert_eq!(settings.assets[0], AssetConfig::new("VKoin", 100.0, 1.5));
        assert_eq!(settings.trading.initial_cash, 1000.0);
        assert_eq!(settings.trading.stop_validation, StopValidation::Strict);
        assert_eq!(settings.market.timeframe, Timeframe::M1);
    }

    #[test]
    fn test_from_toml_overrides() {
        let toml = r#"
            [market]
            timeframe = "5m"
            candle_mode = "aggregated"
            seed = 7

            [[assets]]
            symbol = "BTC"
            price = 30000.0
            volatility = 0.5

            [generator]
            model = "gbm"
            crash_range = [0.4, 0.6]

            [trading]
            initial_cash = 5000.0
            stop_validation = "clamp"
            pnl_basis = "notional"
        "#;

        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.market.timeframe, Timeframe::M5);
        assert_eq!(settings.market.candle_mode, CandleMode::Aggregated);
        assert_eq!(settings.market.seed, Some(7));
        assert_eq!(settings.assets.len(), 1);
        assert_eq!(settings.assets[0].symbol, "BTC");
        assert_eq!(settings.generator.model, PriceModel::Gbm);
        assert_eq!(settings.generator.crash_range, (0.4, 0.6));
        // Untouched keys keep defaults
        assert_eq!(settings.generator.pump_range, (1.3, 2.0));
        assert_eq!(settings.trading.initial_cash, 5000.0);
        assert_eq!(settings.trading.stop_validation, StopValidation::Clamp);
        assert_eq!(settings.trading.pnl_basis, PnlBasis::Notional);
        assert_eq!(settings.trading.max_leverage, 100.0);
    }

    #[test]
    fn test_rejects_duplicate_symbols() {
        let mut settings = Settings::default();
        settings.assets.push(AssetConfig::new("VKoin", 1.0, 1.0));
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.assets[1].price = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.generator.pump_range = (2.0, 1.3);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.trading.max_leverage = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.assets.clear();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.feed.fx_asset = Some("RUB".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_timeframe_fails_to_load() {
        let toml = r#"
            [market]
            timeframe = "7m"
        "#;
        assert!(matches!(
            Settings::from_toml_str(toml),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coinsim.toml");
        std::fs::write(&path, "[trading]\ninitial_cash = 250.0\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.trading.initial_cash, 250.0);
    }

    #[test]
    fn test_exchange_symbol_lookup() {
        let settings = Settings::default();
        assert_eq!(settings.feed.exchange_symbol("VKoin"), Some("BTCUSDT"));
        assert_eq!(settings.feed.exchange_symbol("Memecoin"), None);
    }
}
