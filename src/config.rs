// Configuration management for the trading bot
//
// All tunables live in one TOML file. The file is read at startup and may be
// hot-reloaded between engine cycles, never mid-cycle. Updates through
// `apply_update` are validated against the typed schema; unknown fields are
// rejected rather than silently attached.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::broker::Timeframe;

/// Position sizing method, selectable per run and overridable in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Fixed,
    RiskBased,
    Kelly,
    VolatilityAdjusted,
    CorrelationAdjusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cycle_interval_ms: u64,
    pub broker_timeout_ms: u64,
    pub candle_history: usize,
    /// Window age tolerance as a multiple of the timeframe length
    pub staleness_factor: f64,
    pub max_hold_hours: f64,
    /// Close a position once its floating loss reaches this % of equity
    pub position_loss_cutoff_pct: f64,
    /// Consecutive failed broker refreshes before the signal flow pauses
    pub max_connectivity_failures: u32,
    pub max_active_orders: usize,
    pub max_daily_trades: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1_000,
            broker_timeout_ms: 5_000,
            candle_history: 200,
            staleness_factor: 3.0,
            max_hold_hours: 24.0,
            position_loss_cutoff_pct: 2.0,
            max_connectivity_failures: 5,
            max_active_orders: 10,
            max_daily_trades: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk budget per trade, % of equity
    pub max_risk_per_trade: f64,
    /// Daily risk budget, % of equity
    pub max_daily_risk: f64,
    /// Total open notional as a multiple of equity
    pub max_total_exposure: f64,
    /// Drawdown that flips the day to DAILY_LIMIT_REACHED, %
    pub max_drawdown: f64,
    /// Drawdown that triggers the terminal emergency stop, %
    pub emergency_stop_drawdown: f64,
    /// Daily loss limit, % of day-start equity
    pub daily_loss_limit_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_positions_per_symbol: usize,
    /// Absolute correlation above which an open position blocks admission
    pub correlation_threshold: f64,
    /// Stop-loss budget, % of equity
    pub default_sl_pct: f64,
    /// Take-profit target, % of equity
    pub default_tp_pct: f64,
    /// Fallback stop distance when a signal carries no stop hint
    pub default_stop_pips: f64,
    pub trailing_stop_enabled: bool,
    pub trailing_distance_pips: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade: 1.0,
            max_daily_risk: 5.0,
            max_total_exposure: 5.0,
            max_drawdown: 10.0,
            emergency_stop_drawdown: 15.0,
            daily_loss_limit_pct: 5.0,
            max_consecutive_losses: 5,
            max_positions_per_symbol: 3,
            correlation_threshold: 0.7,
            default_sl_pct: 1.0,
            default_tp_pct: 2.0,
            default_stop_pips: 20.0,
            trailing_stop_enabled: true,
            trailing_distance_pips: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub method: SizingMethod,
    pub min_lot: f64,
    /// Global ceiling applied on top of each symbol's own volume_max
    pub max_lot: f64,
    pub kelly_fraction: f64,
    pub kelly_floor: f64,
    pub fixed_lot: f64,
    /// Fixed lot for volatile asset classes (metals, crypto CFDs)
    pub fixed_lot_volatile: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::RiskBased,
            min_lot: 0.01,
            max_lot: 10.0,
            kelly_fraction: 0.25,
            kelly_floor: 0.01,
            fixed_lot: 0.10,
            fixed_lot_volatile: 0.01,
        }
    }
}

/// Fixed category weights for signal aggregation. Must sum to 1.0; the
/// aggregator renormalizes over the categories actually present.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    pub technical: f64,
    pub pattern: f64,
    pub sentiment: f64,
    pub ml: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            technical: 0.4,
            pattern: 0.3,
            sentiment: 0.2,
            ml: 0.1,
        }
    }
}

impl SignalWeights {
    pub fn sum(&self) -> f64 {
        self.technical + self.pattern + self.sentiment + self.ml
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub enabled: bool,
    /// Share of the per-trade risk budget this strategy may spend
    pub weight: f64,
    pub max_positions: usize,
    pub min_signal_strength: f64,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    /// Strategy-specific hold limit; falls back to engine.max_hold_hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hold_hours: Option<f64>,
}

/// Pairwise correlation estimate, treated as configuration data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub a: String,
    pub b: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub bridge_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:6542".to_string(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub signal_weights: SignalWeights,
    pub strategies: BTreeMap<String, StrategyConfig>,
    pub correlations: Vec<CorrelationPair>,
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut strategies = BTreeMap::new();
        strategies.insert(
            "swing".to_string(),
            StrategyConfig {
                enabled: true,
                weight: 0.6,
                max_positions: 2,
                min_signal_strength: 0.5,
                symbols: vec!["EURUSD".to_string(), "USDJPY".to_string()],
                timeframes: vec![Timeframe::M15, Timeframe::H1],
                max_hold_hours: Some(72.0),
            },
        );
        strategies.insert(
            "scalping".to_string(),
            StrategyConfig {
                enabled: true,
                weight: 0.4,
                max_positions: 2,
                min_signal_strength: 0.6,
                symbols: vec!["EURUSD".to_string(), "GBPUSD".to_string()],
                timeframes: vec![Timeframe::M1, Timeframe::M5],
                max_hold_hours: Some(4.0),
            },
        );

        Self {
            engine: EngineConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            signal_weights: SignalWeights::default(),
            strategies,
            correlations: vec![
                CorrelationPair {
                    a: "EURUSD".to_string(),
                    b: "GBPUSD".to_string(),
                    coefficient: 0.85,
                },
                CorrelationPair {
                    a: "EURUSD".to_string(),
                    b: "USDCHF".to_string(),
                    coefficient: -0.9,
                },
                CorrelationPair {
                    a: "AUDUSD".to_string(),
                    b: "NZDUSD".to_string(),
                    coefficient: 0.87,
                },
                CorrelationPair {
                    a: "XAUUSD".to_string(),
                    b: "XAGUSD".to_string(),
                    coefficient: 0.8,
                },
            ],
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Reload the file if its mtime advanced past `last_seen`. Returns the
    /// fresh config on change, None when unchanged. Called between cycles
    /// only.
    pub fn reload_if_changed<P: AsRef<Path>>(
        path: P,
        last_seen: &mut Option<SystemTime>,
    ) -> Result<Option<Self>, ConfigError> {
        let meta = match fs::metadata(path.as_ref()) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        let modified = meta
            .modified()
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        if last_seen.map_or(true, |seen| modified > seen) {
            let was_known = last_seen.is_some();
            *last_seen = Some(modified);
            if was_known {
                return Self::from_file(path).map(Some);
            }
        }
        Ok(None)
    }

    /// Apply a single validated update to a known field, addressed as
    /// "section.field". Unknown fields are rejected.
    pub fn apply_update(&mut self, field: &str, value: toml::Value) -> Result<(), ConfigError> {
        fn as_f64(value: &toml::Value, field: &str) -> Result<f64, ConfigError> {
            value
                .as_float()
                .or_else(|| value.as_integer().map(|i| i as f64))
                .ok_or_else(|| {
                    ConfigError::InvalidValue(format!("{} expects a number", field))
                })
        }
        fn as_bool(value: &toml::Value, field: &str) -> Result<bool, ConfigError> {
            value
                .as_bool()
                .ok_or_else(|| ConfigError::InvalidValue(format!("{} expects a bool", field)))
        }

        match field {
            "risk.max_risk_per_trade" => self.risk.max_risk_per_trade = as_f64(&value, field)?,
            "risk.max_daily_risk" => self.risk.max_daily_risk = as_f64(&value, field)?,
            "risk.max_total_exposure" => self.risk.max_total_exposure = as_f64(&value, field)?,
            "risk.max_drawdown" => self.risk.max_drawdown = as_f64(&value, field)?,
            "risk.emergency_stop_drawdown" => {
                self.risk.emergency_stop_drawdown = as_f64(&value, field)?
            }
            "risk.daily_loss_limit_pct" => self.risk.daily_loss_limit_pct = as_f64(&value, field)?,
            "risk.correlation_threshold" => {
                self.risk.correlation_threshold = as_f64(&value, field)?
            }
            "risk.trailing_stop_enabled" => {
                self.risk.trailing_stop_enabled = as_bool(&value, field)?
            }
            "risk.trailing_distance_pips" => {
                self.risk.trailing_distance_pips = as_f64(&value, field)?
            }
            "sizing.kelly_fraction" => self.sizing.kelly_fraction = as_f64(&value, field)?,
            "sizing.max_lot" => self.sizing.max_lot = as_f64(&value, field)?,
            "engine.cycle_interval_ms" => {
                self.engine.cycle_interval_ms = as_f64(&value, field)? as u64
            }
            "engine.max_hold_hours" => self.engine.max_hold_hours = as_f64(&value, field)?,
            other => return Err(ConfigError::UnknownField(other.to_string())),
        }

        self.validate()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.cycle_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "cycle_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.engine.broker_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "broker_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.risk.max_risk_per_trade <= 0.0 || self.risk.max_risk_per_trade > 100.0 {
            return Err(ConfigError::Validation(
                "max_risk_per_trade must be in (0, 100]".to_string(),
            ));
        }
        if self.risk.max_daily_risk < self.risk.max_risk_per_trade {
            return Err(ConfigError::Validation(
                "max_daily_risk must be at least max_risk_per_trade".to_string(),
            ));
        }
        if self.risk.max_total_exposure <= 0.0 {
            return Err(ConfigError::Validation(
                "max_total_exposure must be positive".to_string(),
            ));
        }
        if self.risk.emergency_stop_drawdown <= self.risk.max_drawdown {
            return Err(ConfigError::Validation(
                "emergency_stop_drawdown must exceed max_drawdown".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.correlation_threshold) {
            return Err(ConfigError::Validation(
                "correlation_threshold must be in [0, 1]".to_string(),
            ));
        }
        if (self.signal_weights.sum() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Validation(format!(
                "signal weights must sum to 1.0, got {:.4}",
                self.signal_weights.sum()
            )));
        }
        if self.sizing.min_lot <= 0.0 || self.sizing.max_lot < self.sizing.min_lot {
            return Err(ConfigError::Validation(
                "lot bounds must satisfy 0 < min_lot <= max_lot".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sizing.kelly_fraction) {
            return Err(ConfigError::Validation(
                "kelly_fraction must be in [0, 1]".to_string(),
            ));
        }
        for (name, strategy) in &self.strategies {
            if strategy.weight < 0.0 || strategy.weight > 1.0 {
                return Err(ConfigError::Validation(format!(
                    "strategy '{}' weight must be in [0, 1]",
                    name
                )));
            }
            if strategy.enabled && strategy.symbols.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "enabled strategy '{}' has no symbols",
                    name
                )));
            }
            if strategy.enabled && strategy.timeframes.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "enabled strategy '{}' has no timeframes",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&strategy.min_signal_strength) {
                return Err(ConfigError::Validation(format!(
                    "strategy '{}' min_signal_strength must be in [0, 1]",
                    name
                )));
            }
        }
        for pair in &self.correlations {
            if !(-1.0..=1.0).contains(&pair.coefficient) {
                return Err(ConfigError::Validation(format!(
                    "correlation {}/{} must be in [-1, 1]",
                    pair.a, pair.b
                )));
            }
        }

        Ok(())
    }

    /// Enabled strategies, in deterministic order
    pub fn enabled_strategies(&self) -> impl Iterator<Item = (&String, &StrategyConfig)> {
        self.strategies.iter().filter(|(_, s)| s.enabled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Unknown configuration field: {0}")]
    UnknownField(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
