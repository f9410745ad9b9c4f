// Broker boundary: the narrow interface the trading core consumes.
//
// Everything behind this trait is an opaque remote service. All calls are
// fallible and return tagged results; nothing here panics across the
// boundary.

pub mod rest;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TradingResult;

pub use rest::RestBridgeBroker;
pub use sim::SimBroker;

/// Chart timeframes supported by the data feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn minutes(&self) -> u32 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade direction. Serialized as "long"/"short" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn sign(&self) -> f64 {
        match self {
            TradeDirection::Long => 1.0,
            TradeDirection::Short => -1.0,
        }
    }

    /// Map a continuous aggregated direction onto a side, if decisive.
    pub fn from_sign(value: f64) -> Option<Self> {
        if value > 0.0 {
            Some(TradeDirection::Long)
        } else if value < 0.0 {
            Some(TradeDirection::Short)
        } else {
            None
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeDirection::Long => f.write_str("LONG"),
            TradeDirection::Short => f.write_str("SHORT"),
        }
    }
}

/// Account state as reported by the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
}

/// Per-symbol trading constraints and precision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub point: f64,
    pub digits: u32,
    pub contract_size: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    pub tick_value: f64,
}

impl SymbolSpec {
    /// Pip size: 10 points on 5/3-digit symbols, one point otherwise
    pub fn pip_size(&self) -> f64 {
        if self.digits == 5 || self.digits == 3 {
            self.point * 10.0
        } else {
            self.point
        }
    }

    /// Monetary value of one pip for one standard lot
    pub fn pip_value_per_lot(&self) -> f64 {
        self.contract_size * self.pip_size()
    }

    /// Round a price to the symbol's quote precision
    pub fn round_price(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.digits as i32);
        (price * factor).round() / factor
    }
}

/// Latest quote for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Entry price for a market order on the given side
    pub fn entry_price(&self, direction: TradeDirection) -> f64 {
        match direction {
            TradeDirection::Long => self.ask,
            TradeDirection::Short => self.bid,
        }
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// A broker-owned open position, mirrored locally. The mirror is a cache of
/// broker truth; broker state always wins on conflict and the copy is
/// refreshed every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub open_time: DateTime<Utc>,
    pub strategy_tag: String,
    pub unrealized_pnl: f64,
}

impl BrokerPosition {
    /// Position notional in account currency terms
    pub fn notional(&self, contract_size: f64) -> f64 {
        self.volume * contract_size * self.entry_price
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.open_time).num_seconds() as f64 / 3600.0
    }
}

/// Ephemeral order request. Built from an admitted, sized decision and
/// discarded after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub strategy_tag: String,
    pub signal_strength: f64,
}

/// Successful fill reported by the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderFill {
    pub ticket: u64,
    pub executed_price: f64,
    pub executed_volume: f64,
}

/// The brokerage terminal, seen through a narrow async interface.
///
/// Implementations must not panic across this boundary; every failure mode
/// maps onto a `TradingError` variant.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn account_info(&self) -> TradingResult<AccountSnapshot>;

    async fn symbol_spec(&self, symbol: &str) -> TradingResult<SymbolSpec>;

    async fn positions(&self) -> TradingResult<Vec<BrokerPosition>>;

    async fn rates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> TradingResult<Vec<Candle>>;

    async fn tick(&self, symbol: &str) -> TradingResult<Tick>;

    async fn send_order(&self, request: &OrderRequest) -> TradingResult<OrderFill>;

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradingResult<()>;

    async fn close_position(&self, ticket: u64) -> TradingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd_spec() -> SymbolSpec {
        SymbolSpec {
            symbol: "EURUSD".to_string(),
            point: 0.00001,
            digits: 5,
            contract_size: 100_000.0,
            volume_min: 0.01,
            volume_max: 100.0,
            volume_step: 0.01,
            tick_value: 1.0,
        }
    }

    #[test]
    fn test_pip_size_five_digit() {
        let spec = eurusd_spec();
        assert!((spec.pip_size() - 0.0001).abs() < 1e-12);
        assert!((spec.pip_value_per_lot() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pip_size_four_digit() {
        let spec = SymbolSpec {
            digits: 4,
            point: 0.0001,
            ..eurusd_spec()
        };
        assert!((spec.pip_size() - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_round_price() {
        let spec = eurusd_spec();
        assert_eq!(spec.round_price(1.1000049), 1.10000);
        assert_eq!(spec.round_price(1.1000051), 1.10001);
    }

    #[test]
    fn test_direction_from_sign() {
        assert_eq!(TradeDirection::from_sign(0.42), Some(TradeDirection::Long));
        assert_eq!(TradeDirection::from_sign(-0.1), Some(TradeDirection::Short));
        assert_eq!(TradeDirection::from_sign(0.0), None);
    }

    #[test]
    fn test_tick_entry_price() {
        let tick = Tick {
            bid: 1.1000,
            ask: 1.1002,
            time: Utc::now(),
        };
        assert_eq!(tick.entry_price(TradeDirection::Long), 1.1002);
        assert_eq!(tick.entry_price(TradeDirection::Short), 1.1000);
    }
}
