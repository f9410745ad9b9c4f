// Multi-strategy FX trading bot
//
// Signal aggregation and risk-gated order execution over a narrow broker
// boundary. The engine combines per-category strategy signals, sizes
// positions under interacting risk limits, and serializes every admission
// decision against shared account state.

pub mod broker;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;      // Unified error handling
pub mod notify;     // Notification boundary (events out)
pub mod orders;
pub mod risk;
pub mod signals;
pub mod validation; // Pre-flight validation

// Re-export core types
pub use engine::{CycleReport, TradingEngine};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export broker boundary
pub use broker::{
    AccountSnapshot, Broker, BrokerPosition, Candle, OrderFill, OrderRequest, RestBridgeBroker,
    SimBroker, SymbolSpec, Tick, Timeframe, TradeDirection,
};

// Re-export configuration
pub use config::{Config, ConfigError, RiskConfig, SizingConfig, SizingMethod, StrategyConfig};

// Re-export signal pipeline
pub use signals::{
    AggregatedDecision, Signal, SignalAggregator, SignalCategory, SignalProvider,
};

// Re-export risk components
pub use risk::{
    CorrelationTable, PositionSizer, RiskDenial, RiskEvent, RiskManager, RiskReservation,
    SizeInputs, TradingState,
};

// Re-export order coordination
pub use orders::{CloseFilter, CoordinatorLimits, OrderCoordinator, OrderInfo, PlaceOutcome};

// Re-export notification boundary
pub use notify::{ChannelNotifier, LogNotifier, Notifier, TradeEvent};

// Re-export validation types
pub use validation::{PreFlightValidator, ValidationCheck, ValidationLevel, ValidationResult};
