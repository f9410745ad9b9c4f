// Signal model and provider interface
//
// Every strategy input is normalized into one Signal shape at construction
// time, so the aggregator downstream never needs defensive field probing.

pub mod aggregator;
pub mod ml;
pub mod pattern;
pub mod sentiment;
pub mod technical;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::SymbolSnapshot;
use crate::error::{TradingError, TradingResult};

pub use aggregator::{AggregatedDecision, SignalAggregator};
pub use ml::{Features, MlSignalProvider, Prediction, Predictor};
pub use pattern::PatternSignalProvider;
pub use sentiment::SentimentSignalProvider;
pub use technical::TechnicalSignalProvider;

/// Source category of a signal. Categories carry fixed aggregation weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalCategory {
    Technical,
    Pattern,
    Sentiment,
    Ml,
}

impl SignalCategory {
    pub const ALL: [SignalCategory; 4] = [
        SignalCategory::Technical,
        SignalCategory::Pattern,
        SignalCategory::Sentiment,
        SignalCategory::Ml,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalCategory::Technical => "technical",
            SignalCategory::Pattern => "pattern",
            SignalCategory::Sentiment => "sentiment",
            SignalCategory::Ml => "ml",
        }
    }
}

impl std::fmt::Display for SignalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable strategy signal. Direction is continuous in [-1, 1], strength
/// in [0, 1]; both are validated at construction and never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub category: SignalCategory,
    pub direction: f64,
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
    pub entry_hint: Option<f64>,
    pub stop_hint: Option<f64>,
    pub target_hint: Option<f64>,
}

impl Signal {
    pub fn new(
        symbol: &str,
        category: SignalCategory,
        direction: f64,
        strength: f64,
    ) -> TradingResult<Self> {
        if !(-1.0..=1.0).contains(&direction) || !direction.is_finite() {
            return Err(TradingError::InvalidSignal(format!(
                "direction {} outside [-1, 1] for {} {}",
                direction, symbol, category
            )));
        }
        if !(0.0..=1.0).contains(&strength) || !strength.is_finite() {
            return Err(TradingError::InvalidSignal(format!(
                "strength {} outside [0, 1] for {} {}",
                strength, symbol, category
            )));
        }

        Ok(Self {
            symbol: symbol.to_string(),
            category,
            direction,
            strength,
            timestamp: Utc::now(),
            entry_hint: None,
            stop_hint: None,
            target_hint: None,
        })
    }

    pub fn with_entry_hint(mut self, price: f64) -> Self {
        self.entry_hint = Some(price);
        self
    }

    pub fn with_stop_hint(mut self, price: f64) -> Self {
        self.stop_hint = Some(price);
        self
    }

    pub fn with_target_hint(mut self, price: f64) -> Self {
        self.target_hint = Some(price);
        self
    }
}

/// A pluggable signal source. Evaluation is pure and CPU-bound: it reads a
/// consistent data snapshot and may run in parallel with other providers.
/// Returning Ok(None) means "no opinion" for this symbol this cycle.
pub trait SignalProvider: Send + Sync {
    fn category(&self) -> SignalCategory;

    fn evaluate(&self, symbol: &str, snapshot: &SymbolSnapshot) -> TradingResult<Option<Signal>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_validation() {
        assert!(Signal::new("EURUSD", SignalCategory::Technical, 0.5, 0.7).is_ok());
        assert!(Signal::new("EURUSD", SignalCategory::Technical, 1.5, 0.7).is_err());
        assert!(Signal::new("EURUSD", SignalCategory::Technical, 0.5, -0.1).is_err());
        assert!(Signal::new("EURUSD", SignalCategory::Technical, f64::NAN, 0.5).is_err());
    }

    #[test]
    fn test_signal_hints() {
        let signal = Signal::new("EURUSD", SignalCategory::Pattern, 1.0, 0.8)
            .unwrap()
            .with_stop_hint(1.0950)
            .with_target_hint(1.1100);
        assert_eq!(signal.stop_hint, Some(1.0950));
        assert_eq!(signal.target_hint, Some(1.1100));
        assert!(signal.entry_hint.is_none());
    }
}
