// ML prediction signal provider
//
// Model training and persistence are not part of the trading core. A model
// is an external service behind the Predictor trait; this provider extracts
// features from the data window, forwards them, and normalizes the answer.
// Without a wired predictor the category simply has no opinion.

use std::sync::Arc;

use crate::data::SymbolSnapshot;
use crate::error::TradingResult;

use super::technical::{atr, rsi, sma};
use super::{Signal, SignalCategory, SignalProvider};

const MIN_CANDLES: usize = 30;

/// Feature vector handed to a predictor
#[derive(Debug, Clone)]
pub struct Features {
    /// Last bar-over-bar returns, oldest first
    pub returns: Vec<f64>,
    pub rsi: f64,
    /// Close relative to its 20-bar mean, as a fraction
    pub mean_distance: f64,
    /// ATR relative to price
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    /// Directional estimate in [-1, 1]
    pub direction: f64,
    /// Model confidence in [0, 1]
    pub confidence: f64,
}

/// External prediction service boundary
pub trait Predictor: Send + Sync {
    fn predict(&self, features: &Features) -> TradingResult<Prediction>;
}

pub fn extract_features(candles: &[crate::broker::Candle]) -> Option<Features> {
    if candles.len() < MIN_CANDLES {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let last = *closes.last()?;
    if last <= 0.0 {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .rev()
        .take(10)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let mean = sma(&closes, 20);

    Some(Features {
        returns,
        rsi: rsi(&closes, 14),
        mean_distance: (last - mean) / mean,
        volatility: atr(candles, 14) / last,
    })
}

pub struct MlSignalProvider {
    predictor: Option<Arc<dyn Predictor>>,
}

impl MlSignalProvider {
    pub fn new(predictor: Option<Arc<dyn Predictor>>) -> Self {
        Self { predictor }
    }

    pub fn disabled() -> Self {
        Self { predictor: None }
    }
}

impl SignalProvider for MlSignalProvider {
    fn category(&self) -> SignalCategory {
        SignalCategory::Ml
    }

    fn evaluate(&self, symbol: &str, snapshot: &SymbolSnapshot) -> TradingResult<Option<Signal>> {
        let Some(predictor) = &self.predictor else {
            return Ok(None);
        };
        let Some(candles) = snapshot.any_window(MIN_CANDLES) else {
            return Ok(None);
        };
        let Some(features) = extract_features(candles) else {
            return Ok(None);
        };

        let prediction = predictor.predict(&features)?;
        let direction = prediction.direction.clamp(-1.0, 1.0);
        if direction == 0.0 {
            return Ok(None);
        }

        Ok(Some(Signal::new(
            symbol,
            SignalCategory::Ml,
            direction,
            prediction.confidence.clamp(0.0, 1.0),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Candle, Timeframe};
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    struct AlwaysLong;

    impl Predictor for AlwaysLong {
        fn predict(&self, _features: &Features) -> TradingResult<Prediction> {
            Ok(Prediction {
                direction: 0.9,
                confidence: 0.6,
            })
        }
    }

    fn snapshot(len: usize) -> SymbolSnapshot {
        let base = Utc::now();
        let candles: Vec<Candle> = (0..len)
            .map(|i| {
                let close = 1.10 + i as f64 * 0.0003;
                Candle {
                    time: base - Duration::minutes((len - i) as i64),
                    open: close - 0.0003,
                    high: close + 0.0004,
                    low: close - 0.0006,
                    close,
                    volume: 100.0,
                }
            })
            .collect();
        let mut windows = HashMap::new();
        windows.insert(Timeframe::M15, Arc::new(candles));
        SymbolSnapshot {
            symbol: "EURUSD".to_string(),
            windows,
            tick: None,
        }
    }

    #[test]
    fn test_disabled_provider_is_silent() {
        let provider = MlSignalProvider::disabled();
        assert!(provider.evaluate("EURUSD", &snapshot(60)).unwrap().is_none());
    }

    #[test]
    fn test_predictor_output_is_normalized() {
        let provider = MlSignalProvider::new(Some(Arc::new(AlwaysLong)));
        let signal = provider
            .evaluate("EURUSD", &snapshot(60))
            .unwrap()
            .expect("predictor wired, signal expected");
        assert_eq!(signal.category, SignalCategory::Ml);
        assert!((signal.direction - 0.9).abs() < 1e-9);
        assert!((signal.strength - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_feature_extraction_needs_history() {
        let short = snapshot(10);
        let candles = short.window(Timeframe::M15).unwrap();
        assert!(extract_features(candles).is_none());
    }

    #[test]
    fn test_feature_shape() {
        let snap = snapshot(60);
        let features = extract_features(snap.window(Timeframe::M15).unwrap()).unwrap();
        assert_eq!(features.returns.len(), 10);
        assert!(features.volatility > 0.0);
        assert!(features.rsi > 50.0); // rising series
    }
}
