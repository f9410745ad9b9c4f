// Signal aggregation
//
// Combines per-category signals into one decision using fixed category
// weights. Absent categories drop out of the denominator: "no opinion" is
// not "sell". Aggregation is pure and commutative, so a shuffled signal set
// yields an identical decision.

use std::collections::HashMap;

use crate::config::SignalWeights;
use crate::error::{TradingError, TradingResult};

use super::{Signal, SignalCategory};

/// Decision derived from one cycle's signals for one symbol. Created fresh
/// every cycle and discarded unless a trade results from it.
#[derive(Debug, Clone)]
pub struct AggregatedDecision {
    pub symbol: String,
    pub direction: f64,
    pub strength: f64,
    /// The signals that produced this decision, kept for audit logging
    pub contributing: Vec<Signal>,
}

impl AggregatedDecision {
    pub fn neutral(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction: 0.0,
            strength: 0.0,
            contributing: Vec::new(),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.direction == 0.0 || self.strength == 0.0
    }

    /// Best available stop hint among contributors agreeing with the
    /// decision direction.
    pub fn stop_hint(&self) -> Option<f64> {
        self.contributing
            .iter()
            .filter(|s| s.direction * self.direction > 0.0)
            .filter_map(|s| s.stop_hint.map(|stop| (s.strength, stop)))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, stop)| stop)
    }
}

pub struct SignalAggregator {
    weights: SignalWeights,
}

impl SignalAggregator {
    pub fn new(weights: SignalWeights) -> TradingResult<Self> {
        if (weights.sum() - 1.0).abs() > 1e-6 {
            return Err(TradingError::ConfigValidation(format!(
                "signal weights must sum to 1.0, got {:.4}",
                weights.sum()
            )));
        }
        Ok(Self { weights })
    }

    fn weight_for(&self, category: SignalCategory) -> f64 {
        match category {
            SignalCategory::Technical => self.weights.technical,
            SignalCategory::Pattern => self.weights.pattern,
            SignalCategory::Sentiment => self.weights.sentiment,
            SignalCategory::Ml => self.weights.ml,
        }
    }

    /// Combine signals for one symbol into a single decision.
    ///
    /// Each category contributes the mean of its signals; category means are
    /// weighted and normalized over the weights of the categories actually
    /// present. An empty set yields a neutral decision.
    pub fn aggregate(&self, symbol: &str, signals: &[Signal]) -> AggregatedDecision {
        let relevant: Vec<&Signal> = signals.iter().filter(|s| s.symbol == symbol).collect();
        if relevant.is_empty() {
            return AggregatedDecision::neutral(symbol);
        }

        // Per-category means. HashMap iteration order is irrelevant: the
        // weighted sum below is commutative.
        let mut sums: HashMap<SignalCategory, (f64, f64, usize)> = HashMap::new();
        for signal in &relevant {
            let entry = sums.entry(signal.category).or_insert((0.0, 0.0, 0));
            entry.0 += signal.direction;
            entry.1 += signal.strength;
            entry.2 += 1;
        }

        let mut weighted_direction = 0.0;
        let mut weighted_strength = 0.0;
        let mut total_weight = 0.0;

        for (category, (dir_sum, str_sum, count)) in &sums {
            let weight = self.weight_for(*category);
            if weight <= 0.0 {
                continue;
            }
            let mean_direction = dir_sum / *count as f64;
            let mean_strength = str_sum / *count as f64;

            weighted_direction += mean_direction * weight;
            weighted_strength += mean_strength * weight;
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            return AggregatedDecision::neutral(symbol);
        }

        AggregatedDecision {
            symbol: symbol.to_string(),
            direction: (weighted_direction / total_weight).clamp(-1.0, 1.0),
            strength: (weighted_strength / total_weight).clamp(0.0, 1.0),
            contributing: relevant.into_iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(category: SignalCategory, direction: f64, strength: f64) -> Signal {
        Signal::new("EURUSD", category, direction, strength).unwrap()
    }

    fn aggregator() -> SignalAggregator {
        SignalAggregator::new(SignalWeights::default()).unwrap()
    }

    #[test]
    fn test_empty_set_is_neutral() {
        let decision = aggregator().aggregate("EURUSD", &[]);
        assert!(decision.is_neutral());
        assert_eq!(decision.direction, 0.0);
        assert_eq!(decision.strength, 0.0);
    }

    #[test]
    fn test_weights_renormalize_over_present_categories() {
        // Only technical present at full conviction: the decision must be
        // 1.0, not 0.4.
        let signals = vec![make(SignalCategory::Technical, 1.0, 1.0)];
        let decision = aggregator().aggregate("EURUSD", &signals);
        assert!((decision.direction - 1.0).abs() < 1e-9);
        assert!((decision.strength - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_order_independence() {
        let mut signals = vec![
            make(SignalCategory::Technical, 0.8, 0.9),
            make(SignalCategory::Pattern, -0.4, 0.5),
            make(SignalCategory::Sentiment, 0.2, 0.3),
            make(SignalCategory::Ml, -1.0, 0.6),
            make(SignalCategory::Technical, 0.2, 0.4),
        ];
        let forward = aggregator().aggregate("EURUSD", &signals);
        signals.reverse();
        let reversed = aggregator().aggregate("EURUSD", &signals);
        signals.swap(0, 2);
        signals.swap(1, 3);
        let shuffled = aggregator().aggregate("EURUSD", &signals);

        assert!((forward.direction - reversed.direction).abs() < 1e-12);
        assert!((forward.strength - reversed.strength).abs() < 1e-12);
        assert!((forward.direction - shuffled.direction).abs() < 1e-12);
        assert!((forward.strength - shuffled.strength).abs() < 1e-12);
    }

    #[test]
    fn test_category_mean_before_weighting() {
        // Two technical signals averaging to zero cancel out entirely
        let signals = vec![
            make(SignalCategory::Technical, 1.0, 0.8),
            make(SignalCategory::Technical, -1.0, 0.8),
            make(SignalCategory::Pattern, 1.0, 0.5),
        ];
        let decision = aggregator().aggregate("EURUSD", &signals);
        // technical mean = 0, pattern mean = 1; weights 0.4/0.3 renormalized
        let expected = (0.0 * 0.4 + 1.0 * 0.3) / 0.7;
        assert!((decision.direction - expected).abs() < 1e-9);
    }

    #[test]
    fn test_two_category_weighting() {
        let signals = vec![
            make(SignalCategory::Technical, 1.0, 1.0),
            make(SignalCategory::Pattern, -1.0, 1.0),
        ];
        let decision = aggregator().aggregate("EURUSD", &signals);
        // (0.4 - 0.3) / 0.7
        let expected = (0.4 - 0.3) / 0.7;
        assert!((decision.direction - expected).abs() < 1e-9);
        assert!((decision.strength - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_other_symbols_ignored() {
        let mut signals = vec![make(SignalCategory::Technical, 1.0, 1.0)];
        signals.push(Signal::new("GBPUSD", SignalCategory::Pattern, -1.0, 1.0).unwrap());
        let decision = aggregator().aggregate("EURUSD", &signals);
        assert!((decision.direction - 1.0).abs() < 1e-9);
        assert_eq!(decision.contributing.len(), 1);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = SignalWeights {
            technical: 0.5,
            pattern: 0.5,
            sentiment: 0.5,
            ml: 0.5,
        };
        assert!(SignalAggregator::new(weights).is_err());
    }

    #[test]
    fn test_stop_hint_prefers_strongest_agreeing_signal() {
        let strong = make(SignalCategory::Technical, 1.0, 0.9).with_stop_hint(1.0940);
        let weak = make(SignalCategory::Pattern, 1.0, 0.4).with_stop_hint(1.0970);
        let opposing = make(SignalCategory::Sentiment, -1.0, 1.0).with_stop_hint(1.1100);

        let decision = aggregator().aggregate("EURUSD", &[strong, weak, opposing]);
        assert!(decision.direction > 0.0);
        assert_eq!(decision.stop_hint(), Some(1.0940));
    }
}
