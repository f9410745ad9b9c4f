// Sentiment signal provider
//
// No external news feed: sentiment is proxied from market behavior — short
// horizon momentum scaled by how liquid the current trading session is.
// London/New York overlap carries the most weight, the Asian lull the least.

use chrono::Timelike;

use crate::data::SymbolSnapshot;
use crate::error::TradingResult;

use super::{Signal, SignalCategory, SignalProvider};

const MIN_CANDLES: usize = 12;
const MOMENTUM_BARS: usize = 10;
/// Momentum saturates at this absolute return
const FULL_SCALE_RETURN: f64 = 0.004;

/// Session liquidity weight for an hour of day (UTC)
fn session_weight(hour: u32) -> f64 {
    match hour {
        12..=16 => 1.0, // London/NY overlap
        7..=11 => 0.8,  // London
        17..=20 => 0.7, // New York afternoon
        0..=6 => 0.4,   // Asia
        _ => 0.5,
    }
}

pub struct SentimentSignalProvider;

impl SentimentSignalProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SentimentSignalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalProvider for SentimentSignalProvider {
    fn category(&self) -> SignalCategory {
        SignalCategory::Sentiment
    }

    fn evaluate(&self, symbol: &str, snapshot: &SymbolSnapshot) -> TradingResult<Option<Signal>> {
        let Some(candles) = snapshot.any_window(MIN_CANDLES) else {
            return Ok(None);
        };

        let last = &candles[candles.len() - 1];
        let past = &candles[candles.len() - 1 - MOMENTUM_BARS];
        if past.close <= 0.0 {
            return Ok(None);
        }

        let momentum = (last.close - past.close) / past.close;
        let direction = (momentum / FULL_SCALE_RETURN).clamp(-1.0, 1.0);
        if direction.abs() < 0.05 {
            return Ok(None);
        }

        let weight = session_weight(last.time.hour());
        let strength = (direction.abs() * weight).clamp(0.0, 1.0);

        Ok(Some(Signal::new(
            symbol,
            SignalCategory::Sentiment,
            direction,
            strength,
        )?))
    }
}
