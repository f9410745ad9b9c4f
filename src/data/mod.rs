// Market data cache
//
// Per-symbol, per-timeframe rolling candle windows plus the latest tick.
// One refresh task writes; provider tasks read consistent snapshots. Windows
// are stored as Arc slices so a snapshot is a cheap clone and a reader can
// never observe a partially applied update.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::broker::{Broker, Candle, Tick, Timeframe};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone)]
struct Window {
    candles: Arc<Vec<Candle>>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SymbolData {
    windows: HashMap<Timeframe, Window>,
    tick: Option<Tick>,
}

/// Consistent read-only view of one symbol's cached data
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub windows: HashMap<Timeframe, Arc<Vec<Candle>>>,
    pub tick: Option<Tick>,
}

impl SymbolSnapshot {
    pub fn window(&self, timeframe: Timeframe) -> Option<&[Candle]> {
        self.windows.get(&timeframe).map(|w| w.as_slice())
    }

    /// Any window with at least `min_len` candles, preferring shorter
    /// timeframes.
    pub fn any_window(&self, min_len: usize) -> Option<&[Candle]> {
        let mut frames: Vec<&Timeframe> = self.windows.keys().collect();
        frames.sort_by_key(|tf| tf.minutes());
        frames
            .into_iter()
            .filter_map(|tf| self.windows.get(tf))
            .map(|w| w.as_slice())
            .find(|w| w.len() >= min_len)
    }
}

pub struct MarketDataCache {
    staleness_factor: f64,
    inner: RwLock<HashMap<String, SymbolData>>,
}

impl MarketDataCache {
    pub fn new(staleness_factor: f64) -> Self {
        Self {
            staleness_factor,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Refresh one symbol's windows and tick from the broker. Fetches happen
    /// outside the lock; the write lock is held only to swap the results in.
    pub async fn refresh_symbol(
        &self,
        broker: &dyn Broker,
        symbol: &str,
        timeframes: &[Timeframe],
        count: usize,
    ) -> TradingResult<()> {
        let now = Utc::now();
        let mut fetched: Vec<(Timeframe, Vec<Candle>)> = Vec::with_capacity(timeframes.len());

        for &tf in timeframes {
            match broker.rates(symbol, tf, count).await {
                Ok(candles) if !candles.is_empty() => fetched.push((tf, candles)),
                Ok(_) => {
                    debug!("no {} candles returned for {}", tf, symbol);
                }
                Err(e) => {
                    warn!("candle fetch failed for {} {}: {}", symbol, tf, e);
                }
            }
        }

        let tick = match broker.tick(symbol).await {
            Ok(tick) => Some(tick),
            Err(e) => {
                warn!("tick fetch failed for {}: {}", symbol, e);
                None
            }
        };

        if fetched.is_empty() && tick.is_none() {
            return Err(TradingError::data_unavailable(
                symbol,
                "no candles or tick from broker",
            ));
        }

        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = guard.entry(symbol.to_string()).or_default();
        for (tf, candles) in fetched {
            entry.windows.insert(
                tf,
                Window {
                    candles: Arc::new(candles),
                    fetched_at: now,
                },
            );
        }
        if tick.is_some() {
            entry.tick = tick;
        }

        Ok(())
    }

    /// Snapshot a symbol's fresh windows. Stale windows (older than
    /// staleness_factor × timeframe) are omitted; a symbol with nothing
    /// fresh yields None.
    pub fn snapshot(&self, symbol: &str, now: DateTime<Utc>) -> Option<SymbolSnapshot> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let data = guard.get(symbol)?;

        let mut windows = HashMap::new();
        for (&tf, window) in &data.windows {
            let max_age = Duration::seconds((tf.minutes() as f64 * 60.0 * self.staleness_factor) as i64);
            if now - window.fetched_at <= max_age {
                windows.insert(tf, Arc::clone(&window.candles));
            } else {
                debug!("dropping stale {} window for {}", tf, symbol);
            }
        }

        if windows.is_empty() && data.tick.is_none() {
            return None;
        }

        Some(SymbolSnapshot {
            symbol: symbol.to_string(),
            windows,
            tick: data.tick,
        })
    }

    /// Drop everything cached for a symbol
    pub fn invalidate(&self, symbol: &str) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(symbol);
    }

    pub fn cached_symbols(&self) -> Vec<String> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;

    fn make_candles(count: usize, start_price: f64, step: f64) -> Vec<Candle> {
        let base = Utc::now();
        (0..count)
            .map(|i| {
                let open = start_price + step * i as f64;
                let close = open + step;
                Candle {
                    time: base - Duration::minutes((count - i) as i64),
                    open,
                    high: open.max(close) + step.abs(),
                    low: open.min(close) - step.abs(),
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_refresh_and_snapshot() {
        let broker = SimBroker::builder()
            .with_default_spec("EURUSD")
            .with_candles("EURUSD", Timeframe::M5, make_candles(50, 1.10, 0.0001))
            .with_tick("EURUSD", 1.1049, 1.1051)
            .build();

        let cache = MarketDataCache::new(3.0);
        cache
            .refresh_symbol(&broker, "EURUSD", &[Timeframe::M5], 50)
            .await
            .unwrap();

        let snapshot = cache.snapshot("EURUSD", Utc::now()).unwrap();
        assert_eq!(snapshot.window(Timeframe::M5).unwrap().len(), 50);
        assert!(snapshot.tick.is_some());
    }

    #[tokio::test]
    async fn test_stale_window_dropped() {
        let broker = SimBroker::builder()
            .with_default_spec("EURUSD")
            .with_candles("EURUSD", Timeframe::M1, make_candles(30, 1.10, 0.0001))
            .with_tick("EURUSD", 1.1049, 1.1051)
            .build();

        let cache = MarketDataCache::new(3.0);
        cache
            .refresh_symbol(&broker, "EURUSD", &[Timeframe::M1], 30)
            .await
            .unwrap();

        // An M1 window fetched now is stale when read "one hour later"
        let later = Utc::now() + Duration::hours(1);
        let snapshot = cache.snapshot("EURUSD", later).unwrap();
        assert!(snapshot.window(Timeframe::M1).is_none());
        // The tick survives; staleness applies per-window
        assert!(snapshot.tick.is_some());
    }

    #[tokio::test]
    async fn test_unknown_symbol_snapshot_is_none() {
        let cache = MarketDataCache::new(3.0);
        assert!(cache.snapshot("GBPUSD", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_any_data_fails() {
        let broker = SimBroker::builder().build();
        let cache = MarketDataCache::new(3.0);
        let err = cache
            .refresh_symbol(&broker, "EURUSD", &[Timeframe::M5], 50)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "data");
    }
}
