use crate::error::ValidationError;
use crate::models::{Bar, Timeframe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

type Key = (String, Timeframe);

/// What `add_bar` did with a bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Appended,
    /// Same timestamp as the newest stored bar; the stored bar was replaced
    Replaced,
}

/// Thread-safe rolling bar history per (symbol, timeframe)
///
/// Ordering is checked under the write lock, so concurrent producers can
/// never store an older bar behind a newer one.
#[derive(Clone)]
pub struct HistoricalDataManager {
    data: Arc<RwLock<HashMap<Key, VecDeque<Bar>>>>,
    max_bars: usize,
}

impl HistoricalDataManager {
    /// Create a new history store
    ///
    /// # Arguments
    /// * `max_bars` - Maximum number of bars kept per key
    pub fn new(max_bars: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_bars: max_bars.max(1),
        }
    }

    pub fn max_bars(&self) -> usize {
        self.max_bars
    }

    /// Prepare empty storage for a key. Existing history is kept.
    pub fn init_key(&self, symbol: &str, timeframe: Timeframe) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.entry((symbol.to_string(), timeframe)).or_default();
    }

    /// Drop a key and all of its bars
    pub fn remove_key(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(&(symbol.to_string(), timeframe)).is_some()
    }

    pub fn contains_key(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.contains_key(&(symbol.to_string(), timeframe))
    }

    /// Store a bar under its own symbol and timeframe
    ///
    /// A bar older than the newest stored one is rejected. If the history is
    /// full, removes the oldest bar.
    pub fn add_bar(&self, bar: Bar) -> Result<StoreOutcome, ValidationError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let bars = data
            .entry((bar.symbol.clone(), bar.timeframe))
            .or_default();

        if let Some(last) = bars.back_mut() {
            ensure_not_older(&bar.symbol, bar.timeframe, bar.timestamp, last.timestamp)?;
            if last.timestamp == bar.timestamp {
                *last = bar;
                return Ok(StoreOutcome::Replaced);
            }
        }

        bars.push_back(bar);
        while bars.len() > self.max_bars {
            bars.pop_front();
        }
        Ok(StoreOutcome::Appended)
    }

    /// Fold a finer tick into the forming bar of a longer timeframe
    ///
    /// `bucket_close` is the close time of the window containing the tick.
    /// The forming bar is started from the tick if the window is new. A tick
    /// belonging to a window older than the forming one is rejected.
    pub fn fold_into(
        &self,
        timeframe: Timeframe,
        bucket_close: DateTime<Utc>,
        tick: &Bar,
    ) -> Result<StoreOutcome, ValidationError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let bars = data
            .entry((tick.symbol.clone(), timeframe))
            .or_default();

        if let Some(forming) = bars.back_mut() {
            ensure_not_older(&tick.symbol, timeframe, bucket_close, forming.timestamp)?;
            if forming.timestamp == bucket_close {
                forming.merge(tick);
                return Ok(StoreOutcome::Replaced);
            }
        }

        bars.push_back(Bar {
            timeframe,
            timestamp: bucket_close,
            ..tick.clone()
        });
        while bars.len() > self.max_bars {
            bars.pop_front();
        }
        Ok(StoreOutcome::Appended)
    }

    /// All bars for a key, oldest first
    pub fn get_bars(&self, symbol: &str, timeframe: Timeframe) -> Vec<Bar> {
        self.get_recent(symbol, timeframe, usize::MAX)
    }

    /// The `n` most recent bars for a key, oldest first
    pub fn get_recent(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Vec<Bar> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(&(symbol.to_string(), timeframe))
            .map(|deque| {
                let skip = deque.len().saturating_sub(n);
                deque.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(&(symbol.to_string(), timeframe))
            .and_then(|deque| deque.back().cloned())
    }

    pub fn last_timestamp(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(&(symbol.to_string(), timeframe))
            .and_then(|deque| deque.back().map(|b| b.timestamp))
    }

    pub fn bar_count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(&(symbol.to_string(), timeframe))
            .map(|d| d.len())
            .unwrap_or(0)
    }

    /// Bar counts keyed `SYMBOL:timeframe`
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.iter()
            .map(|((symbol, tf), bars)| (format!("{}:{}", symbol, tf), bars.len()))
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        HistoryStats {
            keys: data.len(),
            total_bars: data.values().map(|d| d.len()).sum(),
            max_bars_per_key: self.max_bars,
        }
    }

    pub fn clear_all(&self) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.clear();
    }
}

fn ensure_not_older(
    symbol: &str,
    timeframe: Timeframe,
    timestamp: DateTime<Utc>,
    last: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if timestamp < last {
        return Err(ValidationError::NonMonotonic {
            key: format!("{}/{}", symbol, timeframe),
            timestamp,
            last,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub keys: usize,
    pub total_bars: usize,
    pub max_bars_per_key: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
    }

    fn create_test_bar(symbol: &str, minute: i64, price: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Min1,
            timestamp: start() + Duration::minutes(minute),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_new_history() {
        let history = HistoricalDataManager::new(100);
        assert_eq!(history.max_bars(), 100);
        assert!(history.sizes().is_empty());
    }

    #[test]
    fn test_add_and_get_bars() {
        let history = HistoricalDataManager::new(100);

        history.add_bar(create_test_bar("AAPL", 1, 100.0)).unwrap();
        history.add_bar(create_test_bar("AAPL", 2, 101.0)).unwrap();
        history.add_bar(create_test_bar("AAPL", 3, 102.0)).unwrap();

        let bars = history.get_bars("AAPL", Timeframe::Min1);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 100.0);
        assert_eq!(bars[2].close, 102.0);
        assert_eq!(history.last_timestamp("AAPL", Timeframe::Min1), Some(start() + Duration::minutes(3)));
    }

    #[test]
    fn test_max_bars_limit() {
        let history = HistoricalDataManager::new(5);

        for i in 0..10 {
            history.add_bar(create_test_bar("AAPL", i, 100.0 + i as f64)).unwrap();
        }

        let bars = history.get_bars("AAPL", Timeframe::Min1);
        assert_eq!(bars.len(), 5);
        assert_eq!(bars[0].close, 105.0);
        assert_eq!(bars[4].close, 109.0);
    }

    #[test]
    fn test_duplicate_timestamp_replaces() {
        let history = HistoricalDataManager::new(10);

        assert_eq!(history.add_bar(create_test_bar("AAPL", 1, 100.0)), Ok(StoreOutcome::Appended));
        assert_eq!(history.add_bar(create_test_bar("AAPL", 1, 100.5)), Ok(StoreOutcome::Replaced));

        let bars = history.get_bars("AAPL", Timeframe::Min1);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 100.5);
    }

    #[test]
    fn test_get_recent() {
        let history = HistoricalDataManager::new(100);
        for i in 0..10 {
            history.add_bar(create_test_bar("AAPL", i, 100.0 + i as f64)).unwrap();
        }

        let recent = history.get_recent("AAPL", Timeframe::Min1, 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 107.0);
        assert_eq!(recent[2].close, 109.0);
        assert!(history.get_recent("MSFT", Timeframe::Min1, 3).is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let history = HistoricalDataManager::new(100);
        history.init_key("AAPL", Timeframe::Min5);
        history.add_bar(create_test_bar("AAPL", 1, 100.0)).unwrap();
        history.add_bar(create_test_bar("MSFT", 1, 300.0)).unwrap();

        assert!(history.contains_key("AAPL", Timeframe::Min5));
        assert_eq!(history.bar_count("AAPL", Timeframe::Min5), 0);
        assert_eq!(history.sizes().get("AAPL:1m"), Some(&1));

        assert!(history.remove_key("AAPL", Timeframe::Min1));
        assert_eq!(history.bar_count("AAPL", Timeframe::Min1), 0);
        assert_eq!(history.bar_count("MSFT", Timeframe::Min1), 1);
        assert_eq!(history.stats().keys, 2);
    }

    #[test]
    fn test_fold_into_longer_timeframe() {
        let history = HistoricalDataManager::new(100);
        let bucket = start() + Duration::minutes(5);

        history.fold_into(Timeframe::Min5, bucket, &create_test_bar("AAPL", 1, 100.0)).unwrap();
        history.fold_into(Timeframe::Min5, bucket, &create_test_bar("AAPL", 2, 104.0)).unwrap();
        history.fold_into(Timeframe::Min5, bucket, &create_test_bar("AAPL", 3, 99.0)).unwrap();

        let bars = history.get_bars("AAPL", Timeframe::Min5);
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.timeframe, Timeframe::Min5);
        assert_eq!(bar.timestamp, bucket);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 99.0);
        assert_eq!(bar.volume, 3000.0);

        let next = bucket + Duration::minutes(5);
        assert_eq!(
            history.fold_into(Timeframe::Min5, next, &create_test_bar("AAPL", 6, 101.0)),
            Ok(StoreOutcome::Appended)
        );
        assert_eq!(history.bar_count("AAPL", Timeframe::Min5), 2);

        // A late tick from the finished window does not reopen it
        let late = history.fold_into(Timeframe::Min5, bucket, &create_test_bar("AAPL", 4, 90.0));
        assert!(matches!(late, Err(ValidationError::NonMonotonic { .. })));
        assert_eq!(history.get_bars("AAPL", Timeframe::Min5)[0].low, 98.0);
    }

    #[test]
    fn test_older_bar_is_rejected() {
        let history = HistoricalDataManager::new(10);
        history.add_bar(create_test_bar("AAPL", 2, 100.0)).unwrap();

        let err = history.add_bar(create_test_bar("AAPL", 1, 99.0)).unwrap_err();
        match err {
            ValidationError::NonMonotonic { key, timestamp, last } => {
                assert_eq!(key, "AAPL/1m");
                assert_eq!(timestamp, start() + Duration::minutes(1));
                assert_eq!(last, start() + Duration::minutes(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(history.bar_count("AAPL", Timeframe::Min1), 1);
    }

    #[test]
    fn test_concurrent_producers_keep_order() {
        use std::thread;

        let history = HistoricalDataManager::new(1_000);
        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let history = history.clone();
                thread::spawn(move || {
                    // Every producer delivers the same feed, some lagging behind
                    for i in 0..200 {
                        let minute = if i % 4 == producer { i - 1 } else { i };
                        let _ = history.add_bar(create_test_bar("AAPL", minute.max(0), 100.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let bars = history.get_bars("AAPL", Timeframe::Min1);
        assert!(bars.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let history = HistoricalDataManager::new(100);
        let history_clone = history.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                history_clone.add_bar(create_test_bar("AAPL", i, 100.0)).unwrap();
            }
        });

        for i in 0..50 {
            history.add_bar(create_test_bar("MSFT", i, 100.0)).unwrap();
        }

        handle.join().unwrap();

        assert_eq!(history.bar_count("AAPL", Timeframe::Min1), 50);
        assert_eq!(history.bar_count("MSFT", Timeframe::Min1), 50);
    }
}
