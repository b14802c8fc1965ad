//! Bar close detection
//!
//! One timer task per monitored (symbol, timeframe). Each task sleeps to the
//! next boundary, emits a [`BarCloseEvent`] built from the latest cached bar
//! when that bar is new since the previous emission, and arms the following
//! boundary. The chain only ends when the key is stopped or the detector is
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::CallbackId;
use crate::error::panic_message;
use crate::models::{Bar, Timeframe};

type Key = (String, Timeframe);

/// Boundary notification for one (symbol, timeframe)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarCloseEvent {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub close_time: DateTime<Utc>,
    pub bar: Bar,
    pub next_close_time: DateTime<Utc>,
}

impl BarCloseEvent {
    /// Deterministic id: the same boundary always yields the same id
    pub fn event_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.symbol,
            self.timeframe,
            self.close_time.timestamp()
        )
    }
}

pub type BarCloseCallback =
    Arc<dyn Fn(BarCloseEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wall-clock source for boundary math
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with tokio's clock
///
/// Under a paused test runtime this moves only when tokio time does, which
/// makes boundary firing deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor_instant.elapsed();
        Duration::from_std(elapsed)
            .map(|d| self.anchor_wall + d)
            .unwrap_or(self.anchor_wall)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// IANA market timezone
    pub timezone: String,
    /// Local wall time of the daily close, `HH:MM` or `HH:MM:SS`
    pub daily_close: String,
    /// How early the coarse sleep ends before a boundary
    pub lead_ms: u64,
    /// Wake-ups later than this past a boundary skip it
    pub misfire_grace_ms: u64,
    pub timing_samples: usize,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            daily_close: "16:00".to_string(),
            lead_ms: 100,
            misfire_grace_ms: 1000,
            timing_samples: 100,
        }
    }
}

/// Boundary math for intraday and daily timeframes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSchedule {
    timezone: Tz,
    daily_close: NaiveTime,
}

impl MarketSchedule {
    pub fn new(timezone: Tz, daily_close: NaiveTime) -> Self {
        Self {
            timezone,
            daily_close,
        }
    }

    pub fn from_settings(settings: &ScheduleSettings) -> crate::Result<Self> {
        let timezone: Tz = settings
            .timezone
            .parse()
            .map_err(|e| format!("invalid market timezone '{}': {}", settings.timezone, e))?;
        let daily_close = NaiveTime::parse_from_str(&settings.daily_close, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&settings.daily_close, "%H:%M:%S"))
            .map_err(|e| format!("invalid daily close '{}': {}", settings.daily_close, e))?;
        Ok(Self::new(timezone, daily_close))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First boundary strictly after `after`
    pub fn next_close_time(&self, timeframe: Timeframe, after: DateTime<Utc>) -> DateTime<Utc> {
        if timeframe.is_intraday() {
            let secs = timeframe.seconds();
            let next = (after.timestamp().div_euclid(secs) + 1) * secs;
            return Utc.timestamp_opt(next, 0).single().unwrap_or(after + timeframe.duration());
        }

        let mut date = after.with_timezone(&self.timezone).date_naive();
        // A week of candidates covers any DST oddity
        for _ in 0..7 {
            if let Some(close) = self.daily_close_on(date) {
                if close > after {
                    return close;
                }
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }
        after + timeframe.duration()
    }

    /// Close time of the window that contains `at`
    ///
    /// A timestamp sitting exactly on a boundary belongs to the window
    /// closing there.
    pub fn bucket_close(&self, timeframe: Timeframe, at: DateTime<Utc>) -> DateTime<Utc> {
        self.next_close_time(timeframe, at - Duration::nanoseconds(1))
    }

    fn daily_close_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let local = date.and_time(self.daily_close);
        match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            // Skipped by a DST jump
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(local + Duration::hours(1)))
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

impl Default for MarketSchedule {
    fn default() -> Self {
        Self::new(
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TimingStats {
    pub avg_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Wake {
    OnTime { error_ms: f64 },
    Missed { late_ms: f64 },
}

fn classify_wake(boundary: DateTime<Utc>, woke_at: DateTime<Utc>, grace: Duration) -> Wake {
    let error_ms = (woke_at - boundary)
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
        .unwrap_or(f64::MAX);
    if woke_at > boundary + grace {
        Wake::Missed { late_ms: error_ms }
    } else {
        Wake::OnTime {
            error_ms: error_ms.abs(),
        }
    }
}

struct DetectorInner {
    schedule: MarketSchedule,
    clock: Arc<dyn Clock>,
    lead: Duration,
    misfire_grace: Duration,
    timers: Mutex<HashMap<Key, JoinHandle<()>>>,
    latest_bars: RwLock<HashMap<Key, Bar>>,
    last_emitted: Mutex<HashMap<Key, DateTime<Utc>>>,
    callbacks: RwLock<Vec<(CallbackId, BarCloseCallback)>>,
    next_callback_id: AtomicU64,
    timing: Mutex<VecDeque<f64>>,
    timing_capacity: usize,
    checks_emitted: AtomicU64,
    checks_skipped: AtomicU64,
}

impl DetectorInner {
    fn until(&self, target: DateTime<Utc>) -> std::time::Duration {
        (target - self.clock.now()).to_std().unwrap_or_default()
    }

    fn record_timing(&self, error_ms: f64) {
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.push_back(error_ms);
        while timing.len() > self.timing_capacity {
            timing.pop_front();
        }
    }

    fn is_active(&self, key: &Key) -> bool {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.contains_key(key)
    }

    /// Handle one elapsed boundary. Never fails; the chain continues regardless.
    fn on_boundary(&self, symbol: &str, timeframe: Timeframe, boundary: DateTime<Utc>, next: DateTime<Utc>) {
        let key = (symbol.to_string(), timeframe);
        let bar = {
            let latest = self.latest_bars.read().unwrap_or_else(PoisonError::into_inner);
            latest.get(&key).cloned()
        };

        let Some(bar) = bar else {
            warn!(
                symbol,
                timeframe = %timeframe,
                close_time = %boundary.with_timezone(&self.schedule.timezone),
                "No bar data at bar close, skipping check"
            );
            self.checks_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        {
            let mut emitted = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
            let already_emitted = emitted.get(&key).is_some_and(|last| bar.timestamp <= *last);
            if already_emitted || bar.timestamp < boundary - timeframe.duration() {
                warn!(
                    symbol,
                    timeframe = %timeframe,
                    close_time = %boundary.with_timezone(&self.schedule.timezone),
                    bar_time = %bar.timestamp,
                    "No new bar since the last check, skipping"
                );
                self.checks_skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            emitted.insert(key, bar.timestamp);
        }

        let event = BarCloseEvent {
            symbol: symbol.to_string(),
            timeframe,
            close_time: boundary,
            bar,
            next_close_time: next,
        };
        self.checks_emitted.fetch_add(1, Ordering::Relaxed);

        let callbacks: Vec<(CallbackId, BarCloseCallback)> = {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            callbacks.clone()
        };
        if callbacks.is_empty() {
            return;
        }

        // Runs detached so a stop never cancels an evaluation half way
        tokio::spawn(dispatch(event, callbacks));
    }
}

impl Drop for DetectorInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

async fn dispatch(event: BarCloseEvent, callbacks: Vec<(CallbackId, BarCloseCallback)>) {
    let event_id = event.event_id();
    for (id, callback) in callbacks {
        let call = AssertUnwindSafe(async { callback(event.clone()).await }).catch_unwind();
        match call.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(event_id = %event_id, callback = ?id, "Bar close callback failed: {:#}", e),
            Err(panic) => error!(
                event_id = %event_id,
                callback = ?id,
                "Bar close callback panicked: {}",
                panic_message(panic)
            ),
        }
    }
}

async fn run_timer(inner: Weak<DetectorInner>, symbol: String, timeframe: Timeframe) {
    let mut boundary = match inner.upgrade() {
        Some(detector) => detector.schedule.next_close_time(timeframe, detector.clock.now()),
        None => return,
    };

    loop {
        // Coarse sleep to just before the boundary
        let coarse = match inner.upgrade() {
            Some(detector) => detector.until(boundary - detector.lead),
            None => return,
        };
        if !coarse.is_zero() {
            tokio::time::sleep(coarse).await;
        }

        // Then the remaining lead
        let fine = match inner.upgrade() {
            Some(detector) => detector.until(boundary),
            None => return,
        };
        if !fine.is_zero() {
            tokio::time::sleep(fine).await;
        }

        let Some(detector) = inner.upgrade() else {
            return;
        };
        let key = (symbol.clone(), timeframe);
        if !detector.is_active(&key) {
            return;
        }

        let woke_at = detector.clock.now();
        let next = detector
            .schedule
            .next_close_time(timeframe, boundary.max(woke_at));

        match classify_wake(boundary, woke_at, detector.misfire_grace) {
            Wake::OnTime { error_ms } => {
                detector.record_timing(error_ms);
                detector.on_boundary(&symbol, timeframe, boundary, next);
            }
            Wake::Missed { late_ms } => {
                warn!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    close_time = %boundary,
                    late_ms,
                    "Missed bar close beyond grace period, skipping to next boundary"
                );
                detector.checks_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }

        boundary = next;
    }
}

/// Fires one check per monitored key at each timeframe boundary
pub struct BarCloseDetector {
    inner: Arc<DetectorInner>,
}

impl BarCloseDetector {
    pub fn new(schedule: MarketSchedule, clock: Arc<dyn Clock>, settings: &ScheduleSettings) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                schedule,
                clock,
                lead: Duration::milliseconds(settings.lead_ms as i64),
                misfire_grace: Duration::milliseconds(settings.misfire_grace_ms as i64),
                timers: Mutex::new(HashMap::new()),
                latest_bars: RwLock::new(HashMap::new()),
                last_emitted: Mutex::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
                next_callback_id: AtomicU64::new(1),
                timing: Mutex::new(VecDeque::new()),
                timing_capacity: settings.timing_samples.max(1),
                checks_emitted: AtomicU64::new(0),
                checks_skipped: AtomicU64::new(0),
            }),
        }
    }

    pub fn schedule(&self) -> &MarketSchedule {
        &self.inner.schedule
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Start the boundary chain for a key. Returns false if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn monitor(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let key = (symbol.to_string(), timeframe);
        let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.contains_key(&key) {
            debug!(symbol, timeframe = %timeframe, "Already monitoring");
            return false;
        }

        let next = self
            .inner
            .schedule
            .next_close_time(timeframe, self.inner.clock.now());
        let handle = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            symbol.to_string(),
            timeframe,
        ));
        timers.insert(key, handle);

        info!(
            symbol,
            timeframe = %timeframe,
            next_close = %next.with_timezone(&self.inner.schedule.timezone),
            "Started bar close monitoring"
        );
        true
    }

    /// Stop one timeframe, or every timeframe of `symbol` when `timeframe` is None.
    ///
    /// Returns the timeframes that were stopped. Callbacks already dispatched
    /// run to completion.
    pub fn stop_monitoring(&self, symbol: &str, timeframe: Option<Timeframe>) -> Vec<Timeframe> {
        let mut stopped = Vec::new();
        {
            let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<Key> = timers
                .keys()
                .filter(|(s, tf)| s == symbol && timeframe.map_or(true, |t| t == *tf))
                .cloned()
                .collect();
            for key in keys {
                if let Some(handle) = timers.remove(&key) {
                    handle.abort();
                    stopped.push(key.1);
                }
            }
        }

        let mut latest = self.inner.latest_bars.write().unwrap_or_else(PoisonError::into_inner);
        let mut emitted = self.inner.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        for tf in &stopped {
            let key = (symbol.to_string(), *tf);
            latest.remove(&key);
            emitted.remove(&key);
        }
        drop(emitted);
        drop(latest);

        for tf in &stopped {
            info!(symbol, timeframe = %tf, "Stopped bar close monitoring");
        }
        stopped.sort();
        stopped
    }

    pub fn stop_all(&self) -> usize {
        let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let count = timers.len();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        drop(timers);
        self.inner
            .latest_bars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(count, "Stopped all bar close monitoring");
        count
    }

    /// Cache the bar that the next boundary of its key will carry
    pub fn update_latest_bar(&self, bar: Bar) {
        let mut latest = self.inner.latest_bars.write().unwrap_or_else(PoisonError::into_inner);
        latest.insert((bar.symbol.clone(), bar.timeframe), bar);
    }

    pub fn latest_bar(&self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        let latest = self.inner.latest_bars.read().unwrap_or_else(PoisonError::into_inner);
        latest.get(&(symbol.to_string(), timeframe)).cloned()
    }

    pub fn add_callback<F, Fut>(&self, callback: F) -> CallbackId
    where
        F: Fn(BarCloseEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_boxed_callback(Arc::new(move |event| callback(event).boxed()))
    }

    pub fn add_sync_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(BarCloseEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_boxed_callback(Arc::new(move |event| futures::future::ready(callback(event)).boxed()))
    }

    pub fn add_boxed_callback(&self, callback: BarCloseCallback) -> CallbackId {
        let id = CallbackId::next(&self.inner.next_callback_id);
        let mut callbacks = self.inner.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        callbacks.push((id, callback));
        id
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn is_monitoring(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.inner.is_active(&(symbol.to_string(), timeframe))
    }

    /// Monitored keys, sorted
    pub fn monitored(&self) -> Vec<(String, Timeframe)> {
        let timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<Key> = timers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Timeframes monitored for a symbol, shortest first
    pub fn timeframes_for(&self, symbol: &str) -> Vec<Timeframe> {
        let timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut timeframes: Vec<Timeframe> = timers
            .keys()
            .filter(|(s, _)| s == symbol)
            .map(|(_, tf)| *tf)
            .collect();
        timeframes.sort();
        timeframes
    }

    pub fn timing_stats(&self) -> TimingStats {
        let timing = self.inner.timing.lock().unwrap_or_else(PoisonError::into_inner);
        if timing.is_empty() {
            return TimingStats::default();
        }
        let sum: f64 = timing.iter().sum();
        TimingStats {
            avg_ms: sum / timing.len() as f64,
            max_ms: timing.iter().cloned().fold(f64::MIN, f64::max),
            min_ms: timing.iter().cloned().fold(f64::MAX, f64::min),
            samples: timing.len(),
        }
    }

    /// (emitted, skipped) boundary counts since start
    pub fn check_counts(&self) -> (u64, u64) {
        (
            self.inner.checks_emitted.load(Ordering::Relaxed),
            self.inner.checks_skipped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize};
    use tokio::sync::mpsc;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn bar(symbol: &str, timeframe: Timeframe, at: DateTime<Utc>) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: at,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1_000.0,
        }
    }

    fn detector_at(start: DateTime<Utc>) -> BarCloseDetector {
        BarCloseDetector::new(
            MarketSchedule::default(),
            Arc::new(TokioClock::starting_at(start)),
            &ScheduleSettings::default(),
        )
    }

    #[test]
    fn test_intraday_boundaries() {
        let schedule = MarketSchedule::default();
        let at = utc(2024, 3, 4, 14, 31, 10);

        assert_eq!(schedule.next_close_time(Timeframe::Min1, at), utc(2024, 3, 4, 14, 32, 0));
        assert_eq!(schedule.next_close_time(Timeframe::Min5, at), utc(2024, 3, 4, 14, 35, 0));
        assert_eq!(schedule.next_close_time(Timeframe::Min15, at), utc(2024, 3, 4, 14, 45, 0));
        assert_eq!(schedule.next_close_time(Timeframe::Hour1, at), utc(2024, 3, 4, 15, 0, 0));
        assert_eq!(schedule.next_close_time(Timeframe::Hour4, at), utc(2024, 3, 4, 16, 0, 0));

        // Exactly on a boundary moves to the following one
        let on = utc(2024, 3, 4, 14, 35, 0);
        assert_eq!(schedule.next_close_time(Timeframe::Min5, on), utc(2024, 3, 4, 14, 40, 0));
    }

    #[test]
    fn test_daily_boundaries_follow_market_timezone() {
        let schedule = MarketSchedule::default();

        // 10:00 EST -> 16:00 EST same day
        assert_eq!(
            schedule.next_close_time(Timeframe::Day1, utc(2024, 3, 4, 15, 0, 0)),
            utc(2024, 3, 4, 21, 0, 0)
        );
        // At the close -> next day's close
        assert_eq!(
            schedule.next_close_time(Timeframe::Day1, utc(2024, 3, 4, 21, 0, 0)),
            utc(2024, 3, 5, 21, 0, 0)
        );
        // Summer time
        assert_eq!(
            schedule.next_close_time(Timeframe::Day1, utc(2024, 7, 1, 12, 0, 0)),
            utc(2024, 7, 1, 20, 0, 0)
        );
    }

    #[test]
    fn test_daily_close_across_dst_transitions() {
        let tz = chrono_tz::America::New_York;

        // 02:30 does not exist on 2024-03-10; moves to 03:30 EDT
        let skipped = MarketSchedule::new(tz, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert_eq!(
            skipped.next_close_time(Timeframe::Day1, utc(2024, 3, 10, 5, 0, 0)),
            utc(2024, 3, 10, 7, 30, 0)
        );

        // 01:30 happens twice on 2024-11-03; the first (EDT) wins
        let repeated = MarketSchedule::new(tz, NaiveTime::from_hms_opt(1, 30, 0).unwrap());
        assert_eq!(
            repeated.next_close_time(Timeframe::Day1, utc(2024, 11, 3, 4, 0, 0)),
            utc(2024, 11, 3, 5, 30, 0)
        );
    }

    #[test]
    fn test_bucket_close() {
        let schedule = MarketSchedule::default();
        assert_eq!(
            schedule.bucket_close(Timeframe::Min5, utc(2024, 3, 4, 14, 31, 0)),
            utc(2024, 3, 4, 14, 35, 0)
        );
        assert_eq!(
            schedule.bucket_close(Timeframe::Min5, utc(2024, 3, 4, 14, 35, 0)),
            utc(2024, 3, 4, 14, 35, 0)
        );
        assert_eq!(
            schedule.bucket_close(Timeframe::Day1, utc(2024, 3, 4, 21, 0, 0)),
            utc(2024, 3, 4, 21, 0, 0)
        );
    }

    #[test]
    fn test_schedule_from_settings() {
        let schedule = MarketSchedule::from_settings(&ScheduleSettings {
            timezone: "Europe/London".to_string(),
            daily_close: "16:30:00".to_string(),
            ..ScheduleSettings::default()
        })
        .unwrap();
        assert_eq!(schedule.timezone(), chrono_tz::Europe::London);

        assert!(MarketSchedule::from_settings(&ScheduleSettings {
            timezone: "Mars/Olympus".to_string(),
            ..ScheduleSettings::default()
        })
        .is_err());
        assert!(MarketSchedule::from_settings(&ScheduleSettings {
            daily_close: "4pm".to_string(),
            ..ScheduleSettings::default()
        })
        .is_err());
    }

    #[test]
    fn test_classify_wake() {
        let boundary = utc(2024, 3, 4, 14, 31, 0);
        let grace = Duration::milliseconds(1000);

        assert_eq!(
            classify_wake(boundary, boundary + Duration::milliseconds(3), grace),
            Wake::OnTime { error_ms: 3.0 }
        );
        assert_eq!(
            classify_wake(boundary, boundary - Duration::milliseconds(2), grace),
            Wake::OnTime { error_ms: 2.0 }
        );
        assert_eq!(
            classify_wake(boundary, boundary + Duration::milliseconds(1500), grace),
            Wake::Missed { late_ms: 1500.0 }
        );
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let close = utc(2024, 3, 4, 14, 31, 0);
        let event = BarCloseEvent {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::Min1,
            close_time: close,
            bar: bar("AAPL", Timeframe::Min1, close),
            next_close_time: close + Duration::minutes(1),
        };
        assert_eq!(event.event_id(), format!("AAPL_1m_{}", close.timestamp()));
        assert_eq!(event.event_id(), event.clone().event_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_each_boundary() {
        let start = utc(2024, 3, 4, 14, 30, 20);
        let detector = detector_at(start);
        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.add_sync_callback(move |event| {
            let _ = tx.send(event);
            Ok(())
        });

        assert!(detector.monitor("AAPL", Timeframe::Min1));
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 31, 0)));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.close_time, utc(2024, 3, 4, 14, 31, 0));
        assert_eq!(first.next_close_time, utc(2024, 3, 4, 14, 32, 0));
        assert_eq!(first.symbol, "AAPL");

        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 32, 0)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.close_time, utc(2024, 3, 4, 14, 32, 0));
        assert_eq!(second.bar.timestamp, utc(2024, 3, 4, 14, 32, 0));

        let stats = detector.timing_stats();
        assert_eq!(stats.samples, 2);
        assert!(stats.max_ms < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_is_idempotent() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        assert!(detector.monitor("AAPL", Timeframe::Min1));
        assert!(!detector.monitor("AAPL", Timeframe::Min1));
        assert!(detector.monitor("AAPL", Timeframe::Min5));

        assert_eq!(detector.monitored().len(), 2);
        assert_eq!(detector.timeframes_for("AAPL"), vec![Timeframe::Min1, Timeframe::Min5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bar_skips_but_chain_continues() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        detector.add_sync_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        detector.monitor("AAPL", Timeframe::Min1);
        tokio::time::sleep(std::time::Duration::from_secs(130)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(detector.check_counts(), (0, 2));

        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 32, 0)));
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_callbacks_do_not_block_siblings() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        let fired = Arc::new(AtomicUsize::new(0));

        detector.add_sync_callback(|_| anyhow::bail!("boom"));
        detector.add_sync_callback(|_| panic!("callback panic"));
        let counter = fired.clone();
        detector.add_callback(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        detector.monitor("AAPL", Timeframe::Min1);
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 31, 0)));
        tokio::time::sleep(std::time::Duration::from_secs(100)).await;

        // 14:31 only; the same bar is not offered again at 14:32
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_feed_emits_each_bar_once() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.add_sync_callback(move |event| {
            let _ = tx.send(event);
            Ok(())
        });

        detector.monitor("AAPL", Timeframe::Min1);
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 31, 0)));

        // Boundaries at 14:31, 14:32 and 14:33 with no tick after the first
        tokio::time::sleep(std::time::Duration::from_secs(200)).await;
        let first = rx.try_recv().unwrap();
        assert_eq!(first.close_time, utc(2024, 3, 4, 14, 31, 0));
        assert!(rx.try_recv().is_err());
        assert_eq!(detector.check_counts(), (1, 2));

        // The feed resumes
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 34, 0)));
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        let resumed = rx.try_recv().unwrap();
        assert_eq!(resumed.close_time, utc(2024, 3, 4, 14, 34, 0));
        assert_eq!(detector.check_counts(), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bar_older_than_closing_window_is_skipped() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        detector.add_sync_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        detector.monitor("AAPL", Timeframe::Min1);
        // Closed at 14:29; the 14:31 boundary covers 14:30 to 14:31
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 29, 0)));
        tokio::time::sleep(std::time::Duration::from_secs(50)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(detector.check_counts(), (0, 1));
    }

    /// Tokio-driven clock whose wall time can be pushed forward mid-sleep
    struct JumpingClock {
        base: TokioClock,
        offset_secs: AtomicI64,
    }

    impl Clock for JumpingClock {
        fn now(&self) -> DateTime<Utc> {
            self.base.now() + Duration::seconds(self.offset_secs.load(Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_wake_skips_boundary_and_fires_next_once() {
        let clock = Arc::new(JumpingClock {
            base: TokioClock::starting_at(utc(2024, 3, 4, 14, 30, 20)),
            offset_secs: AtomicI64::new(0),
        });
        let detector = BarCloseDetector::new(
            MarketSchedule::default(),
            clock.clone(),
            &ScheduleSettings::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.add_sync_callback(move |event| {
            let _ = tx.send(event);
            Ok(())
        });

        detector.monitor("AAPL", Timeframe::Min1);
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 31, 0)));

        // The timer is asleep toward 14:31 when wall time jumps 35s ahead,
        // so it wakes around 14:31:35, well past the grace period
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        clock.offset_secs.store(35, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].close_time, utc(2024, 3, 4, 14, 32, 0));
        assert_eq!(events[0].next_close_time, utc(2024, 3, 4, 14, 33, 0));
        assert_eq!(detector.check_counts(), (1, 1));
        assert_eq!(detector.timing_stats().samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_cancels_timer() {
        let detector = detector_at(utc(2024, 3, 4, 14, 30, 20));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = detector.add_sync_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        detector.monitor("AAPL", Timeframe::Min1);
        detector.monitor("AAPL", Timeframe::Min5);
        detector.update_latest_bar(bar("AAPL", Timeframe::Min1, utc(2024, 3, 4, 14, 31, 0)));

        assert_eq!(detector.stop_monitoring("AAPL", Some(Timeframe::Min1)), vec![Timeframe::Min1]);
        assert!(!detector.is_monitoring("AAPL", Timeframe::Min1));
        assert!(detector.is_monitoring("AAPL", Timeframe::Min5));
        assert!(detector.latest_bar("AAPL", Timeframe::Min1).is_none());

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert_eq!(detector.stop_monitoring("AAPL", None), vec![Timeframe::Min5]);
        assert!(detector.monitored().is_empty());
        assert!(detector.remove_callback(id));
        assert!(!detector.remove_callback(id));
    }
}
