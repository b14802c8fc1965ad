use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::{BarCloseDetector, BarCloseEvent};
use super::history::{HistoricalDataManager, StoreOutcome};
use super::{AccountProvider, CallbackId, ExecutionContext, SignalEmitter};
use crate::audit::{ExecutionLogEntry, ExecutionLogger};
use crate::config::EngineSettings;
use crate::error::{panic_message, EvaluationError, SignalError, ValidationError};
use crate::models::{Bar, Timeframe};
use crate::strategy::{EdgeCaseDetector, ExecutionFunction, FunctionRegistry};
use crate::validation::BarValidator;

/// Shared components the adapter works through
#[derive(Clone)]
pub struct AdapterComponents {
    pub registry: Arc<FunctionRegistry>,
    pub detector: Arc<BarCloseDetector>,
    pub emitter: Arc<SignalEmitter>,
    pub logger: Arc<ExecutionLogger>,
    pub account: Option<Arc<dyn AccountProvider>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AdapterStats {
    pub ticks_received: u64,
    pub ticks_rejected: u64,
    pub boundaries_evaluated: u64,
    pub boundaries_warming_up: u64,
    pub evaluations: u64,
    pub evaluation_errors: u64,
    pub signals_emitted: u64,
}

#[derive(Default)]
struct Counters {
    ticks_received: AtomicU64,
    ticks_rejected: AtomicU64,
    boundaries_evaluated: AtomicU64,
    boundaries_warming_up: AtomicU64,
    evaluations: AtomicU64,
    evaluation_errors: AtomicU64,
    signals_emitted: AtomicU64,
}

/// Bridges the tick stream and bar close events to function evaluation
///
/// Ticks are validated and stored; the detector fires boundaries back into
/// `on_bar_close`, which evaluates every enabled function for the timeframe
/// against one shared context.
pub struct MarketDataAdapter {
    settings: EngineSettings,
    components: AdapterComponents,
    history: HistoricalDataManager,
    validator: BarValidator,
    edge_cases: EdgeCaseDetector,
    callback_id: CallbackId,
    counters: Counters,
}

impl MarketDataAdapter {
    /// Build the adapter and subscribe it to the detector's bar closes
    pub fn new(
        settings: EngineSettings,
        components: AdapterComponents,
        validator: BarValidator,
        edge_cases: EdgeCaseDetector,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let callback_id = components.detector.add_callback(move |event| {
                let adapter = weak.upgrade();
                async move {
                    match adapter {
                        Some(adapter) => adapter
                            .on_bar_close(event)
                            .await
                            .map(|_| ())
                            .map_err(anyhow::Error::from),
                        None => Ok(()),
                    }
                }
            });

            Self {
                history: HistoricalDataManager::new(settings.max_history_bars),
                settings,
                components,
                validator,
                edge_cases,
                callback_id,
                counters: Counters::default(),
            }
        })
    }

    pub fn history(&self) -> &HistoricalDataManager {
        &self.history
    }

    /// Validate and store one tick
    ///
    /// A tick on the finest monitored timeframe of its symbol is also folded
    /// into the forming bar of every longer monitored timeframe. Rejected
    /// ticks are logged and dropped; the error is returned for the caller's
    /// information only.
    pub fn on_tick(&self, bar: Bar) -> Result<StoreOutcome, ValidationError> {
        self.counters.ticks_received.fetch_add(1, Ordering::Relaxed);

        // The history re-checks ordering under its write lock
        let last = self.history.last_timestamp(&bar.symbol, bar.timeframe);
        let outcome = self
            .validator
            .validate(&bar, last, self.components.detector.now())
            .and_then(|()| self.history.add_bar(bar.clone()));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.counters.ticks_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %bar.symbol,
                    timeframe = %bar.timeframe,
                    timestamp = %bar.timestamp,
                    "Rejected bar: {}",
                    e
                );
                return Err(e);
            }
        };
        self.components.detector.update_latest_bar(bar.clone());

        if outcome == StoreOutcome::Replaced {
            debug!(symbol = %bar.symbol, timeframe = %bar.timeframe, "Duplicate bar replaced");
            return Ok(outcome);
        }

        let monitored = self.components.detector.timeframes_for(&bar.symbol);
        if monitored.first() == Some(&bar.timeframe) {
            let schedule = self.components.detector.schedule();
            for timeframe in monitored.iter().filter(|tf| **tf > bar.timeframe) {
                let bucket = schedule.bucket_close(*timeframe, bar.timestamp);
                if let Err(e) = self.history.fold_into(*timeframe, bucket, &bar) {
                    warn!(symbol = %bar.symbol, timeframe = %timeframe, "Tick not rolled up: {}", e);
                    continue;
                }
                if let Some(forming) = self.history.latest(&bar.symbol, *timeframe) {
                    self.components.detector.update_latest_bar(forming);
                }
            }
        }

        Ok(outcome)
    }

    /// Evaluate every enabled function for the event's timeframe
    ///
    /// Returns the number of audit entries written. Too little history is
    /// the normal warm-up state and writes nothing. Every function is
    /// evaluated and logged even after a circuit-open refusal; emission stops
    /// and the refusal is returned once the boundary is done.
    pub async fn on_bar_close(&self, event: BarCloseEvent) -> Result<usize, SignalError> {
        let functions: Vec<Arc<dyn ExecutionFunction>> = self
            .components
            .registry
            .functions_for_timeframe(event.timeframe)
            .into_iter()
            .filter(|f| f.is_enabled())
            .collect();
        if functions.is_empty() {
            debug!(symbol = %event.symbol, timeframe = %event.timeframe, "No functions for timeframe");
            return Ok(0);
        }

        let Some(context) = self.build_context(&event, &functions).await else {
            return Ok(0);
        };
        let context = Arc::new(context);
        self.counters.boundaries_evaluated.fetch_add(1, Ordering::Relaxed);

        if !context.edge_cases.is_empty() {
            info!(
                symbol = %event.symbol,
                timeframe = %event.timeframe,
                "Edge cases at bar close: {}",
                context
                    .edge_cases
                    .iter()
                    .map(|c| c.description.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }

        let mut logged = 0;
        let mut circuit_error: Option<SignalError> = None;

        for function in &functions {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(function.evaluate(&context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(EvaluationError::Panicked(panic_message(panic))));
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.counters.evaluations.fetch_add(1, Ordering::Relaxed);

            let signal = match outcome {
                Ok(signal) => {
                    debug!(
                        function = %function.name(),
                        symbol = %context.symbol,
                        action = %signal.action,
                        confidence = signal.confidence,
                        duration_ms,
                        "{}",
                        signal.reasoning
                    );
                    self.components.logger.log(ExecutionLogEntry::success(
                        function.name(),
                        &context,
                        signal.clone(),
                        duration_ms,
                    ));
                    signal
                }
                Err(e) => {
                    self.counters.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        function = %function.name(),
                        symbol = %context.symbol,
                        timeframe = %context.timeframe,
                        duration_ms,
                        "Execution function failed: {}",
                        e
                    );
                    self.components.logger.log(ExecutionLogEntry::failure(
                        function.name(),
                        &context,
                        &e,
                        duration_ms,
                    ));
                    logged += 1;
                    continue;
                }
            };
            logged += 1;

            if !signal.should_execute() {
                continue;
            }
            if circuit_error.is_some() {
                warn!(
                    function = %function.name(),
                    symbol = %context.symbol,
                    action = %signal.action,
                    "Signal not emitted, downstream circuit open"
                );
                continue;
            }

            info!(
                function = %function.name(),
                symbol = %context.symbol,
                action = %signal.action,
                confidence = signal.confidence,
                "Execution signal: {}",
                signal.reasoning
            );
            self.counters.signals_emitted.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .components
                .emitter
                .emit(function.name(), Arc::clone(&context), signal)
                .await
            {
                circuit_error = Some(e);
            }
        }

        match circuit_error {
            Some(e) => {
                error!(
                    symbol = %event.symbol,
                    timeframe = %event.timeframe,
                    "Signal distribution halted for this bar close: {}",
                    e
                );
                Err(e)
            }
            None => Ok(logged),
        }
    }

    async fn build_context(
        &self,
        event: &BarCloseEvent,
        functions: &[Arc<dyn ExecutionFunction>],
    ) -> Option<ExecutionContext> {
        let min_bars = self.settings.min_bars_for_execution.max(1);
        let lookback = functions
            .iter()
            .map(|f| f.config().lookback_bars)
            .max()
            .unwrap_or(min_bars)
            .max(min_bars);

        let mut historical = self.history.get_recent(&event.symbol, event.timeframe, lookback + 1);
        if historical
            .last()
            .is_some_and(|b| b.timestamp == event.bar.timestamp)
        {
            historical.pop();
        }
        // The closing bar counts towards the minimum
        let available = historical.len() + 1;
        if available < min_bars {
            self.counters.boundaries_warming_up.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %event.symbol,
                timeframe = %event.timeframe,
                available,
                required = min_bars,
                "Insufficient history, skipping bar close"
            );
            return None;
        }
        if historical.len() > lookback {
            historical.drain(..historical.len() - lookback);
        }

        let (position, account_balance) = match &self.components.account {
            Some(account) => (
                account.position(&event.symbol).await,
                account.account_balance().await,
            ),
            None => (None, self.settings.account_balance),
        };

        let edge_cases = self.edge_cases.detect_all(&event.bar, &historical);

        Some(ExecutionContext {
            symbol: event.symbol.clone(),
            timeframe: event.timeframe,
            current_bar: event.bar.clone(),
            historical_bars: historical,
            plan_parameters: self.settings.plan_parameters.clone(),
            position,
            account_balance,
            timestamp: event.close_time,
            edge_cases,
        })
    }

    /// Prepare storage and start boundary checks for a key
    pub fn start_monitoring(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.history.init_key(symbol, timeframe);
        self.components.detector.monitor(symbol, timeframe)
    }

    /// Stop boundary checks and discard history. `None` stops every timeframe of the symbol.
    pub fn stop_monitoring(&self, symbol: &str, timeframe: Option<Timeframe>) -> Vec<Timeframe> {
        let stopped = self.components.detector.stop_monitoring(symbol, timeframe);
        for tf in &stopped {
            self.history.remove_key(symbol, *tf);
        }
        if let Some(tf) = timeframe {
            self.history.remove_key(symbol, tf);
        }
        stopped
    }

    pub fn stats(&self) -> AdapterStats {
        let c = &self.counters;
        AdapterStats {
            ticks_received: c.ticks_received.load(Ordering::Relaxed),
            ticks_rejected: c.ticks_rejected.load(Ordering::Relaxed),
            boundaries_evaluated: c.boundaries_evaluated.load(Ordering::Relaxed),
            boundaries_warming_up: c.boundaries_warming_up.load(Ordering::Relaxed),
            evaluations: c.evaluations.load(Ordering::Relaxed),
            evaluation_errors: c.evaluation_errors.load(Ordering::Relaxed),
            signals_emitted: c.signals_emitted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MarketDataAdapter {
    fn drop(&mut self) {
        self.components.detector.remove_callback(self.callback_id);
    }
}
