//! Engine wiring and the operational health surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::audit::{ExecutionLogEntry, ExecutionLogger, LogQuery, LoggerStats};
use crate::config::Settings;
use crate::error::ValidationError;
use crate::execution::emitter::EmitterStats;
use crate::execution::handler::HandlerStats;
use crate::execution::{
    AccountProvider, AdapterComponents, AdapterStats, BarCloseDetector, CallbackId, Clock,
    MarketDataAdapter, MarketSchedule, OrderIntent, SignalEmitter, SignalHandler, SignalPayload,
    StoreOutcome, SystemClock, TimingStats,
};
use crate::models::{Bar, Timeframe};
use crate::strategy::registry::RegistryStats;
use crate::strategy::{EdgeCaseDetector, FunctionRegistry};
use crate::validation::BarValidator;

#[derive(Debug, Clone, Serialize)]
pub struct MonitoredKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub timestamp: DateTime<Utc>,
    pub timing: TimingStats,
    pub checks_emitted: u64,
    pub checks_skipped: u64,
    pub monitored: Vec<MonitoredKey>,
    pub registry: RegistryStats,
    pub audit: LoggerStats,
    pub history: BTreeMap<String, usize>,
    pub adapter: AdapterStats,
    pub emitter: EmitterStats,
    pub handler: HandlerStats,
}

/// Optional collaborators supplied by the host
#[derive(Default)]
pub struct EngineOptions {
    pub clock: Option<Arc<dyn Clock>>,
    pub account: Option<Arc<dyn AccountProvider>>,
    pub registry: Option<Arc<FunctionRegistry>>,
}

/// Owns every component and the order intent queue's sending side
pub struct ExecutionEngine {
    settings: Settings,
    registry: Arc<FunctionRegistry>,
    detector: Arc<BarCloseDetector>,
    emitter: Arc<SignalEmitter>,
    logger: Arc<ExecutionLogger>,
    handler: Arc<SignalHandler>,
    adapter: Arc<MarketDataAdapter>,
}

impl ExecutionEngine {
    /// Build the engine from settings. Functions listed in the settings are
    /// created up front; the order intent receiver is returned to the caller.
    pub fn new(settings: Settings) -> crate::Result<(Self, mpsc::Receiver<OrderIntent>)> {
        Self::with_options(settings, EngineOptions::default())
    }

    pub fn with_options(
        settings: Settings,
        options: EngineOptions,
    ) -> crate::Result<(Self, mpsc::Receiver<OrderIntent>)> {
        settings.validate()?;

        let registry = options
            .registry
            .unwrap_or_else(|| Arc::new(FunctionRegistry::with_builtin()));
        for config in &settings.functions {
            registry.create_function(config.clone())?;
        }

        let schedule = MarketSchedule::from_settings(&settings.schedule)?;
        let clock = options.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let detector = Arc::new(BarCloseDetector::new(schedule, clock, &settings.schedule));
        let emitter = Arc::new(SignalEmitter::new());
        let logger = Arc::new(ExecutionLogger::new(&settings.audit));

        let (handler, orders) = SignalHandler::new(settings.handler.clone());
        let handler = Arc::new(handler);
        emitter.add_boxed_callback(handler.callback());

        let adapter = MarketDataAdapter::new(
            settings.engine.clone(),
            AdapterComponents {
                registry: registry.clone(),
                detector: detector.clone(),
                emitter: emitter.clone(),
                logger: logger.clone(),
                account: options.account,
            },
            BarValidator::new(settings.validation.clone()),
            EdgeCaseDetector::new(settings.edge_cases.clone()),
        );

        info!(
            functions = registry.list_functions().len(),
            timezone = %settings.schedule.timezone,
            durable_audit = settings.audit.log_dir.is_some(),
            "Execution engine built"
        );

        let engine = Self {
            settings,
            registry,
            detector,
            emitter,
            logger,
            handler,
            adapter,
        };
        Ok((engine, orders))
    }

    /// Start every monitor listed in the settings. Needs a tokio runtime.
    pub fn start(&self) -> usize {
        let mut started = 0;
        for monitor in &self.settings.monitors {
            if self.start_monitoring(&monitor.symbol, monitor.timeframe) {
                started += 1;
            }
        }
        info!(started, "Monitors started");
        started
    }

    pub fn start_monitoring(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.adapter.start_monitoring(symbol, timeframe)
    }

    pub fn stop_monitoring(&self, symbol: &str, timeframe: Option<Timeframe>) -> Vec<Timeframe> {
        self.adapter.stop_monitoring(symbol, timeframe)
    }

    pub fn on_tick(&self, bar: Bar) -> Result<StoreOutcome, ValidationError> {
        self.adapter.on_tick(bar)
    }

    /// Register an additional consumer of emitted signals
    pub fn add_signal_callback<F, Fut>(&self, callback: F) -> CallbackId
    where
        F: Fn(SignalPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), crate::error::SignalError>> + Send + 'static,
    {
        self.emitter.add_callback(callback)
    }

    pub fn remove_signal_callback(&self, id: CallbackId) -> bool {
        self.emitter.remove_callback(id)
    }

    pub fn query(&self, query: &LogQuery) -> Vec<ExecutionLogEntry> {
        self.logger.query(query)
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<BarCloseDetector> {
        &self.detector
    }

    pub fn logger(&self) -> &Arc<ExecutionLogger> {
        &self.logger
    }

    pub fn adapter(&self) -> &Arc<MarketDataAdapter> {
        &self.adapter
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn health(&self) -> EngineHealth {
        let (checks_emitted, checks_skipped) = self.detector.check_counts();
        EngineHealth {
            timestamp: self.detector.now(),
            timing: self.detector.timing_stats(),
            checks_emitted,
            checks_skipped,
            monitored: self
                .detector
                .monitored()
                .into_iter()
                .map(|(symbol, timeframe)| MonitoredKey { symbol, timeframe })
                .collect(),
            registry: self.registry.stats(),
            audit: self.logger.stats(),
            history: self.adapter.history().sizes(),
            adapter: self.adapter.stats(),
            emitter: self.emitter.stats(),
            handler: self.handler.stats(),
        }
    }

    /// Stop every boundary chain. In-flight evaluations finish on their own tasks.
    pub fn shutdown(&self) {
        let keys = self.detector.monitored();
        for (symbol, timeframe) in &keys {
            self.adapter.stop_monitoring(symbol, Some(*timeframe));
        }
        let remaining = self.detector.stop_all();
        info!(stopped = keys.len() + remaining, "Execution engine stopped");
    }
}
