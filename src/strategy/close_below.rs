use std::sync::Arc;

use async_trait::async_trait;

use super::config::Params;
use super::scoring::{confirmed_closes, ScoreBreakdown};
use super::{check_parameters, ExecutionFunction, ExecutionFunctionConfig, ExecutionSignal, Metadata, SignalAction};
use crate::error::{EvaluationError, FunctionError};
use crate::execution::ExecutionContext;

const EXIT_BASE_CONFIDENCE: f64 = 0.75;
const SHORT_BASE_CONFIDENCE: f64 = 0.6;

/// What a close below the threshold means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBelowMode {
    /// Protect capital: close the open position
    Exit,
    /// Open a short position
    EnterShort,
}

impl CloseBelowMode {
    fn parse(params: &Params<'_>) -> Result<Self, FunctionError> {
        match params.str("action")?.map(|s| s.to_ascii_lowercase()) {
            None => Ok(CloseBelowMode::Exit),
            Some(s) if s == "exit" => Ok(CloseBelowMode::Exit),
            Some(s) if s == "enter_short" || s == "short" => Ok(CloseBelowMode::EnterShort),
            Some(other) => Err(params.invalid(
                "action",
                format!("expected 'exit' or 'enter_short', got '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CloseBelowParams {
    threshold: f64,
    mode: CloseBelowMode,
    confirmation_bars: usize,
    min_volume: Option<f64>,
    min_distance_pct: Option<f64>,
    max_distance_pct: Option<f64>,
}

impl CloseBelowParams {
    fn parse(params: &Params<'_>, lookback_bars: usize) -> Result<Self, FunctionError> {
        let threshold = params.require_f64("threshold")?;
        if threshold <= 0.0 {
            return Err(params.invalid("threshold", "must be positive"));
        }

        let mode = CloseBelowMode::parse(params)?;

        let confirmation_bars = params.usize("confirmation_bars")?.unwrap_or(1);
        if confirmation_bars == 0 || confirmation_bars > lookback_bars {
            return Err(params.invalid(
                "confirmation_bars",
                format!("must be between 1 and lookback_bars ({})", lookback_bars),
            ));
        }

        let min_volume = params.f64("min_volume")?;
        if min_volume.is_some_and(|v| v < 0.0) {
            return Err(params.invalid("min_volume", "must not be negative"));
        }

        let min_distance_pct = params.f64("min_distance_pct")?;
        let max_distance_pct = params.f64("max_distance_pct")?;
        if min_distance_pct.is_some_and(|v| v < 0.0) {
            return Err(params.invalid("min_distance_pct", "must not be negative"));
        }
        if max_distance_pct.is_some_and(|v| v <= 0.0) {
            return Err(params.invalid("max_distance_pct", "must be positive"));
        }
        if let (Some(min), Some(max)) = (min_distance_pct, max_distance_pct) {
            if min > max {
                return Err(params.invalid(
                    "min_distance_pct",
                    format!("must not exceed max_distance_pct ({})", max),
                ));
            }
        }

        Ok(Self {
            threshold,
            mode,
            confirmation_bars,
            min_volume,
            min_distance_pct,
            max_distance_pct,
        })
    }
}

/// Act when a bar closes below a price threshold
///
/// With `action = "exit"` (the default) this is a stop: it closes an open
/// position and does nothing when flat. With `action = "enter_short"` it
/// opens a short. `min_distance_pct`/`max_distance_pct` bound how far below
/// the threshold the close may be.
#[derive(Debug, Clone)]
pub struct CloseBelowFunction {
    config: ExecutionFunctionConfig,
    params: CloseBelowParams,
}

impl CloseBelowFunction {
    pub const TYPE: &'static str = "close_below";
    const REQUIRED: &'static [&'static str] = &["threshold"];

    pub fn new(config: ExecutionFunctionConfig) -> Result<Self, FunctionError> {
        let lookback = config.lookback_bars;
        check_parameters(&config, Self::REQUIRED, |c| {
            CloseBelowParams::parse(&c.params(), lookback).map(|_| ())
        })?;
        let params = CloseBelowParams::parse(&config.params(), lookback)?;
        Ok(Self { config, params })
    }

    /// Registry factory
    pub fn create(config: ExecutionFunctionConfig) -> Result<Arc<dyn ExecutionFunction>, FunctionError> {
        Ok(Arc::new(Self::new(config)?))
    }

    pub fn mode(&self) -> CloseBelowMode {
        self.params.mode
    }
}

#[async_trait]
impl ExecutionFunction for CloseBelowFunction {
    fn config(&self) -> &ExecutionFunctionConfig {
        &self.config
    }

    fn function_type(&self) -> &'static str {
        Self::TYPE
    }

    fn description(&self) -> String {
        let verb = match self.params.mode {
            CloseBelowMode::Exit => "Exit position",
            CloseBelowMode::EnterShort => "Enter short",
        };
        format!("{} when close < {:.2}", verb, self.params.threshold)
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        Self::REQUIRED
    }

    fn validate_parameters(&self, params: &Metadata) -> bool {
        CloseBelowParams::parse(&Params::over(&self.config.name, params), self.config.lookback_bars)
            .is_ok()
    }

    async fn analyze(&self, context: &ExecutionContext) -> Result<ExecutionSignal, EvaluationError> {
        let bar = &context.current_bar;
        let threshold = self.params.threshold;

        // Nothing to protect when flat
        if self.params.mode == CloseBelowMode::Exit && context.open_position().is_none() {
            return Ok(ExecutionSignal::no_action(format!(
                "No position to exit for {}",
                context.symbol
            )));
        }

        if bar.close >= threshold {
            return Ok(ExecutionSignal::no_action(format!(
                "Close {:.2} not below threshold {:.2}",
                bar.close, threshold
            ))
            .with_metadata("threshold", threshold));
        }

        let distance_pct = (threshold - bar.close) / threshold * 100.0;
        if let Some(min) = self.params.min_distance_pct {
            if distance_pct < min {
                return Ok(ExecutionSignal::no_action(format!(
                    "Close {:.2}% below threshold, need at least {:.2}%",
                    distance_pct, min
                )));
            }
        }
        if let Some(max) = self.params.max_distance_pct {
            if distance_pct > max {
                return Ok(ExecutionSignal::no_action(format!(
                    "Close {:.2}% below threshold exceeds maximum {:.2}%",
                    distance_pct, max
                )));
            }
        }

        if let Some(min_volume) = self.params.min_volume {
            if bar.volume < min_volume {
                return Ok(ExecutionSignal::no_action(format!(
                    "Close {:.2} below {:.2} but volume {:.0} below minimum {:.0}",
                    bar.close, threshold, bar.volume, min_volume
                )));
            }
        }

        let needed = self.params.confirmation_bars;
        let Some((below, is_confirmed)) = confirmed_closes(context, needed, |c| c < threshold) else {
            return Ok(ExecutionSignal::no_action(format!(
                "Waiting for {} confirmation bars, have {}",
                needed,
                context.historical_bars.len() + 1
            )));
        };
        if !is_confirmed {
            return Ok(ExecutionSignal::no_action(format!(
                "Only {} of {} bars closed below {:.2}",
                below, needed, threshold
            )));
        }

        let score = ScoreBreakdown::compute(context, distance_pct, false);
        let (action, base, what) = match self.params.mode {
            CloseBelowMode::Exit => (SignalAction::Exit, EXIT_BASE_CONFIDENCE, "exit"),
            CloseBelowMode::EnterShort => (SignalAction::EnterShort, SHORT_BASE_CONFIDENCE, "short entry"),
        };

        let mut signal = ExecutionSignal::new(
            action,
            base + score.total_boost(),
            format!(
                "Close {:.2} below threshold {:.2} (-{:.2}%), {}",
                bar.close, threshold, distance_pct, what
            ),
        )
        .with_metadata("threshold", threshold)
        .with_metadata("distance_pct", distance_pct);
        if let Some(ratio) = score.volume_ratio {
            signal = signal.with_metadata("volume_ratio", ratio);
        }
        if let Some(momentum) = score.momentum_pct {
            signal = signal.with_metadata("momentum_pct", momentum);
        }
        Ok(signal)
    }
}
