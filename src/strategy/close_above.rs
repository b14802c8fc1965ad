use std::sync::Arc;

use async_trait::async_trait;

use super::config::Params;
use super::scoring::{confirmed_closes, ScoreBreakdown};
use super::{check_parameters, ExecutionFunction, ExecutionFunctionConfig, ExecutionSignal, Metadata, SignalAction};
use crate::error::{EvaluationError, FunctionError};
use crate::execution::ExecutionContext;

const BASE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
struct CloseAboveParams {
    threshold: f64,
    confirmation_bars: usize,
    min_volume: Option<f64>,
}

impl CloseAboveParams {
    fn parse(params: &Params<'_>, lookback_bars: usize) -> Result<Self, FunctionError> {
        let threshold = params.require_f64("threshold")?;
        if threshold <= 0.0 {
            return Err(params.invalid("threshold", "must be positive"));
        }

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

        Ok(Self {
            threshold,
            confirmation_bars,
            min_volume,
        })
    }
}

/// Enter long when a bar closes above a price threshold
///
/// Parameters:
/// - `threshold` (required): price the close must exceed
/// - `confirmation_bars`: how many consecutive closes must be above (default 1)
/// - `min_volume`: minimum volume of the closing bar
///
/// Confidence starts at 0.6 and is boosted by distance above the threshold,
/// volume vs. the 20-bar average, and 3-bar momentum.
#[derive(Debug, Clone)]
pub struct CloseAboveFunction {
    config: ExecutionFunctionConfig,
    params: CloseAboveParams,
}

impl CloseAboveFunction {
    pub const TYPE: &'static str = "close_above";
    const REQUIRED: &'static [&'static str] = &["threshold"];

    pub fn new(config: ExecutionFunctionConfig) -> Result<Self, FunctionError> {
        let lookback = config.lookback_bars;
        check_parameters(&config, Self::REQUIRED, |c| {
            CloseAboveParams::parse(&c.params(), lookback).map(|_| ())
        })?;
        let params = CloseAboveParams::parse(&config.params(), lookback)?;
        Ok(Self { config, params })
    }

    /// Registry factory
    pub fn create(config: ExecutionFunctionConfig) -> Result<Arc<dyn ExecutionFunction>, FunctionError> {
        Ok(Arc::new(Self::new(config)?))
    }

    pub fn threshold(&self) -> f64 {
        self.params.threshold
    }
}

#[async_trait]
impl ExecutionFunction for CloseAboveFunction {
    fn config(&self) -> &ExecutionFunctionConfig {
        &self.config
    }

    fn function_type(&self) -> &'static str {
        Self::TYPE
    }

    fn description(&self) -> String {
        let mut description = format!("Enter long when close > {:.2}", self.params.threshold);
        if self.params.confirmation_bars > 1 {
            description.push_str(&format!(
                " for {} consecutive bars",
                self.params.confirmation_bars
            ));
        }
        if let Some(min_volume) = self.params.min_volume {
            description.push_str(&format!(" with volume >= {:.0}", min_volume));
        }
        description
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        Self::REQUIRED
    }

    fn validate_parameters(&self, params: &Metadata) -> bool {
        CloseAboveParams::parse(&Params::over(&self.config.name, params), self.config.lookback_bars)
            .is_ok()
    }

    async fn analyze(&self, context: &ExecutionContext) -> Result<ExecutionSignal, EvaluationError> {
        let bar = &context.current_bar;
        let threshold = self.params.threshold;

        if bar.close <= threshold {
            return Ok(ExecutionSignal::no_action(format!(
                "Close {:.2} not above threshold {:.2}",
                bar.close, threshold
            ))
            .with_metadata("threshold", threshold));
        }

        if let Some(min_volume) = self.params.min_volume {
            if bar.volume < min_volume {
                return Ok(ExecutionSignal::no_action(format!(
                    "Close {:.2} above {:.2} but volume {:.0} below minimum {:.0}",
                    bar.close, threshold, bar.volume, min_volume
                )));
            }
        }

        let needed = self.params.confirmation_bars;
        let Some((above, is_confirmed)) = confirmed_closes(context, needed, |c| c > threshold) else {
            return Ok(ExecutionSignal::no_action(format!(
                "Waiting for {} confirmation bars, have {}",
                needed,
                context.historical_bars.len() + 1
            )));
        };
        if !is_confirmed {
            return Ok(ExecutionSignal::no_action(format!(
                "Only {} of {} bars closed above {:.2}",
                above, needed, threshold
            )));
        }

        let distance_pct = (bar.close - threshold) / threshold * 100.0;
        let score = ScoreBreakdown::compute(context, distance_pct, true);
        let confidence = BASE_CONFIDENCE + score.total_boost();

        let mut reasoning = format!(
            "Close {:.2} above threshold {:.2} (+{:.2}%)",
            bar.close, threshold, distance_pct
        );
        if needed > 1 {
            reasoning.push_str(&format!(", confirmed over {} bars", needed));
        }
        if let Some(ratio) = score.volume_ratio {
            reasoning.push_str(&format!(", volume {:.2}x avg", ratio));
        }

        let mut signal = ExecutionSignal::new(SignalAction::EnterLong, confidence, reasoning)
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
