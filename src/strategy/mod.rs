// Execution function framework
pub mod close_above;
pub mod close_below;
pub mod config;
pub mod edge_cases;
pub mod registry;
pub mod scoring;
pub mod signals;

use async_trait::async_trait;

use crate::error::{EvaluationError, FunctionError};
use crate::execution::ExecutionContext;
use crate::models::Timeframe;

pub use close_above::CloseAboveFunction;
pub use close_below::CloseBelowFunction;
pub use config::ExecutionFunctionConfig;
pub use edge_cases::{ConfidenceAdjustment, EdgeCaseDetector, EdgeCaseResult};
pub use registry::FunctionRegistry;
pub use signals::{ExecutionSignal, Metadata, SignalAction};

/// Base trait for all execution functions
///
/// Implementations are stateless with respect to evaluation: everything they
/// need is in the context or in the config they were built from. Bad
/// configuration is rejected when the function is constructed.
#[async_trait]
pub trait ExecutionFunction: Send + Sync {
    fn config(&self) -> &ExecutionFunctionConfig;

    /// Registered type key
    fn function_type(&self) -> &'static str;

    fn description(&self) -> String;

    fn required_parameters(&self) -> &'static [&'static str];

    /// Check a parameter map against this function's rules
    fn validate_parameters(&self, params: &Metadata) -> bool;

    /// Function-specific decision logic
    async fn analyze(&self, context: &ExecutionContext) -> Result<ExecutionSignal, EvaluationError>;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn timeframe(&self) -> Timeframe {
        self.config().timeframe
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// Evaluate a context, applying edge-case confidence adjustments
    ///
    /// A skip-type edge case yields no action without running `analyze`.
    async fn evaluate(&self, context: &ExecutionContext) -> Result<ExecutionSignal, EvaluationError> {
        let adjustment = ConfidenceAdjustment::from_results(&context.edge_cases);
        if adjustment.skip {
            tracing::debug!(
                function = %self.name(),
                symbol = %context.symbol,
                "Edge case forced skip: {}",
                adjustment.reasons.join("; ")
            );
            return Ok(ExecutionSignal::no_action(format!(
                "Evaluation skipped due to edge case: {}",
                adjustment.reasons.join("; ")
            ))
            .with_metadata("edge_case_multiplier", 0.0));
        }

        let signal = self.analyze(context).await?;
        if adjustment.multiplier == 1.0 {
            return Ok(signal);
        }

        Ok(signal
            .scaled(adjustment.multiplier)
            .with_metadata("edge_case_multiplier", adjustment.multiplier))
    }
}

/// Check the required keys and the function's own rules; used by constructors
pub(crate) fn check_parameters(
    config: &ExecutionFunctionConfig,
    required: &[&str],
    valid: impl FnOnce(&ExecutionFunctionConfig) -> Result<(), FunctionError>,
) -> Result<(), FunctionError> {
    config.validate()?;
    for key in required {
        if !config.parameters.contains_key(*key) {
            return Err(FunctionError::MissingParameter {
                function: config.name.clone(),
                parameter: (*key).to_string(),
            });
        }
    }
    valid(config)
}
