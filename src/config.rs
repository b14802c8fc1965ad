//! Runtime settings.
//!
//! Sources, later ones winning: built-in defaults, an optional config file
//! (TOML, YAML or JSON by extension), then `CLOSEBOT_*` environment
//! variables with `__` between nested keys, e.g.
//! `CLOSEBOT_AUDIT__MAX_LOG_FILES=5`.

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::audit::AuditSettings;
use crate::execution::detector::ScheduleSettings;
use crate::execution::handler::HandlerSettings;
use crate::models::Timeframe;
use crate::strategy::edge_cases::EdgeCaseConfig;
use crate::strategy::{ExecutionFunctionConfig, Metadata};
use crate::validation::ValidationSettings;

pub const ENV_PREFIX: &str = "CLOSEBOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Bars (closing bar included) required before a boundary is evaluated
    pub min_bars_for_execution: usize,
    pub max_history_bars: usize,
    /// Copied into every execution context
    pub plan_parameters: Metadata,
    /// Balance used when no account provider is attached
    pub account_balance: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_bars_for_execution: 20,
            max_history_bars: 500,
            plan_parameters: Metadata::new(),
            account_balance: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub schedule: ScheduleSettings,
    pub validation: ValidationSettings,
    pub edge_cases: EdgeCaseConfig,
    pub audit: AuditSettings,
    pub handler: HandlerSettings,
    pub monitors: Vec<MonitorTarget>,
    pub functions: Vec<ExecutionFunctionConfig>,
}

impl Settings {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.min_bars_for_execution == 0 {
            return Err("engine.min_bars_for_execution must be at least 1".into());
        }
        if self.engine.max_history_bars < self.engine.min_bars_for_execution {
            return Err(format!(
                "engine.max_history_bars ({}) is below min_bars_for_execution ({})",
                self.engine.max_history_bars, self.engine.min_bars_for_execution
            )
            .into());
        }
        if self.audit.memory_capacity == 0 {
            return Err("audit.memory_capacity must be at least 1".into());
        }
        for monitor in &self.monitors {
            if monitor.symbol.trim().is_empty() {
                return Err("monitor with empty symbol".into());
            }
        }
        Ok(())
    }
}
