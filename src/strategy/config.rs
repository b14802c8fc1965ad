use serde::{Deserialize, Serialize};

use super::signals::Metadata;
use crate::error::FunctionError;
use crate::models::Timeframe;

/// Declarative configuration of one execution function instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFunctionConfig {
    /// Unique instance name, e.g. "close-above-181.00"
    pub name: String,
    /// Registered type key, e.g. "close_above"
    pub function_type: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub parameters: Metadata,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_lookback_bars() -> usize {
    100
}

impl ExecutionFunctionConfig {
    pub fn new(name: impl Into<String>, function_type: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            name: name.into(),
            function_type: function_type.into(),
            timeframe,
            parameters: Metadata::new(),
            enabled: default_enabled(),
            lookback_bars: default_lookback_bars(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Shape checks shared by every function type
    pub fn validate(&self) -> Result<(), FunctionError> {
        if self.name.trim().is_empty() {
            return Err(FunctionError::InvalidConfig("name must not be empty".to_string()));
        }
        if self.function_type.trim().is_empty() {
            return Err(FunctionError::InvalidConfig(format!(
                "{}: function_type must not be empty",
                self.name
            )));
        }
        if self.lookback_bars == 0 {
            return Err(FunctionError::InvalidConfig(format!(
                "{}: lookback_bars must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub fn params(&self) -> Params<'_> {
        Params {
            function: &self.name,
            values: &self.parameters,
        }
    }
}

/// Typed accessors over a parameter map, producing construction-time errors
pub struct Params<'a> {
    function: &'a str,
    values: &'a Metadata,
}

impl<'a> Params<'a> {
    pub fn over(function: &'a str, values: &'a Metadata) -> Self {
        Self { function, values }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, FunctionError> {
        self.f64(key)?.ok_or_else(|| FunctionError::MissingParameter {
            function: self.function.to_string(),
            parameter: key.to_string(),
        })
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>, FunctionError> {
        match self.values.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .filter(|v: &f64| v.is_finite())
                .map(Some)
                .ok_or_else(|| self.invalid(key, "expected a number")),
        }
    }

    pub fn usize(&self, key: &str) -> Result<Option<usize>, FunctionError> {
        match self.values.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(|v| Some(v as usize))
                .ok_or_else(|| self.invalid(key, "expected a non-negative integer")),
        }
    }

    pub fn str(&self, key: &str) -> Result<Option<&'a str>, FunctionError> {
        match self.values.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "expected a string")),
        }
    }

    pub fn invalid(&self, key: &str, reason: impl Into<String>) -> FunctionError {
        FunctionError::InvalidParameter {
            function: self.function.to_string(),
            parameter: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: ExecutionFunctionConfig = serde_json::from_str(
            r#"{"name": "close-above-181", "function_type": "close_above", "timeframe": "1m",
                "parameters": {"threshold": 181.0}}"#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.lookback_bars, 100);
        assert_eq!(config.timeframe, Timeframe::Min1);
        assert_eq!(config.params().require_f64("threshold").unwrap(), 181.0);
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let config = ExecutionFunctionConfig::new("", "close_above", Timeframe::Min1);
        assert!(matches!(config.validate(), Err(FunctionError::InvalidConfig(_))));
    }

    #[test]
    fn test_params_accessors() {
        let config = ExecutionFunctionConfig::new("f", "close_above", Timeframe::Min5)
            .with_parameter("threshold", "180.5")
            .with_parameter("confirmation_bars", 3)
            .with_parameter("action", "exit")
            .with_parameter("bad", "abc");
        let params = config.params();

        assert_eq!(params.require_f64("threshold").unwrap(), 180.5);
        assert_eq!(params.usize("confirmation_bars").unwrap(), Some(3));
        assert_eq!(params.str("action").unwrap(), Some("exit"));
        assert!(params.f64("bad").is_err());
        assert!(matches!(
            params.require_f64("missing"),
            Err(FunctionError::MissingParameter { .. })
        ));
    }
}
