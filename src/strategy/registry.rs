//! Execution function registry
//!
//! Two maps behind one lock: function type -> factory, and instance name ->
//! live instance. Instances keep registration order, which is the order
//! functions are evaluated in at a boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use super::{CloseAboveFunction, CloseBelowFunction, ExecutionFunction, ExecutionFunctionConfig};
use crate::error::FunctionError;
use crate::models::Timeframe;

/// Builds a function instance from its config, validating it
pub type FunctionFactory =
    fn(ExecutionFunctionConfig) -> Result<Arc<dyn ExecutionFunction>, FunctionError>;

#[derive(Default)]
struct RegistryState {
    factories: HashMap<String, FunctionFactory>,
    instances: Vec<Arc<dyn ExecutionFunction>>,
}

impl RegistryState {
    fn position(&self, name: &str) -> Option<usize> {
        self.instances.iter().position(|f| f.name() == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registered_types: usize,
    pub total_functions: usize,
    pub enabled_functions: usize,
    pub by_timeframe: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

pub struct FunctionRegistry {
    state: RwLock<RegistryState>,
}

impl FunctionRegistry {
    /// Empty registry with no known types
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Registry with the built-in function types
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        for (function_type, factory) in [
            (CloseAboveFunction::TYPE, CloseAboveFunction::create as FunctionFactory),
            (CloseBelowFunction::TYPE, CloseBelowFunction::create as FunctionFactory),
        ] {
            // Fresh registry, cannot collide
            let _ = registry.register(function_type, factory, false);
        }
        registry
    }

    /// Register a function type. Fails on a duplicate unless `override_existing`.
    pub fn register(
        &self,
        function_type: &str,
        factory: FunctionFactory,
        override_existing: bool,
    ) -> Result<(), FunctionError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.factories.contains_key(function_type) {
            if !override_existing {
                return Err(FunctionError::DuplicateType(function_type.to_string()));
            }
            warn!(function_type, "Overriding registered function type");
        }

        state.factories.insert(function_type.to_string(), factory);
        info!(function_type, "Function type registered");
        Ok(())
    }

    /// Remove a function type. Existing instances keep running.
    pub fn unregister(&self, function_type: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state.factories.remove(function_type).is_some();
        if removed {
            info!(function_type, "Function type unregistered");
        }
        removed
    }

    /// Instantiate a function from config and cache it under its name
    pub fn create_function(
        &self,
        config: ExecutionFunctionConfig,
    ) -> Result<Arc<dyn ExecutionFunction>, FunctionError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.position(&config.name).is_some() {
            return Err(FunctionError::DuplicateName(config.name));
        }

        let factory = *state
            .factories
            .get(&config.function_type)
            .ok_or_else(|| FunctionError::UnknownType(config.function_type.clone()))?;

        let function = factory(config)?;
        info!(
            name = %function.name(),
            function_type = function.function_type(),
            timeframe = %function.timeframe(),
            enabled = function.is_enabled(),
            "Execution function created: {}",
            function.description()
        );
        state.instances.push(function.clone());
        Ok(function)
    }

    /// Return the instance named in `config`, creating it if needed
    pub fn get_or_create(
        &self,
        config: ExecutionFunctionConfig,
    ) -> Result<Arc<dyn ExecutionFunction>, FunctionError> {
        if let Some(existing) = self.get_function(&config.name) {
            return Ok(existing);
        }
        match self.create_function(config.clone()) {
            // Lost a race with a concurrent creator
            Err(FunctionError::DuplicateName(_)) => self
                .get_function(&config.name)
                .ok_or(FunctionError::DuplicateName(config.name)),
            other => other,
        }
    }

    pub fn remove_function(&self, name: &str) -> Option<Arc<dyn ExecutionFunction>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let index = state.position(name)?;
        let removed = state.instances.remove(index);
        info!(name, "Execution function removed");
        Some(removed)
    }

    pub fn get_function(&self, name: &str) -> Option<Arc<dyn ExecutionFunction>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.position(name).map(|i| state.instances[i].clone())
    }

    /// Instances for a timeframe, in registration order (enabled or not)
    pub fn functions_for_timeframe(&self, timeframe: Timeframe) -> Vec<Arc<dyn ExecutionFunction>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .instances
            .iter()
            .filter(|f| f.timeframe() == timeframe)
            .cloned()
            .collect()
    }

    pub fn functions_by_type(&self, function_type: &str) -> Vec<Arc<dyn ExecutionFunction>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .instances
            .iter()
            .filter(|f| f.function_type() == function_type)
            .cloned()
            .collect()
    }

    pub fn list_functions(&self) -> Vec<Arc<dyn ExecutionFunction>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.instances.clone()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = state.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_registered(&self, function_type: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.factories.contains_key(function_type)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_timeframe = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for function in &state.instances {
            *by_timeframe.entry(function.timeframe().to_string()).or_insert(0) += 1;
            *by_type.entry(function.function_type().to_string()).or_insert(0) += 1;
        }

        RegistryStats {
            registered_types: state.factories.len(),
            total_functions: state.instances.len(),
            enabled_functions: state.instances.iter().filter(|f| f.is_enabled()).count(),
            by_timeframe,
            by_type,
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::execution::ExecutionContext;
    use crate::strategy::{ExecutionSignal, Metadata};
    use async_trait::async_trait;

    struct AlwaysNone {
        config: ExecutionFunctionConfig,
    }

    #[async_trait]
    impl ExecutionFunction for AlwaysNone {
        fn config(&self) -> &ExecutionFunctionConfig {
            &self.config
        }

        fn function_type(&self) -> &'static str {
            "always_none"
        }

        fn description(&self) -> String {
            "Never acts".to_string()
        }

        fn required_parameters(&self) -> &'static [&'static str] {
            &[]
        }

        fn validate_parameters(&self, _params: &Metadata) -> bool {
            true
        }

        async fn analyze(&self, _context: &ExecutionContext) -> Result<ExecutionSignal, EvaluationError> {
            Ok(ExecutionSignal::no_action("never"))
        }
    }

    fn always_none(config: ExecutionFunctionConfig) -> Result<Arc<dyn ExecutionFunction>, FunctionError> {
        Ok(Arc::new(AlwaysNone { config }))
    }

    fn close_above(name: &str, timeframe: Timeframe) -> ExecutionFunctionConfig {
        ExecutionFunctionConfig::new(name, "close_above", timeframe).with_parameter("threshold", 100.0)
    }

    #[test]
    fn test_builtin_types() {
        let registry = FunctionRegistry::with_builtin();
        assert_eq!(registry.registered_types(), vec!["close_above", "close_below"]);
        assert!(FunctionRegistry::new().registered_types().is_empty());
    }

    #[test]
    fn test_register_duplicate_type_requires_override() {
        let registry = FunctionRegistry::with_builtin();
        assert_eq!(
            registry.register("close_above", always_none, false),
            Err(FunctionError::DuplicateType("close_above".to_string()))
        );
        assert!(registry.register("close_above", always_none, true).is_ok());

        let f = registry
            .create_function(ExecutionFunctionConfig::new("x", "close_above", Timeframe::Min1))
            .unwrap();
        assert_eq!(f.function_type(), "always_none");
    }

    #[test]
    fn test_create_function_validates_and_caches() {
        let registry = FunctionRegistry::with_builtin();

        let created = registry.create_function(close_above("a", Timeframe::Min1)).unwrap();
        assert_eq!(created.name(), "a");
        assert!(registry.get_function("a").is_some());

        assert!(matches!(
            registry.create_function(close_above("a", Timeframe::Min1)),
            Err(FunctionError::DuplicateName(_))
        ));
        assert!(matches!(
            registry.create_function(ExecutionFunctionConfig::new("b", "nope", Timeframe::Min1)),
            Err(FunctionError::UnknownType(_))
        ));
        assert!(matches!(
            registry.create_function(ExecutionFunctionConfig::new("c", "close_above", Timeframe::Min1)),
            Err(FunctionError::MissingParameter { .. })
        ));
        assert_eq!(registry.list_functions().len(), 1);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = FunctionRegistry::with_builtin();
        let first = registry.get_or_create(close_above("a", Timeframe::Min1)).unwrap();
        let second = registry.get_or_create(close_above("a", Timeframe::Min1)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list_functions().len(), 1);
    }

    #[test]
    fn test_lookup_by_timeframe_keeps_order() {
        let registry = FunctionRegistry::with_builtin();
        registry.create_function(close_above("z", Timeframe::Min1)).unwrap();
        registry.create_function(close_above("m", Timeframe::Min5)).unwrap();
        registry.create_function(close_above("a", Timeframe::Min1).disabled()).unwrap();

        let names: Vec<String> = registry
            .functions_for_timeframe(Timeframe::Min1)
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["z", "a"]);
        assert_eq!(registry.functions_by_type("close_above").len(), 3);

        let stats = registry.stats();
        assert_eq!(stats.total_functions, 3);
        assert_eq!(stats.enabled_functions, 2);
        assert_eq!(stats.by_timeframe.get("1m"), Some(&2));
    }

    #[test]
    fn test_remove_and_unregister() {
        let registry = FunctionRegistry::with_builtin();
        registry.create_function(close_above("a", Timeframe::Min1)).unwrap();

        assert!(registry.remove_function("a").is_some());
        assert!(registry.remove_function("a").is_none());
        assert!(registry.unregister("close_above"));
        assert!(!registry.is_registered("close_above"));
        assert!(!registry.unregister("close_above"));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(FunctionRegistry::with_builtin());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .get_or_create(close_above(&format!("f{}", i % 4), Timeframe::Min1))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.list_functions().len(), 4);
    }
}
