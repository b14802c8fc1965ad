// Core modules
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod strategy;
pub mod validation;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{EngineHealth, EngineOptions, ExecutionEngine};
pub use models::*;
pub use strategy::{ExecutionFunction, ExecutionSignal, SignalAction};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
