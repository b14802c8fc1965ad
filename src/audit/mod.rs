// Execution audit trail: in-memory ring, durable JSONL files, metrics
pub mod entry;
pub mod file_manager;
pub mod logger;
pub mod metrics;

pub use entry::{ExecutionLogEntry, LogQuery};
pub use file_manager::LogFileManager;
pub use logger::{AuditSettings, ExecutionLogger, LoggerStats};
pub use metrics::{ExecutionMetrics, FunctionMetrics, MetricsCalculator};
