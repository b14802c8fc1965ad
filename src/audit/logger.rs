use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{ExecutionLogEntry, ExecutionMetrics, FunctionMetrics, LogFileManager, LogQuery, MetricsCalculator};
use crate::error::AuditError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Entries kept in memory
    pub memory_capacity: usize,
    /// Directory for durable files; memory-only when unset
    pub log_dir: Option<PathBuf>,
    pub max_entries_per_file: usize,
    pub max_log_files: usize,
    pub retention_days: Option<u32>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            log_dir: None,
            max_entries_per_file: 10_000,
            max_log_files: 10,
            retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggerStats {
    pub entries_in_memory: usize,
    pub memory_capacity: usize,
    pub durable: bool,
    /// A durable write failed and the logger fell back to memory only
    pub degraded: bool,
    pub write_failures: u64,
    pub current_file: Option<PathBuf>,
    pub metrics: ExecutionMetrics,
}

/// Audit trail of every evaluation attempt
///
/// Memory and metrics always succeed. Durable writes are best effort: the
/// first failure switches the logger to memory-only for the rest of the run.
pub struct ExecutionLogger {
    entries: Mutex<VecDeque<ExecutionLogEntry>>,
    capacity: usize,
    files: Option<Mutex<LogFileManager>>,
    degraded: AtomicBool,
    write_failures: AtomicU64,
    metrics: MetricsCalculator,
}

impl ExecutionLogger {
    /// Memory-only logger
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            files: None,
            degraded: AtomicBool::new(false),
            write_failures: AtomicU64::new(0),
            metrics: MetricsCalculator::new(),
        }
    }

    /// Logger per settings. A log directory that cannot be created leaves the
    /// logger memory-only and degraded.
    pub fn new(settings: &AuditSettings) -> Self {
        let mut logger = Self::in_memory(settings.memory_capacity);
        let Some(dir) = &settings.log_dir else {
            return logger;
        };

        match LogFileManager::new(
            dir,
            settings.max_entries_per_file,
            settings.max_log_files,
            settings.retention_days,
        ) {
            Ok(files) => {
                info!(dir = %dir.display(), "Durable audit logging enabled");
                logger.files = Some(Mutex::new(files));
            }
            Err(e) => {
                error!(dir = %dir.display(), "Audit directory unavailable, logging to memory only: {}", e);
                logger.degraded.store(true, Ordering::Relaxed);
                logger.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        logger
    }

    /// Record one entry. Never fails.
    pub fn log(&self, entry: ExecutionLogEntry) {
        self.metrics.record(&entry);

        if let Some(files) = &self.files {
            if !self.degraded.load(Ordering::Relaxed) {
                let mut files = files.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = files.append(&entry) {
                    self.mark_degraded(&e);
                }
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    fn mark_degraded(&self, e: &AuditError) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            error!("Audit file write failed, continuing in memory only: {}", e);
        }
    }

    /// Matching in-memory entries, most recent first
    pub fn query(&self, query: &LogQuery) -> Vec<ExecutionLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit)
            .cloned()
            .collect()
    }

    /// Matching entries from the durable files, most recent first.
    /// Corrupt lines and unreadable files are skipped.
    pub fn query_durable(&self, query: &LogQuery) -> Vec<ExecutionLogEntry> {
        let Some(files) = &self.files else {
            return Vec::new();
        };
        let paths = {
            let files = files.lock().unwrap_or_else(PoisonError::into_inner);
            match files.list_files() {
                Ok(paths) => paths,
                Err(e) => {
                    warn!("Failed to list audit files: {}", e);
                    return Vec::new();
                }
            }
        };

        let mut results = Vec::new();
        for path in paths.iter().rev() {
            let entries = match LogFileManager::read_entries(path) {
                Ok((entries, _)) => entries,
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable audit file: {}", e);
                    continue;
                }
            };
            for entry in entries.into_iter().rev() {
                if query.matches(&entry) {
                    results.push(entry);
                    if results.len() >= query.limit {
                        return results;
                    }
                }
            }
        }
        results
    }

    pub fn recent(&self, n: usize) -> Vec<ExecutionLogEntry> {
        self.query(&LogQuery::new().limit(n))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.snapshot()
    }

    /// Per-function metrics over the in-memory entries
    pub fn function_breakdown(&self) -> BTreeMap<String, FunctionMetrics> {
        let entries: Vec<ExecutionLogEntry> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.iter().cloned().collect()
        };
        MetricsCalculator::function_breakdown(&entries)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LoggerStats {
        let current_file = self.files.as_ref().and_then(|files| {
            let files = files.lock().unwrap_or_else(PoisonError::into_inner);
            files.current_path().map(|p| p.to_path_buf())
        });
        LoggerStats {
            entries_in_memory: self.len(),
            memory_capacity: self.capacity,
            durable: self.files.is_some() && !self.is_degraded(),
            degraded: self.is_degraded(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            current_file,
            metrics: self.metrics(),
        }
    }

    /// Drop in-memory entries and counters. Durable files are untouched.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.metrics.reset();
    }
}
