use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExecutionLogEntry;
use crate::strategy::SignalAction;

/// Aggregate evaluation metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_evaluations: u64,
    pub successful_evaluations: u64,
    pub failed_evaluations: u64,
    pub actions_triggered: u64,
    pub success_rate: f64,

    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,

    /// Counts per signal action, failures excluded
    pub action_counts: BTreeMap<String, u64>,
    pub last_evaluation: Option<DateTime<Utc>>,
}

/// Per-function metrics, computed on demand from stored entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub evaluations: u64,
    pub errors: u64,
    pub actions_triggered: u64,
    pub avg_confidence: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
    pub last_action: Option<SignalAction>,
    pub last_evaluated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    actions_triggered: u64,
    duration_sum_ms: f64,
    duration_min_ms: Option<f64>,
    duration_max_ms: f64,
    action_counts: BTreeMap<String, u64>,
    last_evaluation: Option<DateTime<Utc>>,
}

/// Running counters, updated once per logged entry
#[derive(Debug, Default)]
pub struct MetricsCalculator {
    counters: Mutex<Counters>,
}

impl MetricsCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: &ExecutionLogEntry) {
        let mut c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        c.total += 1;
        if entry.has_error() {
            c.failed += 1;
        } else {
            c.successful += 1;
            *c.action_counts
                .entry(entry.action().as_str().to_string())
                .or_insert(0) += 1;
        }
        if entry.triggered() {
            c.actions_triggered += 1;
        }

        c.duration_sum_ms += entry.duration_ms;
        c.duration_max_ms = c.duration_max_ms.max(entry.duration_ms);
        c.duration_min_ms = Some(match c.duration_min_ms {
            Some(min) => min.min(entry.duration_ms),
            None => entry.duration_ms,
        });
        c.last_evaluation = Some(match c.last_evaluation {
            Some(last) => last.max(entry.timestamp),
            None => entry.timestamp,
        });
    }

    pub fn snapshot(&self) -> ExecutionMetrics {
        let c = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if c.total == 0 {
            return ExecutionMetrics::default();
        }

        ExecutionMetrics {
            total_evaluations: c.total,
            successful_evaluations: c.successful,
            failed_evaluations: c.failed,
            actions_triggered: c.actions_triggered,
            success_rate: c.successful as f64 / c.total as f64,
            avg_duration_ms: c.duration_sum_ms / c.total as f64,
            min_duration_ms: c.duration_min_ms.unwrap_or(0.0),
            max_duration_ms: c.duration_max_ms,
            action_counts: c.action_counts.clone(),
            last_evaluation: c.last_evaluation,
        }
    }

    pub fn reset(&self) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = Counters::default();
    }

    /// Group entries by function name
    pub fn function_breakdown(entries: &[ExecutionLogEntry]) -> BTreeMap<String, FunctionMetrics> {
        let mut grouped: BTreeMap<String, Vec<&ExecutionLogEntry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(entry.function_name.clone()).or_default().push(entry);
        }

        grouped
            .into_iter()
            .map(|(name, entries)| {
                let count = entries.len() as f64;
                let succeeded: Vec<&&ExecutionLogEntry> =
                    entries.iter().filter(|e| !e.has_error()).collect();
                let latest = entries.iter().max_by_key(|e| e.timestamp);

                let metrics = FunctionMetrics {
                    evaluations: entries.len() as u64,
                    errors: (entries.len() - succeeded.len()) as u64,
                    actions_triggered: entries.iter().filter(|e| e.triggered()).count() as u64,
                    avg_confidence: if succeeded.is_empty() {
                        0.0
                    } else {
                        succeeded.iter().map(|e| e.confidence()).sum::<f64>() / succeeded.len() as f64
                    },
                    avg_duration_ms: entries.iter().map(|e| e.duration_ms).sum::<f64>() / count,
                    max_duration_ms: entries.iter().map(|e| e.duration_ms).fold(0.0, f64::max),
                    last_action: latest.map(|e| e.action()),
                    last_evaluated: latest.map(|e| e.timestamp),
                };
                (name, metrics)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::models::{Bar, Timeframe};
    use crate::strategy::{ExecutionSignal, Metadata};

    fn context() -> ExecutionContext {
        let now = Utc::now();
        ExecutionContext {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::Min1,
            current_bar: Bar {
                symbol: "AAPL".to_string(),
                timeframe: Timeframe::Min1,
                timestamp: now,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            },
            historical_bars: Vec::new(),
            plan_parameters: Metadata::new(),
            position: None,
            account_balance: 0.0,
            timestamp: now,
            edge_cases: Vec::new(),
        }
    }

    fn entries() -> Vec<ExecutionLogEntry> {
        let ctx = context();
        vec![
            ExecutionLogEntry::success("a", &ctx, ExecutionSignal::new(SignalAction::EnterLong, 0.8, ""), 2.0),
            ExecutionLogEntry::success("a", &ctx, ExecutionSignal::no_action(""), 4.0),
            ExecutionLogEntry::failure("b", &ctx, "boom", 6.0),
        ]
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = MetricsCalculator::new().snapshot();
        assert_eq!(metrics.total_evaluations, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.min_duration_ms, 0.0);
    }

    #[test]
    fn test_running_counters() {
        let calculator = MetricsCalculator::new();
        for entry in entries() {
            calculator.record(&entry);
        }

        let metrics = calculator.snapshot();
        assert_eq!(metrics.total_evaluations, 3);
        assert_eq!(metrics.successful_evaluations, 2);
        assert_eq!(metrics.failed_evaluations, 1);
        assert_eq!(metrics.actions_triggered, 1);
        assert_eq!(metrics.avg_duration_ms, 4.0);
        assert_eq!(metrics.min_duration_ms, 2.0);
        assert_eq!(metrics.max_duration_ms, 6.0);
        assert_eq!(metrics.action_counts.get("enter_long"), Some(&1));
        assert_eq!(metrics.action_counts.get("none"), Some(&1));

        calculator.reset();
        assert_eq!(calculator.snapshot().total_evaluations, 0);
    }

    #[test]
    fn test_function_breakdown() {
        let breakdown = MetricsCalculator::function_breakdown(&entries());

        let a = &breakdown["a"];
        assert_eq!(a.evaluations, 2);
        assert_eq!(a.errors, 0);
        assert_eq!(a.actions_triggered, 1);
        assert!((a.avg_confidence - 0.4).abs() < 1e-12);
        assert_eq!(a.avg_duration_ms, 3.0);

        let b = &breakdown["b"];
        assert_eq!(b.errors, 1);
        assert_eq!(b.last_action, Some(SignalAction::None));
    }
}
