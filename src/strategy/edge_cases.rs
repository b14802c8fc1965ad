//! Edge case detection for one bar against its history
//!
//! Flags conditions that should change how much a signal is trusted:
//! - Data quality: non-positive prices, broken OHLC, thin volume
//! - Gaps: open far away from the prior close
//! - Limit-like moves: close far away from the reference close
//! - Volume anomalies vs. the 20-bar average (spike or dry-up)
//!
//! Detection is pure; aggregation into a confidence multiplier lives in
//! [`ConfidenceAdjustment`].

use serde::{Deserialize, Serialize};

use crate::indicators::average_volume;
use crate::models::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCaseType {
    InvalidPrice,
    InvalidOhlc,
    LowVolume,
    GapUp,
    GapDown,
    LimitMove,
    VolumeSpike,
    VolumeDryUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    ReduceConfidence,
    IncreaseConfidence,
    SkipEvaluation,
}

/// One anomaly finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCaseResult {
    pub case_type: EdgeCaseType,
    pub severity: Severity,
    pub description: String,
    pub recommended_action: RecommendedAction,
}

impl EdgeCaseResult {
    fn new(
        case_type: EdgeCaseType,
        severity: Severity,
        recommended_action: RecommendedAction,
        description: String,
    ) -> Self {
        Self {
            case_type,
            severity,
            description,
            recommended_action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeCaseConfig {
    pub min_volume: f64,
    pub gap_threshold_pct: f64,
    pub limit_move_pct: f64,
    pub volume_lookback: usize,
    pub volume_spike_multiplier: f64,
    pub volume_dry_up_ratio: f64,
}

impl Default for EdgeCaseConfig {
    fn default() -> Self {
        Self {
            min_volume: 0.0,
            gap_threshold_pct: 2.0,
            limit_move_pct: 10.0,
            volume_lookback: 20,
            volume_spike_multiplier: 3.0,
            volume_dry_up_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeCaseDetector {
    config: EdgeCaseConfig,
}

impl EdgeCaseDetector {
    pub fn new(config: EdgeCaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EdgeCaseConfig {
        &self.config
    }

    /// Run every check of `bar` against `history` (oldest first, not including `bar`)
    pub fn detect_all(&self, bar: &Bar, history: &[Bar]) -> Vec<EdgeCaseResult> {
        let mut results = self.detect_data_quality(bar);

        // Broken data makes the relative checks meaningless
        if results
            .iter()
            .any(|r| r.recommended_action == RecommendedAction::SkipEvaluation)
        {
            return results;
        }

        if let Some(prior) = history.last() {
            results.extend(self.detect_gap(bar, prior));
            results.extend(self.detect_limit_move(bar, prior.close));
        }
        results.extend(self.detect_volume_anomaly(bar, history));
        results
    }

    pub fn detect_data_quality(&self, bar: &Bar) -> Vec<EdgeCaseResult> {
        let mut results = Vec::new();

        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !(*p > 0.0)) {
            results.push(EdgeCaseResult::new(
                EdgeCaseType::InvalidPrice,
                Severity::Critical,
                RecommendedAction::SkipEvaluation,
                format!(
                    "Non-positive price in bar (O={} H={} L={} C={})",
                    bar.open, bar.high, bar.low, bar.close
                ),
            ));
            return results;
        }

        let inverted = bar.high < bar.low;
        let out_of_range = bar.open > bar.high
            || bar.open < bar.low
            || bar.close > bar.high
            || bar.close < bar.low;
        if inverted || out_of_range {
            results.push(EdgeCaseResult::new(
                EdgeCaseType::InvalidOhlc,
                Severity::Critical,
                RecommendedAction::SkipEvaluation,
                format!(
                    "Inconsistent OHLC (O={} H={} L={} C={})",
                    bar.open, bar.high, bar.low, bar.close
                ),
            ));
        }

        if bar.volume < self.config.min_volume {
            results.push(EdgeCaseResult::new(
                EdgeCaseType::LowVolume,
                Severity::Medium,
                RecommendedAction::ReduceConfidence,
                format!(
                    "Volume {:.0} below minimum {:.0}",
                    bar.volume, self.config.min_volume
                ),
            ));
        }

        results
    }

    pub fn detect_gap(&self, bar: &Bar, prior: &Bar) -> Option<EdgeCaseResult> {
        if prior.close <= 0.0 {
            return None;
        }
        let gap_pct = (bar.open - prior.close) / prior.close * 100.0;
        if gap_pct.abs() <= self.config.gap_threshold_pct {
            return None;
        }

        let case_type = if gap_pct > 0.0 {
            EdgeCaseType::GapUp
        } else {
            EdgeCaseType::GapDown
        };
        let severity = if gap_pct.abs() > self.config.gap_threshold_pct * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };

        Some(EdgeCaseResult::new(
            case_type,
            severity,
            RecommendedAction::ReduceConfidence,
            format!(
                "Opened {:+.2}% vs prior close {:.2} (threshold {:.2}%)",
                gap_pct, prior.close, self.config.gap_threshold_pct
            ),
        ))
    }

    pub fn detect_limit_move(&self, bar: &Bar, reference_close: f64) -> Option<EdgeCaseResult> {
        if reference_close <= 0.0 {
            return None;
        }
        let move_pct = (bar.close - reference_close) / reference_close * 100.0;
        if move_pct.abs() <= self.config.limit_move_pct {
            return None;
        }

        Some(EdgeCaseResult::new(
            EdgeCaseType::LimitMove,
            Severity::Critical,
            RecommendedAction::SkipEvaluation,
            format!(
                "Limit-like move {:+.2}% vs reference close {:.2} (limit {:.2}%)",
                move_pct, reference_close, self.config.limit_move_pct
            ),
        ))
    }

    pub fn detect_volume_anomaly(&self, bar: &Bar, history: &[Bar]) -> Option<EdgeCaseResult> {
        let avg = average_volume(history, self.config.volume_lookback)?;
        if avg <= 0.0 {
            return None;
        }
        let ratio = bar.volume / avg;

        if ratio > self.config.volume_spike_multiplier {
            Some(EdgeCaseResult::new(
                EdgeCaseType::VolumeSpike,
                Severity::Low,
                RecommendedAction::IncreaseConfidence,
                format!("Volume spike {:.2}x the {}-bar average", ratio, self.config.volume_lookback),
            ))
        } else if ratio < self.config.volume_dry_up_ratio {
            Some(EdgeCaseResult::new(
                EdgeCaseType::VolumeDryUp,
                Severity::Medium,
                RecommendedAction::ReduceConfidence,
                format!("Volume dried up to {:.2}x the {}-bar average", ratio, self.config.volume_lookback),
            ))
        } else {
            None
        }
    }
}

/// Combined effect of a set of findings on signal confidence
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceAdjustment {
    pub multiplier: f64,
    pub skip: bool,
    pub reasons: Vec<String>,
}

impl ConfidenceAdjustment {
    pub fn from_results(results: &[EdgeCaseResult]) -> Self {
        let reasons: Vec<String> = results.iter().map(|r| r.description.clone()).collect();

        if results
            .iter()
            .any(|r| r.recommended_action == RecommendedAction::SkipEvaluation)
        {
            return Self {
                multiplier: 0.0,
                skip: true,
                reasons,
            };
        }

        let multiplier = results.iter().fold(1.0, |acc, r| match r.recommended_action {
            RecommendedAction::ReduceConfidence => acc * reduction_factor(r.severity),
            RecommendedAction::IncreaseConfidence => acc * 1.2,
            RecommendedAction::Continue | RecommendedAction::SkipEvaluation => acc,
        });

        Self {
            multiplier,
            skip: false,
            reasons,
        }
    }
}

fn reduction_factor(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.9,
        Severity::Medium => 0.7,
        Severity::High | Severity::Critical => 0.5,
    }
}
