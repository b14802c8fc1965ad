//! Confidence boosts shared by the threshold functions.
//!
//! Each boost is capped on its own; the caller clamps the total.

use crate::execution::ExecutionContext;
use crate::indicators::{average_volume, percent_change};

pub const VOLUME_AVERAGE_BARS: usize = 20;
pub const MOMENTUM_BARS: usize = 3;

const DISTANCE_BOOST_PER_PCT: f64 = 0.1;
const DISTANCE_BOOST_CAP: f64 = 0.15;
const VOLUME_BOOST_PER_RATIO: f64 = 0.1;
const VOLUME_BOOST_CAP: f64 = 0.1;
const MOMENTUM_BOOST_PER_PCT: f64 = 0.05;
const MOMENTUM_BOOST_CAP: f64 = 0.1;

/// Inputs behind a confidence score, kept for the audit trail
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub distance_pct: f64,
    pub volume_ratio: Option<f64>,
    pub momentum_pct: Option<f64>,
    pub distance_boost: f64,
    pub volume_boost: f64,
    pub momentum_boost: f64,
}

impl ScoreBreakdown {
    /// Score a threshold break.
    ///
    /// `distance_pct` is how far past the threshold the close is (positive);
    /// `bullish` picks which momentum direction counts.
    pub fn compute(context: &ExecutionContext, distance_pct: f64, bullish: bool) -> Self {
        let volume_ratio = average_volume(&context.historical_bars, VOLUME_AVERAGE_BARS)
            .filter(|avg| *avg > 0.0)
            .map(|avg| context.current_bar.volume / avg);
        let momentum_pct = percent_change(&context.bars_with_current(), MOMENTUM_BARS);

        let directional_momentum = momentum_pct
            .map(|m| if bullish { m } else { -m })
            .unwrap_or(0.0);

        Self {
            distance_pct,
            volume_ratio,
            momentum_pct,
            distance_boost: (distance_pct * DISTANCE_BOOST_PER_PCT).clamp(0.0, DISTANCE_BOOST_CAP),
            volume_boost: volume_ratio
                .map(|r| ((r - 1.0) * VOLUME_BOOST_PER_RATIO).clamp(0.0, VOLUME_BOOST_CAP))
                .unwrap_or(0.0),
            momentum_boost: (directional_momentum * MOMENTUM_BOOST_PER_PCT)
                .clamp(0.0, MOMENTUM_BOOST_CAP),
        }
    }

    pub fn total_boost(&self) -> f64 {
        self.distance_boost + self.volume_boost + self.momentum_boost
    }
}

/// Whether the last `bars` closes (current included) all satisfy `passes`.
///
/// Returns None when there are not enough bars to decide.
pub fn confirmed_closes(
    context: &ExecutionContext,
    bars: usize,
    passes: impl Fn(f64) -> bool,
) -> Option<(usize, bool)> {
    let closes = context.recent_closes(bars);
    if closes.len() < bars {
        return None;
    }
    let count = closes.iter().filter(|c| passes(**c)).count();
    Some((count, count == bars))
}
