use crate::models::Bar;

/// Average volume of the last `period` bars
///
/// Uses whatever is available when history is shorter than `period`;
/// returns None for an empty slice.
pub fn average_volume(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.is_empty() || period == 0 {
        return None;
    }

    let take = period.min(bars.len());
    let sum: f64 = bars.iter().rev().take(take).map(|b| b.volume).sum();
    Some(sum / take as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::Utc;

    fn bar_with_volume(volume: f64) -> Bar {
        Bar {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::Min1,
            timestamp: Utc::now(),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume,
        }
    }

    #[test]
    fn test_average_volume_uses_latest_bars() {
        let bars: Vec<Bar> = [100.0, 200.0, 300.0, 400.0]
            .iter()
            .map(|&v| bar_with_volume(v))
            .collect();

        assert_eq!(average_volume(&bars, 2), Some(350.0));
        assert_eq!(average_volume(&bars, 20), Some(250.0));
        assert_eq!(average_volume(&[], 20), None);
    }
}
