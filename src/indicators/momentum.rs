use crate::models::Bar;

/// Percent change of the close over the last `lookback` bars
///
/// Compares the final bar's close with the close `lookback` bars earlier.
pub fn percent_change(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() <= lookback {
        return None;
    }

    let last = bars.last()?.close;
    let base = bars[bars.len() - 1 - lookback].close;
    if base <= 0.0 {
        return None;
    }
    Some((last - base) / base * 100.0)
}
