use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::Bar;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Tolerated distance of a bar's close time ahead of the local clock
    pub max_clock_skew_secs: i64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 120,
        }
    }
}

/// Validates incoming bars for sanity before they are stored
#[derive(Debug, Clone, Default)]
pub struct BarValidator {
    settings: ValidationSettings,
}

impl BarValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    /// Validate a bar in isolation, and against the last stored timestamp for its key
    ///
    /// `now` comes from the engine's clock so that future-timestamp checks
    /// agree with boundary detection.
    pub fn validate(
        &self,
        bar: &Bar,
        last_stored: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if bar.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        self.validate_prices(bar)?;
        self.validate_ohlc_relationship(bar)?;
        self.validate_timestamp(bar, last_stored, now)?;
        Ok(())
    }

    fn validate_prices(&self, bar: &Bar) -> Result<(), ValidationError> {
        for (field, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            // NaN fails the `> 0` test too
            if !(value > 0.0) || !value.is_finite() {
                return Err(ValidationError::InvalidPrice { field, value });
            }
        }
        // Zero volume is fine (halted or illiquid bars)
        if !(bar.volume >= 0.0) || !bar.volume.is_finite() {
            return Err(ValidationError::InvalidVolume(bar.volume));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, bar: &Bar) -> Result<(), ValidationError> {
        if bar.high < bar.low {
            return Err(ValidationError::HighBelow {
                field: "low",
                high: bar.high,
                value: bar.low,
            });
        }
        if bar.high < bar.open {
            return Err(ValidationError::HighBelow {
                field: "open",
                high: bar.high,
                value: bar.open,
            });
        }
        if bar.high < bar.close {
            return Err(ValidationError::HighBelow {
                field: "close",
                high: bar.high,
                value: bar.close,
            });
        }
        if bar.low > bar.open {
            return Err(ValidationError::LowAbove {
                field: "open",
                low: bar.low,
                value: bar.open,
            });
        }
        if bar.low > bar.close {
            return Err(ValidationError::LowAbove {
                field: "close",
                low: bar.low,
                value: bar.close,
            });
        }
        Ok(())
    }

    fn validate_timestamp(
        &self,
        bar: &Bar,
        last_stored: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if bar.timestamp > now + Duration::seconds(self.settings.max_clock_skew_secs) {
            return Err(ValidationError::FutureTimestamp {
                timestamp: bar.timestamp,
                now,
            });
        }

        // Equal timestamps are redeliveries and get replaced downstream
        if let Some(last) = last_stored {
            if bar.timestamp < last {
                return Err(ValidationError::NonMonotonic {
                    key: format!("{}/{}", bar.symbol, bar.timeframe),
                    timestamp: bar.timestamp,
                    last,
                });
            }
        }
        Ok(())
    }
}
