use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// One symbol's daily aggregate for one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
}

impl DailyBar {
    /// Traded value for the day (close * volume).
    pub fn dollar_volume(&self) -> f64 {
        self.close * self.volume
    }
}

/// Latest-day view of a tradable symbol from the universe snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseEntry {
    pub symbol: String,
    pub close: f64,
    pub volume: f64,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, returning `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Extend the start backwards far enough to cover `lookback` trading days.
    ///
    /// Weekends are skipped; holidays are not known here, so a small buffer
    /// of extra calendar days is added on top. Returns `None` when the start
    /// would fall outside the representable calendar.
    pub fn with_lookback(&self, lookback: usize) -> Option<Self> {
        if lookback == 0 {
            return Some(*self);
        }
        // Any seven consecutive days hold exactly five weekdays.
        let weeks = i64::try_from(lookback / 5).ok()?;
        let mut start = self
            .start
            .checked_sub_signed(Duration::try_weeks(weeks)?)?;
        let mut remaining = lookback % 5;
        while remaining > 0 {
            start = start.pred_opt()?;
            if is_trading_weekday(start) {
                remaining -= 1;
            }
        }
        Some(Self {
            start: start.checked_sub_signed(Duration::days(HOLIDAY_BUFFER_DAYS))?,
            end: self.end,
        })
    }

    /// Weekdays in the range, oldest first.
    pub fn trading_days(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .filter(|d| is_trading_weekday(*d))
            .collect()
    }
}

/// Extra calendar days added to history windows to absorb market holidays.
const HOLIDAY_BUFFER_DAYS: i64 = 7;

fn is_trading_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}
