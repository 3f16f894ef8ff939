//! Stage-2 reduction of fetched rows by cheap numeric predicates.
//!
//! Only rows dated inside the D0 range are candidates. Earlier rows are
//! trailing context for the rolling-average predicates and never appear in
//! the output.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::FilterError;
use crate::types::{DailyBar, DateRange, Thresholds};

/// Row counts around one filter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub candidates_in: usize,
    pub rows_out: usize,
    pub symbols_out: usize,
}

impl FilterStats {
    /// Share of candidate rows removed, in percent.
    pub fn reduction_pct(&self) -> f64 {
        if self.candidates_in == 0 {
            return 0.0;
        }
        (1.0 - self.rows_out as f64 / self.candidates_in as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SmartFilter;

impl SmartFilter {
    pub fn new() -> Self {
        Self
    }

    /// Keep the D0 rows that satisfy every supplied predicate.
    ///
    /// Output is a subset of `rows`, ordered by symbol then date, and is a
    /// pure function of the inputs. A malformed D0 row is an error; a
    /// malformed history row is left out of the averages. Averages use the `avg_window` rows ending
    /// at the candidate row, or fewer when less history is available.
    pub fn apply(
        &self,
        rows: &[DailyBar],
        thresholds: &Thresholds,
        d0: &DateRange,
    ) -> Result<Vec<DailyBar>, FilterError> {
        let mut by_symbol: BTreeMap<&str, Vec<&DailyBar>> = BTreeMap::new();
        for row in rows {
            if d0.contains(row.date) {
                validate_row(row)?;
            } else if validate_row(row).is_err() {
                // A bad history row only drops out of the trailing averages.
                debug!(symbol = %row.symbol, date = %row.date, "Skipping malformed history row");
                continue;
            }
            by_symbol.entry(row.symbol.as_str()).or_default().push(row);
        }

        let window = thresholds.avg_window.max(1);
        let mut out = Vec::new();

        for (_, mut series) in by_symbol {
            series.sort_by_key(|r| r.date);

            // Prefix sums: prefix[i] is the sum over series[..i].
            let mut volume_prefix = Vec::with_capacity(series.len() + 1);
            let mut dollar_prefix = Vec::with_capacity(series.len() + 1);
            volume_prefix.push(0.0);
            dollar_prefix.push(0.0);
            for row in &series {
                volume_prefix.push(volume_prefix[volume_prefix.len() - 1] + row.volume);
                dollar_prefix.push(dollar_prefix[dollar_prefix.len() - 1] + row.dollar_volume());
            }

            for (i, row) in series.iter().enumerate() {
                if !d0.contains(row.date) {
                    continue;
                }
                let from = (i + 1).saturating_sub(window);
                let n = (i + 1 - from) as f64;
                let avg_volume = (volume_prefix[i + 1] - volume_prefix[from]) / n;
                let avg_dollar = (dollar_prefix[i + 1] - dollar_prefix[from]) / n;

                if passes(row, thresholds, avg_volume, avg_dollar) {
                    out.push((*row).clone());
                }
            }
        }

        Ok(out)
    }

    /// Summarize a pass for logging and stage results.
    pub fn stats(rows: &[DailyBar], d0: &DateRange, output: &[DailyBar]) -> FilterStats {
        let mut symbols: Vec<&str> = output.iter().map(|r| r.symbol.as_str()).collect();
        symbols.dedup();
        FilterStats {
            candidates_in: rows.iter().filter(|r| d0.contains(r.date)).count(),
            rows_out: output.len(),
            symbols_out: symbols.len(),
        }
    }
}

fn passes(row: &DailyBar, t: &Thresholds, avg_volume: f64, avg_dollar: f64) -> bool {
    t.min_price.map_or(true, |min| row.close >= min)
        && t.max_price.map_or(true, |max| row.close <= max)
        && t.min_volume.map_or(true, |min| row.volume >= min)
        && t.min_dollar_volume.map_or(true, |min| row.dollar_volume() >= min)
        && t.min_avg_volume.map_or(true, |min| avg_volume >= min)
        && t.min_avg_dollar_volume.map_or(true, |min| avg_dollar >= min)
        && (!t.require_up_day || row.close > row.open)
}

fn validate_row(row: &DailyBar) -> Result<(), FilterError> {
    let fields = [
        ("open", row.open),
        ("high", row.high),
        ("low", row.low),
        ("close", row.close),
        ("volume", row.volume),
    ];
    for (field, value) in fields {
        if !value.is_finite() || value < 0.0 {
            return Err(FilterError::MalformedRow {
                symbol: row.symbol.clone(),
                date: row.date,
                field,
            });
        }
    }
    Ok(())
}
