//! Built-in pattern detectors.

use std::collections::BTreeMap;

use super::{Detector, DetectorParams};
use crate::error::DetectionError;
use crate::types::{DailyBar, Signal};

/// Trailing window used for `relVolume` on detectors without their own.
const REL_VOLUME_WINDOW: usize = 20;

/// Longest trailing window a detector parameter may request, in trading days.
pub const MAX_WINDOW_DAYS: f64 = 1_000.0;

fn make_signal(symbol: &str, bar: &DailyBar, score: f64, fields: &[(&str, f64)]) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        date: bar.date,
        fields: fields
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
        score,
    }
}

/// Mean of `f` over `rows`, `None` when empty.
fn mean_of(rows: &[DailyBar], f: impl Fn(&DailyBar) -> f64) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    Some(rows.iter().map(f).sum::<f64>() / rows.len() as f64)
}

/// Volume relative to the average of up to `window` bars before `i`.
fn relative_volume(rows: &[DailyBar], i: usize, window: usize) -> f64 {
    let from = i.saturating_sub(window);
    match mean_of(&rows[from..i], |r| r.volume) {
        Some(avg) if avg > 0.0 => rows[i].volume / avg,
        _ => 0.0,
    }
}

fn positive_param(params: &BTreeMap<String, f64>, key: &str) -> Result<(), String> {
    match params.get(key) {
        Some(v) if !v.is_finite() || *v <= 0.0 => Err(format!("{key} must be positive")),
        _ => Ok(()),
    }
}

fn window_param(params: &BTreeMap<String, f64>, key: &str) -> Result<(), String> {
    positive_param(params, key)?;
    match params.get(key) {
        Some(v) if *v > MAX_WINDOW_DAYS => {
            Err(format!("{key} must not exceed {MAX_WINDOW_DAYS} trading days"))
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Gap up
// ============================================================================

/// Open gaps above the prior close by at least `minGapPct` percent.
pub struct GapUp;

impl GapUp {
    const DEFAULT_MIN_GAP_PCT: f64 = 4.0;
}

impl Detector for GapUp {
    fn name(&self) -> &str {
        "gap_up"
    }

    fn description(&self) -> &str {
        "Open gaps above the prior close by at least minGapPct percent (default 4.0)"
    }

    fn lookback_days(&self, _params: &BTreeMap<String, f64>) -> usize {
        REL_VOLUME_WINDOW + 1
    }

    fn validate_params(&self, params: &BTreeMap<String, f64>) -> Result<(), String> {
        positive_param(params, "minGapPct")
    }

    fn detect(
        &self,
        symbol: &str,
        rows: &[DailyBar],
        params: &DetectorParams,
    ) -> Result<Vec<Signal>, DetectionError> {
        if rows.len() < 2 {
            return Err(DetectionError::InsufficientData {
                needed: 2,
                got: rows.len(),
            });
        }
        let min_gap = params.get("minGapPct", Self::DEFAULT_MIN_GAP_PCT);

        let mut signals = Vec::new();
        for i in 1..rows.len() {
            let bar = &rows[i];
            if !params.is_candidate(bar.date) {
                continue;
            }
            let prev_close = rows[i - 1].close;
            if prev_close <= 0.0 {
                continue;
            }
            let gap_pct = (bar.open - prev_close) / prev_close * 100.0;
            if gap_pct >= min_gap {
                signals.push(make_signal(
                    symbol,
                    bar,
                    gap_pct,
                    &[
                        ("gapPct", gap_pct),
                        ("prevClose", prev_close),
                        ("relVolume", relative_volume(rows, i, REL_VOLUME_WINDOW)),
                    ],
                ));
            }
        }
        Ok(signals)
    }
}

// ============================================================================
// Volume spike
// ============================================================================

/// Volume at least `minRatio` times its trailing `lookback`-day average.
pub struct VolumeSpike;

impl VolumeSpike {
    const DEFAULT_LOOKBACK: f64 = 20.0;
    const DEFAULT_MIN_RATIO: f64 = 3.0;

    fn lookback(params: &BTreeMap<String, f64>) -> usize {
        params
            .get("lookback")
            .copied()
            .unwrap_or(Self::DEFAULT_LOOKBACK)
            .max(1.0) as usize
    }
}

impl Detector for VolumeSpike {
    fn name(&self) -> &str {
        "volume_spike"
    }

    fn description(&self) -> &str {
        "Volume at least minRatio (default 3.0) times the trailing lookback-day average (default 20)"
    }

    fn lookback_days(&self, params: &BTreeMap<String, f64>) -> usize {
        Self::lookback(params)
    }

    fn validate_params(&self, params: &BTreeMap<String, f64>) -> Result<(), String> {
        window_param(params, "lookback")?;
        positive_param(params, "minRatio")
    }

    fn detect(
        &self,
        symbol: &str,
        rows: &[DailyBar],
        params: &DetectorParams,
    ) -> Result<Vec<Signal>, DetectionError> {
        let lookback = Self::lookback(&params.values);
        let min_ratio = params.get("minRatio", Self::DEFAULT_MIN_RATIO);

        let mut evaluated = 0;
        let mut signals = Vec::new();
        for i in lookback..rows.len() {
            let bar = &rows[i];
            if !params.is_candidate(bar.date) {
                continue;
            }
            evaluated += 1;
            let Some(avg) = mean_of(&rows[i - lookback..i], |r| r.volume) else {
                continue;
            };
            if avg <= 0.0 {
                continue;
            }
            let ratio = bar.volume / avg;
            if ratio >= min_ratio {
                signals.push(make_signal(
                    symbol,
                    bar,
                    ratio,
                    &[("relVolume", ratio), ("avgVolume", avg)],
                ));
            }
        }

        if evaluated == 0 && !params.candidate_dates.is_empty() {
            return Err(DetectionError::InsufficientData {
                needed: lookback + 1,
                got: rows.len(),
            });
        }
        Ok(signals)
    }
}

// ============================================================================
// Moving-average cross
// ============================================================================

/// Close crosses above its `period`-day SMA from at or below on the prior bar.
pub struct MaCross;

impl MaCross {
    const DEFAULT_PERIOD: f64 = 50.0;

    fn period(params: &BTreeMap<String, f64>) -> usize {
        params
            .get("period")
            .copied()
            .unwrap_or(Self::DEFAULT_PERIOD)
            .max(1.0) as usize
    }

    /// SMA of closes over the `period` bars ending at `i`.
    fn sma_at(rows: &[DailyBar], i: usize, period: usize) -> Option<f64> {
        if i + 1 < period {
            return None;
        }
        mean_of(&rows[i + 1 - period..=i], |r| r.close)
    }
}

impl Detector for MaCross {
    fn name(&self) -> &str {
        "ma_cross"
    }

    fn description(&self) -> &str {
        "Close crosses above its period-day simple moving average (default 50)"
    }

    fn lookback_days(&self, params: &BTreeMap<String, f64>) -> usize {
        Self::period(params) + 1
    }

    fn validate_params(&self, params: &BTreeMap<String, f64>) -> Result<(), String> {
        window_param(params, "period")
    }

    fn detect(
        &self,
        symbol: &str,
        rows: &[DailyBar],
        params: &DetectorParams,
    ) -> Result<Vec<Signal>, DetectionError> {
        let period = Self::period(&params.values);
        if rows.len() < period + 1 {
            return Err(DetectionError::InsufficientData {
                needed: period + 1,
                got: rows.len(),
            });
        }

        let mut signals = Vec::new();
        for i in period..rows.len() {
            let bar = &rows[i];
            if !params.is_candidate(bar.date) {
                continue;
            }
            let (Some(sma), Some(prev_sma)) = (
                Self::sma_at(rows, i, period),
                Self::sma_at(rows, i - 1, period),
            ) else {
                continue;
            };
            let crossed = bar.close > sma && rows[i - 1].close <= prev_sma;
            if crossed && sma > 0.0 {
                let distance_pct = (bar.close - sma) / sma * 100.0;
                signals.push(make_signal(
                    symbol,
                    bar,
                    distance_pct,
                    &[("sma", sma), ("distancePct", distance_pct)],
                ));
            }
        }
        Ok(signals)
    }
}
