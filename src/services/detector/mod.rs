//! Pattern detection over filtered candidates.
//!
//! Detectors are referenced by name from a [`DetectorRegistry`]. The stage
//! driver [`detect_all`] runs one unit per candidate symbol on the blocking
//! pool, bounded by a semaphore, and isolates per-symbol failures.

pub mod builtin;

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::ProgressHandle;
use crate::error::{DetectionError, ScanError};
use crate::types::{DailyBar, DateRange, ScanDiagnostics, Signal, Stage};

/// A named pattern detector.
///
/// `detect` receives one symbol's bars in ascending date order, covering the
/// history window plus the D0 range. It must be deterministic.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Trading days of history needed before the first D0 date.
    fn lookback_days(&self, params: &BTreeMap<String, f64>) -> usize;

    /// Reject unusable parameters at submission time.
    fn validate_params(&self, _params: &BTreeMap<String, f64>) -> Result<(), String> {
        Ok(())
    }

    fn detect(
        &self,
        symbol: &str,
        rows: &[DailyBar],
        params: &DetectorParams,
    ) -> Result<Vec<Signal>, DetectionError>;
}

/// Per-symbol detector input besides the bars themselves.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub values: BTreeMap<String, f64>,
    pub d0: DateRange,
    /// The symbol's D0 dates that survived the smart filter.
    pub candidate_dates: Vec<NaiveDate>,
}

impl DetectorParams {
    pub fn get(&self, key: &str, default: f64) -> f64 {
        self.values.get(key).copied().unwrap_or(default)
    }

    pub fn is_candidate(&self, date: NaiveDate) -> bool {
        self.candidate_dates.binary_search(&date).is_ok()
    }
}

/// Listing entry for `GET /api/detectors`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorInfo {
    pub name: String,
    pub description: String,
    pub lookback_days: usize,
}

/// Name → detector map. Built once at startup, shared read-only.
#[derive(Clone)]
pub struct DetectorRegistry {
    detectors: BTreeMap<String, Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn empty() -> Self {
        Self {
            detectors: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(builtin::GapUp));
        registry.register(Arc::new(builtin::VolumeSpike));
        registry.register(Arc::new(builtin::MaCross));
        registry
    }

    /// Register a detector, replacing any previous one with the same name.
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.insert(detector.name().to_string(), detector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.detectors.get(name).cloned()
    }

    pub fn list(&self) -> Vec<DetectorInfo> {
        let defaults = BTreeMap::new();
        self.detectors
            .values()
            .map(|d| DetectorInfo {
                name: d.name().to_string(),
                description: d.description().to_string(),
                lookback_days: d.lookback_days(&defaults),
            })
            .collect()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// One symbol's detection work.
#[derive(Debug, Clone)]
pub struct DetectUnit {
    pub symbol: String,
    /// Full history plus D0 bars, ascending by date.
    pub rows: Vec<DailyBar>,
    pub candidate_dates: Vec<NaiveDate>,
}

/// Aggregated detection output.
#[derive(Debug, Clone, Default)]
pub struct DetectOutcome {
    pub signals: Vec<Signal>,
    pub diagnostics: ScanDiagnostics,
    pub messages: Vec<String>,
}

enum UnitResult {
    Done(Result<Vec<Signal>, DetectionError>),
    Panicked(String),
    Skipped,
}

/// Run `detector` over every unit with at most `workers` running at once.
///
/// Per-symbol errors and panics are counted, not propagated. Signals dated
/// outside `d0` are dropped. Output is sorted by (symbol, date).
pub async fn detect_all(
    detector: Arc<dyn Detector>,
    units: Vec<DetectUnit>,
    params: BTreeMap<String, f64>,
    d0: DateRange,
    workers: usize,
    cancel: &CancellationToken,
    progress: &ProgressHandle,
) -> Result<DetectOutcome, ScanError> {
    let total = units.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut join_set = JoinSet::new();

    for unit in units {
        let semaphore = semaphore.clone();
        let detector = detector.clone();
        let cancel = cancel.clone();
        let params = DetectorParams {
            values: params.clone(),
            d0,
            candidate_dates: unit.candidate_dates,
        };
        let symbol = unit.symbol;
        let rows = unit.rows;

        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (symbol, UnitResult::Skipped);
            };
            if cancel.is_cancelled() {
                return (symbol, UnitResult::Skipped);
            }
            let task_symbol = symbol.clone();
            let joined = tokio::task::spawn_blocking(move || {
                catch_unwind(AssertUnwindSafe(|| {
                    detector.detect(&task_symbol, &rows, &params)
                }))
            })
            .await;
            let result = match joined {
                Ok(Ok(result)) => UnitResult::Done(result),
                Ok(Err(payload)) => UnitResult::Panicked(panic_message(payload.as_ref())),
                Err(e) => UnitResult::Panicked(e.to_string()),
            };
            (symbol, result)
        });
    }

    let mut by_key: BTreeMap<(String, NaiveDate), Signal> = BTreeMap::new();
    let mut outcome = DetectOutcome::default();
    let mut done = 0usize;

    while let Some(joined) = join_set.join_next().await {
        let (symbol, result) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(ScanError::Internal(format!("detect worker failed: {e}"))),
        };

        match result {
            UnitResult::Skipped => continue,
            UnitResult::Done(Ok(signals)) => {
                for signal in signals {
                    if !d0.contains(signal.date) || signal.symbol != symbol {
                        debug!(symbol = %symbol, date = %signal.date, "Dropping signal outside D0");
                        continue;
                    }
                    by_key.insert((signal.symbol.clone(), signal.date), signal);
                }
            }
            UnitResult::Done(Err(e)) => {
                warn!(symbol = %symbol, error = %e, "Detection failed for symbol");
                outcome.diagnostics.detection_errors += 1;
                outcome.diagnostics.error_symbols.push(symbol);
            }
            UnitResult::Panicked(msg) => {
                warn!(symbol = %symbol, panic = %msg, "Detector panicked");
                outcome.diagnostics.detection_errors += 1;
                outcome.diagnostics.error_symbols.push(symbol);
            }
        }

        done += 1;
        outcome.diagnostics.symbols_processed = done;
        let pct = done as f64 / total.max(1) as f64 * 100.0;
        progress.report(
            Stage::Detect,
            pct,
            format!(
                "{}/{} symbols processed, {} errors",
                done, total, outcome.diagnostics.detection_errors
            ),
        );
    }

    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }

    outcome.diagnostics.error_symbols.sort();
    outcome.signals = by_key.into_values().collect();
    outcome.messages.push(format!(
        "{}/{} symbols processed, {} errors",
        outcome.diagnostics.symbols_processed, total, outcome.diagnostics.detection_errors
    ));
    Ok(outcome)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
