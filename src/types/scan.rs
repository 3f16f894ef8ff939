//! Scan job data model.

use super::market::DateRange;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier.
pub type JobId = Uuid;

/// Lifecycle state of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running)
            | (JobState::Queued, JobState::Cancelled)
            | (JobState::Queued, JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage. `Finalize` only exists for progress accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Filter,
    Detect,
    Finalize,
}

impl Stage {
    /// Slice of overall progress (in percent) owned by this stage.
    pub fn weight_range(&self) -> (f64, f64) {
        match self {
            Stage::Fetch => (0.0, 40.0),
            Stage::Filter => (40.0, 55.0),
            Stage::Detect => (55.0, 95.0),
            Stage::Finalize => (95.0, 100.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Filter => "filter",
            Stage::Detect => "detect",
            Stage::Finalize => "finalize",
        }
    }
}

/// Where the symbol universe for a scan comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UniverseSource {
    /// Full tradable universe from the provider's snapshot.
    All,
    /// Explicit list of symbols.
    Symbols { symbols: Vec<String> },
}

impl UniverseSource {
    /// Upper-cased, de-duplicated explicit symbols (empty for `All`).
    pub fn explicit_symbols(&self) -> Vec<String> {
        match self {
            UniverseSource::All => Vec::new(),
            UniverseSource::Symbols { symbols } => {
                let mut out: Vec<String> = symbols
                    .iter()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                out.sort();
                out.dedup();
                out
            }
        }
    }
}

/// Longest trailing window accepted for the average predicates.
pub const MAX_AVG_WINDOW: usize = 1_000;

/// Longest D0 range a single scan may cover, in calendar days.
pub const MAX_D0_SPAN_DAYS: i64 = 3_660;

/// Cheap numeric predicates applied by the smart filter. Every set field is
/// one predicate; predicates are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Thresholds {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_volume: Option<f64>,
    pub min_dollar_volume: Option<f64>,
    pub min_avg_volume: Option<f64>,
    pub min_avg_dollar_volume: Option<f64>,
    /// Trailing window (rows) for the average predicates.
    pub avg_window: usize,
    /// Close above open on the candidate day.
    pub require_up_day: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_price: None,
            max_price: None,
            min_volume: None,
            min_dollar_volume: None,
            min_avg_volume: None,
            min_avg_dollar_volume: None,
            avg_window: 20,
            require_up_day: false,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        let named = [
            ("minPrice", self.min_price),
            ("maxPrice", self.max_price),
            ("minVolume", self.min_volume),
            ("minDollarVolume", self.min_dollar_volume),
            ("minAvgVolume", self.min_avg_volume),
            ("minAvgDollarVolume", self.min_avg_dollar_volume),
        ];
        for (name, value) in named {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} must be a non-negative number", name));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err("minPrice must not exceed maxPrice".to_string());
            }
        }
        if self.avg_window == 0 {
            return Err("avgWindow must be at least 1".to_string());
        }
        if self.avg_window > MAX_AVG_WINDOW {
            return Err(format!("avgWindow must not exceed {MAX_AVG_WINDOW}"));
        }
        Ok(())
    }

    /// Whether any predicate needs trailing history before the D0 range.
    pub fn uses_trailing_window(&self) -> bool {
        self.min_avg_volume.is_some() || self.min_avg_dollar_volume.is_some()
    }

    /// Trailing rows the filter wants before the first D0 date.
    pub fn lookback_rows(&self) -> usize {
        if self.uses_trailing_window() {
            self.avg_window.saturating_sub(1)
        } else {
            0
        }
    }
}

/// Reference to a registered detector plus its tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorRef {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// Everything a caller supplies when submitting a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub universe: UniverseSource,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub detector: DetectorRef,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl ScanRequest {
    /// The D0 range, `None` if the dates are inverted.
    pub fn d0(&self) -> Option<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// One detection hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub symbol: String,
    pub date: NaiveDate,
    pub fields: BTreeMap<String, f64>,
    pub score: f64,
}

/// Output summary of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub count_in: usize,
    pub count_out: usize,
    pub elapsed_ms: u64,
    pub messages: Vec<String>,
}

/// Data fetch strategy chosen for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    /// One range request per candidate symbol, in parallel.
    PerSymbol,
    /// One grouped request per trading day, sequential.
    GroupedByDay,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::PerSymbol => "per_symbol",
            FetchStrategy::GroupedByDay => "grouped_by_day",
        }
    }
}

/// Decision record emitted by the strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPlan {
    pub strategy: FetchStrategy,
    pub estimated_candidates: usize,
    pub expected_calls: usize,
}

/// Per-symbol detection accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDiagnostics {
    pub symbols_processed: usize,
    pub detection_errors: usize,
    pub error_symbols: Vec<String>,
}

/// Final output of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub signals: Vec<Signal>,
    pub stage_results: Vec<StageResult>,
    pub diagnostics: ScanDiagnostics,
    pub fetch_plan: Option<FetchPlan>,
}

/// Reason code attached to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    FetchError,
    FilterError,
    Timeout,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::FetchError => "fetch_error",
            FailureReason::FilterError => "filter_error",
            FailureReason::Timeout => "timeout",
            FailureReason::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// A submitted scan and its lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: JobId,
    pub owner: String,
    pub request: ScanRequest,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_results: Vec<StageResult>,
    pub failure: Option<JobFailure>,
}

impl ScanJob {
    pub fn new(owner: impl Into<String>, request: ScanRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            request,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stage_results: Vec::new(),
            failure: None,
        }
    }

    /// Move to `next`, stamping timestamps. Terminal jobs never change.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id,
            owner: self.owner.clone(),
            state: self.state,
            detector: self.request.detector.name.clone(),
            start_date: self.request.start_date,
            end_date: self.request.end_date,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

/// Listing entry for a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub owner: String,
    pub state: JobState,
    pub detector: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Latest progress for a job. There is exactly one per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub stage: Option<Stage>,
    pub stage_percent: f64,
    pub overall_percent: f64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ScanRequest {
        ScanRequest {
            universe: UniverseSource::Symbols {
                symbols: vec!["aapl".to_string(), "MSFT".to_string(), "AAPL".to_string()],
            },
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            detector: DetectorRef {
                name: "gap_up".to_string(),
                params: BTreeMap::new(),
            },
            thresholds: Thresholds::default(),
        }
    }

    #[test]
    fn test_job_transitions_are_monotonic() {
        let mut job = ScanJob::new("127.0.0.1", request());
        assert_eq!(job.state, JobState::Queued);
        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobState::Completed).unwrap();
        assert!(job.finished_at.is_some());

        let err = job.transition(JobState::Running).unwrap_err();
        assert_eq!(err.from, JobState::Completed);
        assert!(job.transition(JobState::Cancelled).is_err());
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_queued_job_can_be_cancelled() {
        let mut job = ScanJob::new("127.0.0.1", request());
        job.transition(JobState::Cancelled).unwrap();
        assert!(job.started_at.is_none());
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn test_explicit_symbols_normalized() {
        assert_eq!(
            request().universe.explicit_symbols(),
            vec!["AAPL".to_string(), "MSFT".to_string()]
        );
        assert!(UniverseSource::All.explicit_symbols().is_empty());
    }

    #[test]
    fn test_thresholds_validation() {
        let mut t = Thresholds::default();
        assert!(t.validate().is_ok());
        t.min_price = Some(10.0);
        t.max_price = Some(5.0);
        assert!(t.validate().is_err());
        t.max_price = None;
        t.min_volume = Some(-1.0);
        assert!(t.validate().is_err());
        t.min_volume = None;
        t.avg_window = MAX_AVG_WINDOW + 1;
        assert!(t.validate().is_err());
        t.avg_window = MAX_AVG_WINDOW;
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_thresholds_reject_unknown_keys() {
        let parsed: Result<Thresholds, _> = serde_json::from_str(r#"{"minPrise": 5}"#);
        assert!(parsed.is_err());
        let parsed: Thresholds = serde_json::from_str(r#"{"minPrice": 5}"#).unwrap();
        assert_eq!(parsed.min_price, Some(5.0));
        assert_eq!(parsed.avg_window, 20);
    }

    #[test]
    fn test_stage_weights_are_contiguous() {
        let stages = [Stage::Fetch, Stage::Filter, Stage::Detect, Stage::Finalize];
        let mut prev_end = 0.0;
        for stage in stages {
            let (start, end) = stage.weight_range();
            assert_eq!(start, prev_end);
            prev_end = end;
        }
        assert_eq!(prev_end, 100.0);
    }

    #[test]
    fn test_universe_source_serialization() {
        let json = serde_json::to_string(&UniverseSource::All).unwrap();
        assert_eq!(json, r#"{"type":"all"}"#);
        let parsed: UniverseSource =
            serde_json::from_str(r#"{"type":"symbols","symbols":["AAPL"]}"#).unwrap();
        assert_eq!(
            parsed,
            UniverseSource::Symbols {
                symbols: vec!["AAPL".to_string()]
            }
        );
    }
}
