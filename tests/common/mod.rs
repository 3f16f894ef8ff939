//! Shared fixtures: an in-memory market data source, test detectors and
//! scheduler builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use dragnet::config::{PipelineConfig, RetentionConfig, SchedulerConfig};
use dragnet::error::{DetectionError, FetchError};
use dragnet::services::{Detector, DetectorParams, DetectorRegistry, ScanPipeline, ScanScheduler};
use dragnet::sources::MarketDataSource;
use dragnet::types::{
    DailyBar, DetectorRef, JobId, JobState, ScanRequest, Signal, Thresholds, UniverseEntry,
    UniverseSource,
};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Friday; the default single-day D0.
pub fn d0_day() -> NaiveDate {
    date(2024, 3, 8)
}

fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

/// Flat daily series for `symbol` from January through March 2024.
pub fn series(symbol: &str, close: f64, volume: f64) -> Vec<DailyBar> {
    weekdays(date(2024, 1, 1), date(2024, 3, 29))
        .into_iter()
        .map(|d| DailyBar {
            symbol: symbol.to_string(),
            date: d,
            open: close * 0.99,
            high: close * 1.01,
            low: close * 0.98,
            close,
            volume,
            vwap: None,
            trades: None,
        })
        .collect()
}

// ============================================================================
// In-memory source
// ============================================================================

pub struct InMemorySource {
    bars: BTreeMap<String, Vec<DailyBar>>,
    delay: Duration,
    failing: BTreeSet<String>,
    pub symbol_calls: AtomicUsize,
    pub day_calls: AtomicUsize,
    pub universe_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new(series: Vec<Vec<DailyBar>>) -> Self {
        let bars = series
            .into_iter()
            .filter_map(|s| Some((s.first()?.symbol.clone(), s)))
            .collect();
        Self {
            bars,
            delay: Duration::ZERO,
            failing: BTreeSet::new(),
            symbol_calls: AtomicUsize::new(0),
            day_calls: AtomicUsize::new(0),
            universe_calls: AtomicUsize::new(0),
        }
    }

    /// Three liquid symbols.
    pub fn three_symbols() -> Self {
        Self::new(vec![
            series("AAPL", 180.0, 5e7),
            series("MSFT", 400.0, 2e7),
            series("NVDA", 800.0, 4e7),
        ])
    }

    /// Every upstream call sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Per-symbol fetches for `symbols` fail with an upstream 500 after the
    /// delay.
    pub fn with_failing(mut self, symbols: &[&str]) -> Self {
        self.failing = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl MarketDataSource for InMemorySource {
    async fn fetch_symbol_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        self.symbol_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.failing.contains(symbol) {
            return Err(FetchError::Upstream {
                unit: format!("symbol {symbol}"),
                status: 500,
            });
        }
        Ok(self
            .bars
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_grouped_day(&self, date: NaiveDate) -> Result<Vec<DailyBar>, FetchError> {
        self.day_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self
            .bars
            .values()
            .flat_map(|bars| bars.iter().filter(|b| b.date == date).cloned())
            .collect())
    }

    async fn fetch_universe(&self) -> Result<Vec<UniverseEntry>, FetchError> {
        self.universe_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self
            .bars
            .values()
            .filter_map(|bars| bars.last())
            .map(|b| UniverseEntry {
                symbol: b.symbol.clone(),
                close: b.close,
                volume: b.volume,
            })
            .collect())
    }
}

// ============================================================================
// Test detectors
// ============================================================================

/// Emits one signal per row it is given, history rows included, and counts
/// invocations. Errors on symbols in `fail`, panics on symbols in `panic`.
pub struct EchoDetector {
    pub calls: Arc<AtomicUsize>,
    pub fail: BTreeSet<String>,
    pub panic: BTreeSet<String>,
}

impl EchoDetector {
    pub const NAME: &'static str = "echo";

    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: BTreeSet::new(),
            panic: BTreeSet::new(),
        }
    }
}

impl Detector for EchoDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Signals every row"
    }

    fn lookback_days(&self, _params: &BTreeMap<String, f64>) -> usize {
        5
    }

    fn detect(
        &self,
        symbol: &str,
        rows: &[DailyBar],
        _params: &DetectorParams,
    ) -> Result<Vec<Signal>, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic.contains(symbol) {
            panic!("echo detector panicked on {symbol}");
        }
        if self.fail.contains(symbol) {
            return Err(DetectionError::Failed(format!("echo failed on {symbol}")));
        }
        Ok(rows
            .iter()
            .map(|r| Signal {
                symbol: symbol.to_string(),
                date: r.date,
                fields: BTreeMap::new(),
                score: r.close,
            })
            .collect())
    }
}

pub fn registry_with(detector: EchoDetector) -> Arc<DetectorRegistry> {
    let mut registry = DetectorRegistry::with_builtins();
    registry.register(Arc::new(detector));
    Arc::new(registry)
}

// ============================================================================
// Builders
// ============================================================================

pub fn request(universe: UniverseSource, thresholds: Thresholds) -> ScanRequest {
    ScanRequest {
        universe,
        start_date: d0_day(),
        end_date: d0_day(),
        detector: DetectorRef {
            name: EchoDetector::NAME.to_string(),
            params: BTreeMap::new(),
        },
        thresholds,
    }
}

pub fn symbols(list: &[&str]) -> UniverseSource {
    UniverseSource::Symbols {
        symbols: list.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn relaxed_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_jobs: 4,
        submissions_per_window: 1_000,
        ..Default::default()
    }
}

pub fn build_scheduler(
    source: Arc<InMemorySource>,
    registry: Arc<DetectorRegistry>,
    config: SchedulerConfig,
    pipeline: PipelineConfig,
    retention: RetentionConfig,
) -> Arc<ScanScheduler> {
    let pipeline = ScanPipeline::new(source, registry.clone(), pipeline);
    ScanScheduler::new(config, &retention, pipeline, registry)
}

pub fn default_scheduler(source: Arc<InMemorySource>, registry: Arc<DetectorRegistry>) -> Arc<ScanScheduler> {
    build_scheduler(
        source,
        registry,
        relaxed_scheduler_config(),
        PipelineConfig {
            fetch_workers: 4,
            detect_workers: 2,
            break_even_symbols: 8_000,
        },
        RetentionConfig::default(),
    )
}

/// Poll until both the job record and its progress are terminal; panics
/// after five seconds.
pub async fn wait_terminal(scheduler: &ScanScheduler, id: JobId) -> JobState {
    for _ in 0..500 {
        if let (Some(job), Some(progress)) = (scheduler.job(id), scheduler.status(id)) {
            if job.state.is_terminal() && progress.state.is_terminal() {
                return job.state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not finish in time");
}
