//! The fixed scan pipeline: fetch, filter, detect, finalize.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::detector::{detect_all, DetectUnit, DetectorRegistry};
use super::fetch_stage::FetchStage;
use super::progress::ProgressHandle;
use super::smart_filter::SmartFilter;
use super::strategy::FetchStrategySelector;
use crate::config::PipelineConfig;
use crate::error::ScanError;
use crate::sources::{MarketDataSource, UniverseFetcher};
use crate::types::{
    DailyBar, FetchStrategy, ScanRequest, ScanResult, Stage, StageResult, UniverseSource,
};

/// Callback receiving each stage result as soon as the stage ends.
pub type StageSink<'a> = &'a (dyn Fn(StageResult) + Send + Sync);

pub struct ScanPipeline {
    source: Arc<dyn MarketDataSource>,
    registry: Arc<DetectorRegistry>,
    selector: FetchStrategySelector,
    config: PipelineConfig,
}

impl ScanPipeline {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        registry: Arc<DetectorRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            registry,
            selector: FetchStrategySelector::new(config.break_even_symbols),
            config,
        }
    }

    pub async fn run(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
        progress: &ProgressHandle,
        on_stage: StageSink<'_>,
    ) -> Result<ScanResult, ScanError> {
        let d0 = request
            .d0()
            .ok_or_else(|| ScanError::Internal("inverted D0 range".to_string()))?;
        let detector = self.registry.get(&request.detector.name).ok_or_else(|| {
            ScanError::Internal(format!("detector {} not registered", request.detector.name))
        })?;
        let lookback = detector
            .lookback_days(&request.detector.params)
            .max(request.thresholds.lookback_rows());
        let history = d0.with_lookback(lookback).ok_or_else(|| {
            ScanError::Internal(format!("lookback of {lookback} days out of range"))
        })?;
        let mut stage_results = Vec::new();

        // ---- fetch --------------------------------------------------------
        let started = Instant::now();
        progress.report(Stage::Fetch, 0.0, "Resolving symbol universe");

        let universe = UniverseFetcher::new(self.source.clone());
        let (estimated, symbols) = match &request.universe {
            UniverseSource::Symbols { .. } => {
                let explicit: BTreeSet<String> =
                    request.universe.explicit_symbols().into_iter().collect();
                (explicit.len(), explicit)
            }
            UniverseSource::All => {
                // The snapshot only reflects the latest session, so it sizes
                // the fetch but never narrows the symbols a past D0 may need.
                let universe_error = |source| ScanError::Fetch {
                    strategy: "universe",
                    source,
                };
                let estimated = universe
                    .candidate_symbols(&request.thresholds)
                    .await
                    .map_err(universe_error)?
                    .len();
                let all = universe.fetch_universe().await.map_err(universe_error)?;
                (estimated, all)
            }
        };

        let mut plan = self.selector.select(estimated, history.trading_days().len());
        if plan.strategy == FetchStrategy::PerSymbol {
            plan.expected_calls = symbols.len();
        }
        info!(
            job_id = %progress.job_id(),
            strategy = plan.strategy.as_str(),
            estimated = plan.estimated_candidates,
            expected_calls = plan.expected_calls,
            "Fetch strategy selected"
        );
        progress.report(Stage::Fetch, 0.0, plan.describe());

        let fetched = FetchStage::new(self.source.clone(), self.config.fetch_workers)
            .run(plan.strategy, &symbols, history, cancel, progress)
            .await?;

        let fetch_result = StageResult {
            stage: Stage::Fetch,
            count_in: symbols.len(),
            count_out: fetched.rows.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            messages: vec![
                plan.describe(),
                format!(
                    "Fetched {} rows in {} {} calls",
                    fetched.rows.len(),
                    fetched.units,
                    plan.strategy.as_str()
                ),
            ],
        };
        on_stage(fetch_result.clone());
        stage_results.push(fetch_result);
        progress.report(Stage::Fetch, 100.0, "Fetch complete");

        // ---- filter -------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let started = Instant::now();
        progress.report(Stage::Filter, 0.0, "Applying smart filter");

        let rows = fetched.rows;
        let survivors = SmartFilter::new().apply(&rows, &request.thresholds, &d0)?;
        let stats = SmartFilter::stats(&rows, &d0, &survivors);
        info!(
            job_id = %progress.job_id(),
            candidates_in = stats.candidates_in,
            rows_out = stats.rows_out,
            symbols_out = stats.symbols_out,
            reduction_pct = stats.reduction_pct(),
            "Smart filter applied"
        );

        let filter_result = StageResult {
            stage: Stage::Filter,
            count_in: stats.candidates_in,
            count_out: stats.rows_out,
            elapsed_ms: started.elapsed().as_millis() as u64,
            messages: vec![format!(
                "{} of {} candidate rows kept across {} symbols ({:.1}% reduction)",
                stats.rows_out,
                stats.candidates_in,
                stats.symbols_out,
                stats.reduction_pct()
            )],
        };
        on_stage(filter_result.clone());
        stage_results.push(filter_result);
        progress.report(Stage::Filter, 100.0, "Filter complete");

        // ---- detect -------------------------------------------------------
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let started = Instant::now();
        let units = build_units(rows, &survivors);
        let unit_count = units.len();
        progress.report(
            Stage::Detect,
            0.0,
            format!("0/{} symbols processed, 0 errors", unit_count),
        );

        let outcome = detect_all(
            detector,
            units,
            request.detector.params.clone(),
            d0,
            self.config.detect_workers,
            cancel,
            progress,
        )
        .await?;

        let detect_result = StageResult {
            stage: Stage::Detect,
            count_in: unit_count,
            count_out: outcome.signals.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            messages: outcome.messages.clone(),
        };
        on_stage(detect_result.clone());
        stage_results.push(detect_result);

        // ---- finalize -----------------------------------------------------
        progress.report(Stage::Finalize, 0.0, "Finalizing results");
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        Ok(ScanResult {
            signals: outcome.signals,
            stage_results,
            diagnostics: outcome.diagnostics,
            fetch_plan: Some(plan),
        })
    }
}

/// One unit per symbol that has at least one surviving D0 row. Each unit
/// carries the symbol's full fetched series, history included.
fn build_units(rows: Vec<DailyBar>, survivors: &[DailyBar]) -> Vec<DetectUnit> {
    let mut candidate_dates: BTreeMap<&str, Vec<NaiveDate>> = BTreeMap::new();
    for row in survivors {
        candidate_dates
            .entry(row.symbol.as_str())
            .or_default()
            .push(row.date);
    }

    let mut series: BTreeMap<String, Vec<DailyBar>> = BTreeMap::new();
    for row in rows {
        if candidate_dates.contains_key(row.symbol.as_str()) {
            series.entry(row.symbol.clone()).or_default().push(row);
        }
    }

    series
        .into_iter()
        .map(|(symbol, mut rows)| {
            rows.sort_by_key(|r| r.date);
            rows.dedup_by_key(|r| r.date);
            let mut dates = candidate_dates.remove(symbol.as_str()).unwrap_or_default();
            dates.sort();
            dates.dedup();
            DetectUnit {
                symbol,
                rows,
                candidate_dates: dates,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(symbol: &str, n: i64) -> DailyBar {
        DailyBar {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap() + Duration::days(n),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            vwap: None,
            trades: None,
        }
    }

    #[test]
    fn test_units_only_for_surviving_symbols() {
        let rows = vec![bar("B", 1), bar("A", 1), bar("A", 0), bar("C", 1)];
        let survivors = vec![bar("A", 1), bar("B", 1)];
        let units = build_units(rows, &survivors);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].symbol, "A");
        assert_eq!(units[0].rows.len(), 2);
        assert!(units[0].rows[0].date < units[0].rows[1].date);
        assert_eq!(units[0].candidate_dates, vec![bar("A", 1).date]);
        assert_eq!(units[1].symbol, "B");
    }
}
