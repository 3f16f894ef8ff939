//! Fetch-stage driver: executes the strategy chosen by the selector.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::ProgressHandle;
use crate::error::{FetchError, ScanError};
use crate::sources::MarketDataSource;
use crate::types::{DailyBar, DateRange, FetchStrategy, Stage};

/// Rows fetched for one job.
#[derive(Debug, Default)]
pub struct FetchOutput {
    pub rows: Vec<DailyBar>,
    /// Upstream units completed (symbols or days).
    pub units: usize,
}

pub struct FetchStage {
    source: Arc<dyn MarketDataSource>,
    workers: usize,
}

impl FetchStage {
    pub fn new(source: Arc<dyn MarketDataSource>, workers: usize) -> Self {
        Self {
            source,
            workers: workers.max(1),
        }
    }

    /// Fetch bars for `symbols` across `window`.
    ///
    /// Only rows for `symbols` dated inside `window` are returned, whichever
    /// strategy produced them.
    pub async fn run(
        &self,
        strategy: FetchStrategy,
        symbols: &BTreeSet<String>,
        window: DateRange,
        cancel: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<FetchOutput, ScanError> {
        let result = match strategy {
            FetchStrategy::PerSymbol => self.per_symbol(symbols, window, cancel, progress).await,
            FetchStrategy::GroupedByDay => {
                self.grouped_by_day(symbols, window, cancel, progress).await
            }
        };

        let mut output = result.map_err(|e| match e {
            StageFailure::Cancelled => ScanError::Cancelled,
            StageFailure::Fetch(source) => ScanError::Fetch {
                strategy: strategy.as_str(),
                source,
            },
            StageFailure::Internal(msg) => ScanError::Internal(msg),
        })?;

        output
            .rows
            .retain(|r| window.contains(r.date) && symbols.contains(&r.symbol));
        info!(
            strategy = strategy.as_str(),
            units = output.units,
            rows = output.rows.len(),
            "Fetch stage complete"
        );
        Ok(output)
    }

    async fn per_symbol(
        &self,
        symbols: &BTreeSet<String>,
        window: DateRange,
        cancel: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<FetchOutput, StageFailure> {
        let total = symbols.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set: JoinSet<Option<Result<Vec<DailyBar>, FetchError>>> = JoinSet::new();

        for symbol in symbols {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let cancel = cancel.clone();
            let symbol = symbol.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(
                    source
                        .fetch_symbol_range(&symbol, window.start, window.end)
                        .await,
                )
            });
        }

        let mut output = FetchOutput::default();
        while let Some(joined) = join_set.join_next().await {
            let fetched = match joined {
                Ok(Some(fetched)) => fetched,
                Ok(None) => continue,
                Err(e) => {
                    join_set.abort_all();
                    return Err(StageFailure::Internal(format!("fetch worker failed: {e}")));
                }
            };
            match fetched {
                Ok(rows) => {
                    output.rows.extend(rows);
                    output.units += 1;
                    progress.report(
                        Stage::Fetch,
                        output.units as f64 / total.max(1) as f64 * 100.0,
                        format!("Fetched {}/{} symbols", output.units, total),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Fatal fetch error, aborting in-flight symbols");
                    join_set.abort_all();
                    return Err(StageFailure::Fetch(e));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(StageFailure::Cancelled);
        }
        Ok(output)
    }

    /// One grouped request per trading day, strictly in sequence.
    async fn grouped_by_day(
        &self,
        symbols: &BTreeSet<String>,
        window: DateRange,
        cancel: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<FetchOutput, StageFailure> {
        let days = window.trading_days();
        let total = days.len();
        let mut output = FetchOutput::default();

        for day in days {
            if cancel.is_cancelled() {
                return Err(StageFailure::Cancelled);
            }
            let rows = self
                .source
                .fetch_grouped_day(day)
                .await
                .map_err(StageFailure::Fetch)?;
            let before = output.rows.len();
            output
                .rows
                .extend(rows.into_iter().filter(|r| symbols.contains(&r.symbol)));
            debug!(date = %day, rows = output.rows.len() - before, "Grouped day fetched");

            output.units += 1;
            progress.report(
                Stage::Fetch,
                output.units as f64 / total.max(1) as f64 * 100.0,
                format!("Fetched {}/{} trading days", output.units, total),
            );
        }
        Ok(output)
    }
}

enum StageFailure {
    Cancelled,
    Fetch(FetchError),
    Internal(String),
}
