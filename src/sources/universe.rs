//! Per-job snapshot of the tradable symbol universe.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use super::MarketDataSource;
use crate::error::FetchError;
use crate::types::{Thresholds, UniverseEntry};

/// Fetches the universe once and serves it for the rest of one job.
///
/// Not shared across jobs: composition changes day to day.
pub struct UniverseFetcher {
    source: Arc<dyn MarketDataSource>,
    snapshot: OnceCell<Arc<Vec<UniverseEntry>>>,
}

impl UniverseFetcher {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            snapshot: OnceCell::new(),
        }
    }

    /// Snapshot entries. An empty universe is an error, never a partial result.
    pub async fn entries(&self) -> Result<Arc<Vec<UniverseEntry>>, FetchError> {
        self.snapshot
            .get_or_try_init(|| async {
                let entries = self.source.fetch_universe().await?;
                if entries.is_empty() {
                    return Err(FetchError::EmptyUniverse);
                }
                info!(symbols = entries.len(), "Universe snapshot fetched");
                Ok(Arc::new(entries))
            })
            .await
            .cloned()
    }

    pub async fn fetch_universe(&self) -> Result<BTreeSet<String>, FetchError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .map(|e| e.symbol.clone())
            .collect())
    }

    /// Symbols whose latest day already passes the thresholds that can be
    /// judged from a single bar.
    pub async fn candidate_symbols(
        &self,
        thresholds: &Thresholds,
    ) -> Result<BTreeSet<String>, FetchError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter(|e| passes_snapshot_thresholds(e, thresholds))
            .map(|e| e.symbol.clone())
            .collect())
    }
}

fn passes_snapshot_thresholds(entry: &UniverseEntry, thresholds: &Thresholds) -> bool {
    thresholds.min_price.map_or(true, |min| entry.close >= min)
        && thresholds.max_price.map_or(true, |max| entry.close <= max)
        && thresholds.min_volume.map_or(true, |min| entry.volume >= min)
        && thresholds
            .min_dollar_volume
            .map_or(true, |min| entry.close * entry.volume >= min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DailyBar;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SnapshotOnly {
        entries: Vec<UniverseEntry>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for SnapshotOnly {
        async fn fetch_symbol_range(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<DailyBar>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_grouped_day(&self, _date: NaiveDate) -> Result<Vec<DailyBar>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_universe(&self) -> Result<Vec<UniverseEntry>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }
    }

    fn entry(symbol: &str, close: f64, volume: f64) -> UniverseEntry {
        UniverseEntry {
            symbol: symbol.to_string(),
            close,
            volume,
        }
    }

    #[tokio::test]
    async fn test_snapshot_cached_for_job() {
        let source = Arc::new(SnapshotOnly {
            entries: vec![entry("AAPL", 180.0, 5e7), entry("ABCD", 0.5, 1e3)],
            calls: AtomicUsize::new(0),
        });
        let fetcher = UniverseFetcher::new(source.clone());

        let symbols = fetcher.fetch_universe().await.unwrap();
        assert_eq!(symbols.len(), 2);
        fetcher.fetch_universe().await.unwrap();
        fetcher.candidate_symbols(&Thresholds::default()).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_universe_is_fatal() {
        let fetcher = UniverseFetcher::new(Arc::new(SnapshotOnly {
            entries: vec![],
            calls: AtomicUsize::new(0),
        }));
        assert!(matches!(
            fetcher.fetch_universe().await,
            Err(FetchError::EmptyUniverse)
        ));
    }

    #[tokio::test]
    async fn test_candidates_apply_single_bar_thresholds() {
        let fetcher = UniverseFetcher::new(Arc::new(SnapshotOnly {
            entries: vec![
                entry("AAPL", 180.0, 5e7),
                entry("PENNY", 0.5, 1e7),
                entry("THIN", 50.0, 100.0),
            ],
            calls: AtomicUsize::new(0),
        }));
        let thresholds = Thresholds {
            min_price: Some(1.0),
            min_dollar_volume: Some(1e6),
            // judged later by the filter, ignored here
            min_avg_volume: Some(1e12),
            ..Default::default()
        };
        let candidates = fetcher.candidate_symbols(&thresholds).await.unwrap();
        assert_eq!(candidates.into_iter().collect::<Vec<_>>(), vec!["AAPL"]);
    }
}
