//! Upstream market data client.
//!
//! Talks to a Polygon-style REST provider through three endpoints: the
//! per-symbol daily aggregate range, the grouped daily market aggregate, and
//! the full-market ticker snapshot. Connection pooling, upstream pacing and
//! the retry/backoff policy all live here; callers only see `FetchError`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use rand::Rng;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::rate_limiter::RateLimiter;
use crate::config::MarketDataConfig;
use crate::error::FetchError;
use crate::types::{DailyBar, UniverseEntry};

/// Read access to daily market data. Implemented by `MarketDataClient` and by
/// in-memory sources in tests.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Daily bars for one symbol over `[start, end]`, oldest first.
    async fn fetch_symbol_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError>;

    /// Daily bars for every symbol that traded on `date`.
    async fn fetch_grouped_day(&self, date: NaiveDate) -> Result<Vec<DailyBar>, FetchError>;

    /// Latest-day snapshot of the tradable universe.
    async fn fetch_universe(&self) -> Result<Vec<UniverseEntry>, FetchError>;
}

/// Aggregate bar as returned by the provider.
#[derive(Debug, Clone, Deserialize)]
struct AggBar {
    /// Only present on grouped responses.
    #[serde(rename = "T")]
    ticker: Option<String>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    vw: Option<f64>,
    n: Option<u64>,
    /// Bar start, unix milliseconds.
    t: i64,
}

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    status: String,
    #[serde(default)]
    results: Vec<AggBar>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    status: String,
    #[serde(default)]
    tickers: Vec<SnapshotTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotTicker {
    ticker: String,
    day: Option<SnapshotDay>,
    prev_day: Option<SnapshotDay>,
}

#[derive(Debug, Deserialize)]
struct SnapshotDay {
    #[serde(default)]
    c: f64,
    #[serde(default)]
    v: f64,
}

/// Outcome of a single HTTP attempt.
enum AttemptError {
    /// 429 from upstream, with its `Retry-After` hint if any.
    RateLimited(Option<Duration>),
    Failed(FetchError),
}

/// Pooled HTTP client for the market data provider.
pub struct MarketDataClient {
    client: Client,
    config: MarketDataConfig,
    connections: Semaphore,
    limiter: RateLimiter,
}

impl MarketDataClient {
    /// Create a new client from configuration.
    pub fn new(config: MarketDataConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(concat!("dragnet/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            connections: Semaphore::new(config.max_connections.max(1)),
            limiter: RateLimiter::new("market-data", config.requests_per_minute),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// GET a JSON document, applying pacing and the retry policy.
    async fn get_json<T: DeserializeOwned>(
        &self,
        unit: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = self.url(path);
        let mut failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            match self.attempt(unit, &url, query).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::RateLimited(retry_after)) => {
                    rate_limited += 1;
                    if rate_limited > self.config.max_rate_limit_retries {
                        return Err(FetchError::RateLimitExhausted {
                            unit: unit.to_string(),
                        });
                    }
                    let (base, max) = (self.config.backoff_base, self.config.backoff_max);
                    let delay = match retry_after {
                        Some(hint) => retry_after_delay(hint, base, max),
                        None => backoff_delay(base, max, rate_limited),
                    };
                    warn!(
                        unit = %unit,
                        attempt = rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        "Upstream rate limit hit, backing off"
                    );
                    self.limiter.pause_for(delay).await;
                }
                Err(AttemptError::Failed(err)) if err.is_transient() => {
                    failures += 1;
                    if failures >= self.config.max_attempts {
                        return Err(err);
                    }
                    let delay =
                        backoff_delay(self.config.backoff_base, self.config.backoff_max, failures);
                    debug!(
                        unit = %unit,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Transient upstream failure, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Failed(err)) => return Err(err),
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        unit: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, AttemptError> {
        self.limiter.acquire().await;
        let _permit = self.connections.acquire().await.map_err(|_| {
            AttemptError::Failed(FetchError::DataFormat {
                unit: unit.to_string(),
                message: "connection pool closed".to_string(),
            })
        })?;

        let network = |source: reqwest::Error| {
            AttemptError::Failed(FetchError::Network {
                unit: unit.to_string(),
                source,
            })
        };

        let response = self
            .client
            .get(url)
            .query(query)
            .query(&[("apiKey", self.config.api_key.as_str())])
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptError::RateLimited(retry_after));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AttemptError::Failed(FetchError::Auth {
                unit: unit.to_string(),
            }));
        }
        if !status.is_success() {
            return Err(AttemptError::Failed(FetchError::Upstream {
                unit: unit.to_string(),
                status: status.as_u16(),
            }));
        }

        let body = response.bytes().await.map_err(network)?;
        serde_json::from_slice(&body).map_err(|e| {
            AttemptError::Failed(FetchError::DataFormat {
                unit: unit.to_string(),
                message: e.to_string(),
            })
        })
    }
}

#[async_trait]
impl MarketDataSource for MarketDataClient {
    async fn fetch_symbol_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        let unit = format!("symbol {}", symbol);
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/day/{}/{}",
            symbol,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        let query = [
            ("adjusted", "true".to_string()),
            ("sort", "asc".to_string()),
            ("limit", "50000".to_string()),
        ];

        let response: AggregatesResponse = self.get_json(&unit, &path, &query).await?;
        let mut bars = parse_aggregates(&unit, response, Some(symbol))?;
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    async fn fetch_grouped_day(&self, date: NaiveDate) -> Result<Vec<DailyBar>, FetchError> {
        let unit = format!("day {}", date);
        let path = format!(
            "/v2/aggs/grouped/locale/us/market/stocks/{}",
            date.format("%Y-%m-%d")
        );
        let query = [("adjusted", "true".to_string())];

        let response: AggregatesResponse = self.get_json(&unit, &path, &query).await?;
        parse_aggregates(&unit, response, None)
    }

    async fn fetch_universe(&self) -> Result<Vec<UniverseEntry>, FetchError> {
        let unit = "universe";
        let response: SnapshotResponse = self
            .get_json(unit, "/v2/snapshot/locale/us/markets/stocks/tickers", &[])
            .await?;

        if !is_ok_status(&response.status) {
            return Err(FetchError::DataFormat {
                unit: unit.to_string(),
                message: format!("status {}", response.status),
            });
        }

        Ok(response
            .tickers
            .into_iter()
            .filter(|t| !t.ticker.is_empty())
            .map(|t| {
                // Before the open the current day is all zeros; fall back to the prior session.
                let day = t
                    .day
                    .filter(|d| d.c > 0.0)
                    .or(t.prev_day)
                    .unwrap_or(SnapshotDay { c: 0.0, v: 0.0 });
                UniverseEntry {
                    symbol: t.ticker.to_uppercase(),
                    close: day.c,
                    volume: day.v,
                }
            })
            .collect())
    }
}

fn is_ok_status(status: &str) -> bool {
    matches!(status, "OK" | "DELAYED")
}

/// Convert a provider aggregate response into bars. `symbol` is used for
/// per-symbol responses where bars carry no ticker of their own.
fn parse_aggregates(
    unit: &str,
    response: AggregatesResponse,
    symbol: Option<&str>,
) -> Result<Vec<DailyBar>, FetchError> {
    if !is_ok_status(&response.status) {
        return Err(FetchError::DataFormat {
            unit: unit.to_string(),
            message: response
                .error
                .unwrap_or_else(|| format!("status {}", response.status)),
        });
    }

    response
        .results
        .into_iter()
        .map(|bar| {
            let ticker = match (symbol, bar.ticker.as_deref()) {
                (Some(s), _) => s.to_uppercase(),
                (None, Some(t)) => t.to_uppercase(),
                (None, None) => {
                    return Err(FetchError::DataFormat {
                        unit: unit.to_string(),
                        message: "grouped bar without ticker".to_string(),
                    })
                }
            };
            let date = DateTime::from_timestamp_millis(bar.t)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| FetchError::DataFormat {
                    unit: unit.to_string(),
                    message: format!("invalid timestamp {}", bar.t),
                })?;

            Ok(DailyBar {
                symbol: ticker,
                date,
                open: bar.o,
                high: bar.h,
                low: bar.l,
                close: bar.c,
                volume: bar.v,
                vwap: bar.vw,
                trades: bar.n,
            })
        })
        .collect()
}

/// Exponential backoff with jitter: a random delay in `[exp/2, exp]` where
/// `exp = base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(max);
    let ceiling = exp.as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
    Duration::from_millis(millis)
}

/// Delay for an upstream `Retry-After` hint: capped at `max`, plus up to
/// half of `base` of jitter so paused jobs do not resume in lockstep.
pub fn retry_after_delay(hint: Duration, base: Duration, max: Duration) -> Duration {
    let jitter = (base / 2).as_millis() as u64;
    let extra = if jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter)
    };
    (hint.min(max) + Duration::from_millis(extra)).min(max)
}
