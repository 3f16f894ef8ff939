use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What to do with a submission when every concurrency slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Refuse with a retry hint.
    Reject,
    /// Hold the job in `queued` until a slot frees up.
    Queue,
}

impl QueuePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Some(QueuePolicy::Reject),
            "queue" => Some(QueuePolicy::Queue),
            _ => None,
        }
    }
}

/// Admission control and job lifecycle settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs allowed in `running` at once.
    pub max_concurrent_jobs: usize,
    /// Submissions allowed per client per window.
    pub submissions_per_window: u32,
    /// Length of the per-client rate-limit window.
    pub rate_window: Duration,
    pub queue_policy: QueuePolicy,
    /// Upper bound on jobs waiting in `queued` (only with `QueuePolicy::Queue`).
    pub max_queued: usize,
    /// Wall-clock budget per job.
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            submissions_per_window: 2,
            rate_window: Duration::from_secs(60),
            queue_policy: QueuePolicy::Reject,
            max_queued: 8,
            job_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Worker pool sizing and strategy selection for the scan pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// I/O-bound per-symbol fetch workers per job.
    pub fetch_workers: usize,
    /// CPU-bound detection workers per job.
    pub detect_workers: usize,
    /// Candidate count at and above which grouped-by-day fetch is used.
    pub break_even_symbols: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 64,
            detect_workers: default_detect_workers(),
            break_even_symbols: 8_000,
        }
    }
}

fn default_detect_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Upstream market data provider settings.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key: String,
    /// Concurrent in-flight connections to the provider.
    pub max_connections: usize,
    /// Upstream request budget per minute, shared by every job.
    pub requests_per_minute: u32,
    /// Total attempts for transient failures (timeouts, 5xx).
    pub max_attempts: u32,
    /// Extra attempts allowed when the provider answers 429.
    pub max_rate_limit_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key: String::new(),
            max_connections: 100,
            requests_per_minute: 6_000,
            max_attempts: 2,
            max_rate_limit_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Result retention settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long terminal jobs stay queryable.
    pub result_ttl: Duration,
    /// Interval of the background eviction sweep.
    pub cleanup_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub market_data: MarketDataConfig,
    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            scheduler: SchedulerConfig::default(),
            pipeline: PipelineConfig::default(),
            market_data: MarketDataConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let scheduler = SchedulerConfig {
            max_concurrent_jobs: env_parse(
                "DRAGNET_MAX_CONCURRENT_JOBS",
                defaults.scheduler.max_concurrent_jobs,
            )
            .max(1),
            submissions_per_window: env_parse(
                "DRAGNET_SUBMISSIONS_PER_WINDOW",
                defaults.scheduler.submissions_per_window,
            ),
            rate_window: env_secs("DRAGNET_RATE_WINDOW_SECS", defaults.scheduler.rate_window),
            queue_policy: env::var("DRAGNET_QUEUE_POLICY")
                .ok()
                .and_then(|v| QueuePolicy::from_str(&v))
                .unwrap_or(defaults.scheduler.queue_policy),
            max_queued: env_parse("DRAGNET_MAX_QUEUED", defaults.scheduler.max_queued),
            job_timeout: env_secs("DRAGNET_JOB_TIMEOUT_SECS", defaults.scheduler.job_timeout),
        };

        let pipeline = PipelineConfig {
            fetch_workers: env_parse("DRAGNET_FETCH_WORKERS", defaults.pipeline.fetch_workers)
                .max(1),
            detect_workers: env_parse("DRAGNET_DETECT_WORKERS", defaults.pipeline.detect_workers)
                .max(1),
            break_even_symbols: env_parse(
                "DRAGNET_BREAK_EVEN_SYMBOLS",
                defaults.pipeline.break_even_symbols,
            ),
        };

        let market_data = MarketDataConfig {
            base_url: env::var("MARKET_DATA_URL").unwrap_or(defaults.market_data.base_url),
            api_key: env::var("MARKET_DATA_API_KEY").unwrap_or_default(),
            max_connections: env_parse(
                "MARKET_DATA_MAX_CONNECTIONS",
                defaults.market_data.max_connections,
            )
            .max(1),
            requests_per_minute: env_parse(
                "MARKET_DATA_RPM",
                defaults.market_data.requests_per_minute,
            )
            .max(1),
            max_attempts: env_parse("MARKET_DATA_MAX_ATTEMPTS", defaults.market_data.max_attempts)
                .max(1),
            max_rate_limit_retries: env_parse(
                "MARKET_DATA_MAX_RATE_LIMIT_RETRIES",
                defaults.market_data.max_rate_limit_retries,
            ),
            backoff_base: defaults.market_data.backoff_base,
            backoff_max: defaults.market_data.backoff_max,
            request_timeout: env_secs(
                "MARKET_DATA_TIMEOUT_SECS",
                defaults.market_data.request_timeout,
            ),
        };

        let retention = RetentionConfig {
            result_ttl: env_secs("DRAGNET_RESULT_TTL_SECS", defaults.retention.result_ttl),
            cleanup_interval: env_secs(
                "DRAGNET_CLEANUP_INTERVAL_SECS",
                defaults.retention.cleanup_interval,
            ),
        };

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port),
            scheduler,
            pipeline,
            market_data,
            retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3001);
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.scheduler.submissions_per_window, 2);
        assert_eq!(config.scheduler.rate_window, Duration::from_secs(60));
        assert_eq!(config.scheduler.queue_policy, QueuePolicy::Reject);
        assert_eq!(config.pipeline.break_even_symbols, 8_000);
        assert!(config.pipeline.detect_workers >= 1);
        assert_eq!(config.market_data.max_connections, 100);
        assert_eq!(config.market_data.max_attempts, 2);
        assert_eq!(config.retention.result_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_fetch_pool_larger_than_detect_pool_by_default() {
        let config = PipelineConfig {
            detect_workers: 8,
            ..Default::default()
        };
        assert!(config.fetch_workers > config.detect_workers);
    }

    #[test]
    fn test_queue_policy_parsing() {
        assert_eq!(QueuePolicy::from_str("queue"), Some(QueuePolicy::Queue));
        assert_eq!(QueuePolicy::from_str(" REJECT "), Some(QueuePolicy::Reject));
        assert_eq!(QueuePolicy::from_str("drop"), None);
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        env::set_var("DRAGNET_TEST_ENV_PARSE", "not-a-number");
        assert_eq!(env_parse("DRAGNET_TEST_ENV_PARSE", 7usize), 7);
        env::set_var("DRAGNET_TEST_ENV_PARSE", "12");
        assert_eq!(env_parse("DRAGNET_TEST_ENV_PARSE", 7usize), 12);
        env::remove_var("DRAGNET_TEST_ENV_PARSE");
    }
}
