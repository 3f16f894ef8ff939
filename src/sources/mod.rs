pub mod market_data;
pub mod rate_limiter;
pub mod universe;

pub use market_data::{backoff_delay, MarketDataClient, MarketDataSource};
pub use rate_limiter::RateLimiter;
pub use universe::UniverseFetcher;
