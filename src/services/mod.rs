pub mod detector;
pub mod fetch_stage;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod result_store;
pub mod scheduler;
pub mod smart_filter;
pub mod strategy;

pub use detector::{Detector, DetectorParams, DetectorRegistry};
pub use fetch_stage::FetchStage;
pub use pipeline::ScanPipeline;
pub use progress::{ProgressHandle, ProgressReporter};
pub use rate_limit::ClientRateLimiter;
pub use result_store::ResultStore;
pub use scheduler::{ResultLookup, ScanScheduler};
pub use smart_filter::SmartFilter;
pub use strategy::FetchStrategySelector;
