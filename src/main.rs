use std::net::SocketAddr;
use std::sync::Arc;

use dragnet::config::Config;
use dragnet::services::{DetectorRegistry, ScanPipeline, ScanScheduler};
use dragnet::sources::MarketDataClient;
use dragnet::AppState;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dragnet=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting Dragnet server on {}:{}", config.host, config.port);

    if config.market_data.api_key.is_empty() {
        warn!("MARKET_DATA_API_KEY not set, upstream calls will be rejected");
    }

    let client = Arc::new(MarketDataClient::new(config.market_data.clone())?);
    let registry = Arc::new(DetectorRegistry::with_builtins());
    let pipeline = ScanPipeline::new(client, registry.clone(), config.pipeline.clone());
    let scheduler = ScanScheduler::new(
        config.scheduler.clone(),
        &config.retention,
        pipeline,
        registry,
    );

    // Evict expired jobs
    {
        let scheduler = scheduler.clone();
        let interval = config.retention.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let evicted = scheduler.cleanup_expired().await;
                if evicted > 0 {
                    info!("Evicted {} expired scan jobs", evicted);
                } else {
                    debug!("Cleanup sweep found no expired scan jobs");
                }
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        scheduler,
    };
    let app = dragnet::app(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dragnet server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
