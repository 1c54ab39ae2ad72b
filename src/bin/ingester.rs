//! Ingest binary: consumes the wiki edit stream and fans events out to the
//! enabled sinks.
//!
//! ## Usage
//!
//! ```bash
//! PLEIADES_FILE_ENABLE=true cargo run --release --bin ingester
//! ```
//!
//! ## Environment Variables
//!
//! - PLEIADES_ENDPOINT - SSE feed URL (default: the Wikimedia recentchange stream)
//! - PLEIADES_FILE_ENABLE / PLEIADES_FILE_DESTINATION - File sink (default dir: ./events)
//! - PLEIADES_KAFKA_ENABLE / PLEIADES_KAFKA_BROKER / PLEIADES_KAFKA_TOPIC - Kafka sink
//! - PLEIADES_RESUME - Resume from the newest sink state (default: false)
//! - PLEIADES_CHANNEL_BUFFER - Event channel capacity (default: 1000)
//! - PLEIADES_METRICS_ADDR - Prometheus scrape listener (optional)
//! - RUST_LOG - Logging level (optional, default: info)

use pleiades::config::IngesterConfig;
use pleiades::coordinator::Coordinator;
use pleiades::metrics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = IngesterConfig::from_env()?;
    metrics::init(config.metrics_addr);

    log::info!("🚀 Starting Pleiades ingester");
    log::info!("   Endpoint: {}", config.endpoint);
    log::info!(
        "   File sink: {}",
        config.file_destination.as_deref().unwrap_or("disabled")
    );
    match &config.kafka {
        Some(kafka) => log::info!("   Kafka sink: {} ({})", kafka.broker, kafka.topic),
        None => log::info!("   Kafka sink: disabled"),
    }
    log::info!("   Resume: {}", config.resume);

    let coordinator = Coordinator::new(config);
    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Shutting down...");
                stop.stop();
            }
            Err(e) => log::error!("Failed to listen for CTRL+C: {}", e),
        }
    });

    log::info!("Starting to consume events");
    let last_event_id = coordinator.start().await?;
    log::info!("Shutdown complete");
    log::info!("Last seen Event ID: {}", last_event_id);
    Ok(())
}
