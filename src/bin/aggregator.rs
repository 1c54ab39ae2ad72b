//! Aggregation binary: folds published events into counter-store counters.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin aggregator -- --source file
//! cargo run --release --bin aggregator -- --source kafka
//! ```
//!
//! ## Environment Variables
//!
//! - PLEIADES_FILE_SOURCE - Directory the file sink writes to (default: ./events)
//! - PLEIADES_KAFKA_BROKER / PLEIADES_KAFKA_TOPIC - Required with --source kafka
//! - PLEIADES_REDIS_ADDR - Counter store address (default: localhost:6379)
//! - PLEIADES_METRICS_ADDR - Prometheus scrape listener (optional)
//! - RUST_LOG - Logging level (optional, default: info)

use pleiades::aggregator::{self, AggregatorError, EventSource, FileSource, KafkaSource};
use pleiades::config::{AggregatorConfig, SourceType};
use pleiades::counters::RedisCounters;
use pleiades::metrics;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = AggregatorConfig::from_env()?;
    metrics::init(config.metrics_addr);

    log::info!("🚀 Starting Pleiades aggregator");
    log::info!("   Source: {:?}", config.source);
    log::info!("   Counter store: {}", config.redis_addr);

    let store = RedisCounters::connect(&config.redis_addr)
        .await
        .map_err(|e| format!("failed to connect to Redis at {}: {}", config.redis_addr, e))?;

    let source: Box<dyn EventSource> = match (config.source, &config.kafka) {
        (SourceType::File, _) => {
            log::info!("   Directory: {}", config.file_source);
            Box::new(FileSource::new(Box::new(store), &config.file_source)?)
        }
        (SourceType::Kafka, Some(kafka)) => {
            log::info!("   Broker: {}  Topic: {}", kafka.broker, kafka.topic);
            Box::new(KafkaSource::new(Box::new(store), kafka)?)
        }
        (SourceType::Kafka, None) => {
            return Err("kafka source selected but no broker/topic configured".into());
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Shutting down...");
                let _ = stop_tx.send(true);
            }
            Err(e) => log::error!("Failed to listen for CTRL+C: {}", e),
        }
    });

    match aggregator::start(source, stop_rx).await {
        Ok(()) => {
            log::info!("Shutdown complete");
            Ok(())
        }
        Err(e @ AggregatorError::TooManyFailures(_)) => {
            log::error!("Bailing after repeated failed restarts: {}", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
