//! Metric names and recorder installation.
//!
//! All counters and histograms are emitted through the `metrics` facade;
//! the Prometheus recorder is installed once per process by the binaries.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Events written to a sink.
pub const PUBLISH_EVENTS_TOTAL: &str = "pleiades_publish_events_total";

/// Sink write failures, by failure category.
pub const PUBLISH_FILE_ERRORS_TOTAL: &str = "pleiades_publish_file_errors_total";
pub const PUBLISH_KAFKA_ERRORS_TOTAL: &str = "pleiades_publish_kafka_errors_total";

/// Restarts of supervised tasks, by component.
pub const TASK_RESTARTS_TOTAL: &str = "pleiades_task_restarts_total";

/// Events fully aggregated into the counter store.
pub const AGGREGATOR_EVENTS_TOTAL: &str = "pleiades_aggregator_event_count_total";

/// Per-event processing latency, by source.
pub const FILE_PROCESS_DURATION_MS: &str =
    "pleiades_aggregator_file_process_duration_milliseconds";
pub const KAFKA_PROCESS_DURATION_MS: &str =
    "pleiades_aggregator_kafka_process_duration_milliseconds";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus recorder, optionally serving a scrape endpoint.
///
/// Must be called from within the tokio runtime when `listen` is set.
/// Safe to call more than once; later calls are no-ops.
pub fn init(listen: Option<SocketAddr>) {
    INSTALLED.get_or_init(|| {
        let mut builder = PrometheusBuilder::new();
        if let Some(addr) = listen {
            builder = builder.with_http_listener(addr);
        }
        builder
            .install()
            .expect("failed to install prometheus recorder");
        describe_counter!(PUBLISH_EVENTS_TOTAL, "Total events published to sinks");
        describe_counter!(
            PUBLISH_FILE_ERRORS_TOTAL,
            "File sink errors by failure category"
        );
        describe_counter!(
            PUBLISH_KAFKA_ERRORS_TOTAL,
            "Kafka sink errors by failure category"
        );
        describe_counter!(TASK_RESTARTS_TOTAL, "Restarts of supervised tasks");
        describe_counter!(
            AGGREGATOR_EVENTS_TOTAL,
            "Events aggregated into the counter store"
        );
        describe_histogram!(FILE_PROCESS_DURATION_MS, "Time taken to process files");
        describe_histogram!(
            KAFKA_PROCESS_DURATION_MS,
            "Time taken to process events from kafka"
        );
    });
}
