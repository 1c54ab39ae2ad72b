//! Kafka-consuming aggregation source.
//!
//! Reads the event topic a kafka sink wrote (id as key, payload as value)
//! through a consumer group with interval-based offset commits. A read
//! timeout is idleness, not failure; real errors bubble to the supervision
//! loop, and this source is the one place where a run of consecutive
//! failures is allowed to take the whole process down rather than hot-loop
//! against an unreachable broker.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::aggregator::{process_event, AggregatorError, EventSource};
use crate::config::KafkaConfig;
use crate::counters::Counters;
use crate::metrics::KAFKA_PROCESS_DURATION_MS;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const CONSUMER_GROUP: &str = "pleiades-aggregator-group";

/// Consecutive failed runs tolerated before the process bails out.
const FAILURE_LIMIT: u32 = 5;

pub struct KafkaSource {
    consumer: StreamConsumer,
    store: Box<dyn Counters>,
}

impl KafkaSource {
    pub fn new(store: Box<dyn Counters>, config: &KafkaConfig) -> Result<Self, AggregatorError> {
        if config.broker.is_empty() || config.topic.is_empty() {
            return Err(AggregatorError::NoSource(
                "no source kafka details provided".to_string(),
            ));
        }
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker)
            .set("group.id", CONSUMER_GROUP)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(AggregatorError::Kafka)?;
        consumer
            .subscribe(&[&config.topic])
            .map_err(AggregatorError::Kafka)?;
        Ok(Self { consumer, store })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    fn component(&self) -> &'static str {
        "kafka_aggregator"
    }

    fn failure_limit(&self) -> Option<u32> {
        Some(FAILURE_LIMIT)
    }

    /// One unit of work: read until a message arrives, process it, return
    /// the outcome so the supervision loop can account for it.
    async fn run(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), AggregatorError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let received = tokio::select! {
                _ = stop.changed() => return Ok(()),
                received = timeout(READ_TIMEOUT, self.consumer.recv()) => received,
            };
            // Copy id and payload out so the borrowed message is released
            // before the increments run.
            let (id, data) = match received {
                Err(_) => {
                    log::debug!("No new messages on topic for 5 seconds. Will try again");
                    continue;
                }
                Ok(Err(e)) => return Err(AggregatorError::Kafka(e)),
                Ok(Ok(message)) => (
                    message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned())
                        .unwrap_or_default(),
                    message
                        .payload()
                        .map(|p| String::from_utf8_lossy(p).into_owned())
                        .unwrap_or_default(),
                ),
            };

            let started = Instant::now();
            let result = process_event(self.store.as_ref(), &id, &data).await;
            histogram!(KAFKA_PROCESS_DURATION_MS).record(started.elapsed().as_millis() as f64);
            return result;
        }
    }
}
