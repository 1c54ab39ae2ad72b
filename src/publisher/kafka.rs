//! Kafka-backed sink: events appended to one topic, id as key.
//!
//! Delivery is at-least-once. The resume token is recovered by peeking at
//! the key of the newest message on the topic.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::Producer;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use crate::config::KafkaConfig;
use crate::event::Event;
use crate::metrics::{PUBLISH_EVENTS_TOTAL, PUBLISH_KAFKA_ERRORS_TOTAL};
use crate::publisher::{Publisher, PublisherError, SharedEvents};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaPublisher {
    broker: String,
    topic: String,
    producer: FutureProducer,
    source: SharedEvents,
    msg_count: i64,
}

impl KafkaPublisher {
    pub fn new(source: SharedEvents, config: &KafkaConfig) -> Result<Self, PublisherError> {
        if config.broker.is_empty() || config.topic.is_empty() {
            return Err(PublisherError::Broker(
                "no broker or topic configured".to_string(),
            ));
        }
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| PublisherError::Broker(e.to_string()))?;
        Ok(Self {
            broker: config.broker.clone(),
            topic: config.topic.clone(),
            producer,
            source,
            msg_count: 0,
        })
    }

    /// Confirm the broker answers metadata requests for the topic before
    /// any event flows. Failure here is a startup error, not a restart.
    pub fn validate_connection(&self) -> Result<(), PublisherError> {
        self.producer
            .client()
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
            .map_err(|e| PublisherError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn publish(&mut self, event: &Event) -> Result<(), PublisherError> {
        let record = FutureRecord::to(&self.topic)
            .key(&event.id)
            .payload(&event.data);
        match self.producer.send(record, Timeout::After(DELIVERY_TIMEOUT)).await {
            Ok(_) => {
                counter!(PUBLISH_EVENTS_TOTAL).increment(1);
                Ok(())
            }
            Err((e, _)) => {
                counter!(PUBLISH_KAFKA_ERRORS_TOTAL, "type" => "kafka_write").increment(1);
                Err(PublisherError::Delivery {
                    processed: self.msg_count,
                    source: e,
                })
            }
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    /// Peek at the newest message on partition 0 and return its key, the
    /// event id it was published under.
    async fn resume_id(&mut self) -> Option<String> {
        let broker = self.broker.clone();
        let topic = self.topic.clone();
        let peek = tokio::task::spawn_blocking(move || -> Option<String> {
            let consumer: BaseConsumer = ClientConfig::new()
                .set("bootstrap.servers", &broker)
                .set("group.id", "pleiades-resume-probe")
                .set("enable.auto.commit", "false")
                .create()
                .ok()?;
            let (low, high) = consumer
                .fetch_watermarks(&topic, 0, METADATA_TIMEOUT)
                .ok()?;
            if high <= low {
                return None;
            }
            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(&topic, 0, Offset::Offset(high - 1))
                .ok()?;
            consumer.assign(&assignment).ok()?;
            match consumer.poll(METADATA_TIMEOUT) {
                Some(Ok(message)) => message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                _ => None,
            }
        });
        match peek.await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("resume probe task failed: {}", e);
                None
            }
        }
    }

    async fn read_and_publish(&mut self) -> Result<i64, PublisherError> {
        self.msg_count = 0;
        loop {
            let event = { self.source.lock().await.recv().await };
            let Some(event) = event else {
                return Ok(self.msg_count);
            };
            self.msg_count += 1;
            self.publish(&event).await?;
        }
    }
}
