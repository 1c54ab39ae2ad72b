//! Durable sinks draining the shared event channel.
//!
//! Enabled sinks are competing consumers of one channel: every event is
//! delivered to exactly one sink, whichever wins the receive. Each sink can
//! report a resume token derived from its medium's durable state.

pub mod file;
pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::event::Event;

pub use file::FilePublisher;
pub use kafka::KafkaPublisher;

/// Receiving half of the shared event channel, shared between sinks.
pub type SharedEvents = Arc<Mutex<mpsc::Receiver<Event>>>;

#[derive(Debug)]
pub enum PublisherError {
    /// The destination path cannot be used. Construction-time.
    Destination(String),
    /// The broker is unreachable or misconfigured. Construction-time.
    Broker(String),
    /// A file write failed after `processed` events were persisted.
    Write {
        processed: i64,
        source: std::io::Error,
    },
    /// A kafka delivery failed after `processed` events were persisted.
    Delivery {
        processed: i64,
        source: rdkafka::error::KafkaError,
    },
}

impl PublisherError {
    /// Events persisted by the current `read_and_publish` call before the
    /// error occurred.
    pub fn processed(&self) -> i64 {
        match self {
            PublisherError::Write { processed, .. } | PublisherError::Delivery { processed, .. } => {
                *processed
            }
            _ => 0,
        }
    }
}

impl std::fmt::Display for PublisherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublisherError::Destination(msg) => write!(f, "bad destination: {}", msg),
            PublisherError::Broker(msg) => write!(f, "bad broker: {}", msg),
            PublisherError::Write { source, .. } => write!(f, "error writing file: {}", source),
            PublisherError::Delivery { source, .. } => {
                write!(f, "error publishing to kafka: {}", source)
            }
        }
    }
}

impl std::error::Error for PublisherError {}

/// One durable sink. Sealed: the file and kafka publishers are the only
/// implementations, selected by configuration.
#[async_trait]
pub trait Publisher: Send {
    /// Resume token recovered from the sink's durable state, if any.
    /// Called once, at startup, before consumption begins.
    async fn resume_id(&mut self) -> Option<String>;

    /// Drain the shared channel until it closes (clean return with the
    /// number of events persisted) or a write fails.
    async fn read_and_publish(&mut self) -> Result<i64, PublisherError>;
}
