//! Aggregation engine: reads published events back out of a sink medium
//! and folds them into running counters.
//!
//! Each event yields a set of counter keys (one increment each) and a
//! signed growth delta. Every key is incremented twice: once bare
//! (cumulative forever) and once under a `day_<n>_` prefix derived from the
//! event timestamp, giving a historical per-day series. The two increments
//! are not atomic as a batch; a crash in between leaves the pair skewed by
//! one, which the at-least-once design accepts.

pub mod file;
pub mod kafka;

use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::counters::{CounterError, Counters};
use crate::event::{parse_timestamp, EventError};
use crate::metrics::AGGREGATOR_EVENTS_TOTAL;
use crate::spinner::{self, Spinner};
use crate::supervisor::{Supervisor, TaskState};

pub use file::FileSource;
pub use kafka::KafkaSource;

/// Running counter for total content growth across all edits.
pub const GROWTH_COUNTER: &str = "pleiades_growth";

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug)]
pub enum AggregatorError {
    /// The configured source does not exist or is unusable. Construction-time.
    NoSource(String),
    /// The payload is not a wiki edit document.
    Payload(serde_json::Error),
    /// The event id does not decode to a timestamp.
    EventId(EventError),
    /// A source file does not hold the id line plus payload line.
    Malformed(String),
    Counter(CounterError),
    Io(std::io::Error),
    Kafka(rdkafka::error::KafkaError),
    /// The consecutive-failure limit was exceeded; the process should exit.
    TooManyFailures(&'static str),
}

impl std::fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorError::NoSource(msg) => write!(f, "no usable source: {}", msg),
            AggregatorError::Payload(e) => write!(f, "error decoding event payload: {}", e),
            AggregatorError::EventId(e) => {
                write!(f, "failed to parse timestamp from event id: {}", e)
            }
            AggregatorError::Malformed(msg) => write!(f, "{}", msg),
            AggregatorError::Counter(e) => write!(f, "failed to update counter: {}", e),
            AggregatorError::Io(e) => write!(f, "source error: {}", e),
            AggregatorError::Kafka(e) => write!(f, "kafka error: {}", e),
            AggregatorError::TooManyFailures(component) => {
                write!(f, "{} failed too many times in a row", component)
            }
        }
    }
}

impl std::error::Error for AggregatorError {}

impl From<CounterError> for AggregatorError {
    fn from(err: CounterError) -> Self {
        AggregatorError::Counter(err)
    }
}

/// Counter deltas decoded from one event payload: keys to increment by one
/// and the signed content-length change.
#[derive(Debug, PartialEq, Eq)]
pub struct CounterSet {
    pub keys: Vec<String>,
    pub length_delta: i64,
}

#[derive(Deserialize)]
struct EditPayload {
    wiki: Option<String>,
    #[serde(rename = "type")]
    edit_type: Option<String>,
    length: Option<EditLength>,
}

#[derive(Deserialize)]
struct EditLength {
    old: Option<i64>,
    new: Option<i64>,
}

/// Decode one edit payload into its counter deltas: the wiki name is a key,
/// and so is `<wiki>_<edit type>` when the edit type is present.
pub fn counters_from_event_data(data: &str) -> Result<CounterSet, AggregatorError> {
    let edit: EditPayload = serde_json::from_str(data).map_err(AggregatorError::Payload)?;
    let mut keys = Vec::new();
    if let Some(wiki) = &edit.wiki {
        keys.push(wiki.clone());
        if let Some(edit_type) = &edit.edit_type {
            keys.push(format!("{}_{}", wiki, edit_type));
        }
    }
    let length_delta = edit
        .length
        .map(|l| l.new.unwrap_or(0) - l.old.unwrap_or(0))
        .unwrap_or(0);
    Ok(CounterSet { keys, length_delta })
}

/// Apply one event to the counter store: bare and day-prefixed increments
/// for every key, plus the growth counter pair. Any failed increment fails
/// the event; the source's retry policy decides what happens next.
pub async fn process_event(
    store: &dyn Counters,
    id: &str,
    data: &str,
) -> Result<(), AggregatorError> {
    let counters = counters_from_event_data(data)?;
    let timestamp = parse_timestamp(id).map_err(AggregatorError::EventId)?;
    let julian_day = timestamp / MILLIS_PER_DAY;
    let day_prefix = format!("day_{}_", julian_day);

    for key in &counters.keys {
        store.incr(key).await?;
        store.incr(&format!("{}{}", day_prefix, key)).await?;
    }
    store.incr_by(GROWTH_COUNTER, counters.length_delta).await?;
    store
        .incr_by(
            &format!("{}{}", day_prefix, GROWTH_COUNTER),
            counters.length_delta,
        )
        .await?;

    counter!(AGGREGATOR_EVENTS_TOTAL).increment(1);
    Ok(())
}

/// One aggregation source. Sealed: the file and kafka sources are the only
/// implementations, selected by configuration. `run` performs work until
/// the stop signal, a unit-of-work boundary, or an error, and is restarted
/// by [`start`].
#[async_trait]
pub trait EventSource: Send {
    fn component(&self) -> &'static str;

    /// Consecutive failed runs tolerated before the process gives up.
    fn failure_limit(&self) -> Option<u32> {
        None
    }

    async fn run(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), AggregatorError>;
}

/// Supervise an aggregation source until the stop signal is raised or its
/// failure limit trips.
pub async fn start(
    mut source: Box<dyn EventSource>,
    stop: watch::Receiver<bool>,
) -> Result<(), AggregatorError> {
    let component = source.component();
    let mut supervisor = match source.failure_limit() {
        Some(limit) => Supervisor::with_failure_limit(component, limit),
        None => Supervisor::new(component),
    };

    let ticker = if spinner::is_tty() {
        Some(spawn_spinner(stop.clone()))
    } else {
        log::info!("Terminal is not a TTY, not displaying progress indicator");
        None
    };

    let mut stop_rx = stop;
    let result = loop {
        if *stop_rx.borrow() {
            supervisor.stop();
            break Ok(());
        }
        match source.run(&mut stop_rx).await {
            Ok(()) => supervisor.task_succeeded(),
            Err(e) => {
                log::error!("Aggregator exited with error: {}", e);
                if supervisor.task_restarted(true) == TaskState::Failed {
                    break Err(AggregatorError::TooManyFailures(component));
                }
            }
        }
    };

    if let Some(ticker) = ticker {
        // The loop may have broken out of its own accord (failure limit)
        // with the stop signal never raised.
        ticker.abort();
        let _ = ticker.await;
    }
    result
}

fn spawn_spinner(mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut spinner = Spinner::new("Processing... ");
        loop {
            if *stop.borrow() {
                break;
            }
            spinner.tick();
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::memory::MemoryCounters;

    fn edit_payload(wiki: &str, old: i64, new: i64) -> String {
        format!(
            r#"{{"wiki":"{}","length":{{"old":{},"new":{}}}}}"#,
            wiki, old, new
        )
    }

    fn id_with_timestamp(ts: i64) -> String {
        format!(
            r#"[{{"topic":"eqiad.mediawiki.recentchange","partition":0,"timestamp":{}}},{{"topic":"codfw.mediawiki.recentchange","partition":0,"offset":-1}}]"#,
            ts
        )
    }

    #[test]
    fn derives_keys_from_wiki_and_edit_type() {
        let counters = counters_from_event_data(
            r#"{"wiki":"hewiki","type":"edit","length":{"old":4905,"new":4910}}"#,
        )
        .unwrap();
        assert_eq!(counters.keys, vec!["hewiki", "hewiki_edit"]);
        assert_eq!(counters.length_delta, 5);
    }

    #[test]
    fn missing_length_means_zero_delta() {
        let counters = counters_from_event_data(r#"{"wiki":"enwiki"}"#).unwrap();
        assert_eq!(counters.keys, vec!["enwiki"]);
        assert_eq!(counters.length_delta, 0);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(matches!(
            counters_from_event_data("not json"),
            Err(AggregatorError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn applies_bare_and_day_prefixed_increments() {
        let store = MemoryCounters::default();
        let id = id_with_timestamp(1597056638001);
        let data = edit_payload("wiki_x", 0, 3);

        process_event(&store, &id, &data).await.unwrap();
        process_event(&store, &id_with_timestamp(1597056638002), &data)
            .await
            .unwrap();

        // 1597056638001 ms / 86_400_000 ms per day = day index 18484.
        assert_eq!(store.get("wiki_x"), 2);
        assert_eq!(store.get("day_18484_wiki_x"), 2);
        assert_eq!(store.get(GROWTH_COUNTER), 6);
        assert_eq!(store.get("day_18484_pleiades_growth"), 6);
    }

    #[tokio::test]
    async fn same_day_increments_accumulate() {
        let store = MemoryCounters::default();
        let id = id_with_timestamp(1597056638001);

        process_event(&store, &id, &edit_payload("enwiki", 10, 13))
            .await
            .unwrap();
        process_event(&store, &id, &edit_payload("enwiki", 0, 4))
            .await
            .unwrap();

        assert_eq!(store.get("enwiki"), 2);
        assert_eq!(store.get("day_18484_enwiki"), 2);
        assert_eq!(store.get(GROWTH_COUNTER), 7);
        assert_eq!(store.get("day_18484_pleiades_growth"), 7);
    }

    #[tokio::test]
    async fn id_without_timestamp_fails_before_any_increment() {
        let store = MemoryCounters::default();
        let id = r#"[{"topic":"eqiad.mediawiki.recentchange","partition":0,"offset":7}]"#;

        let result = process_event(&store, id, &edit_payload("enwiki", 0, 1)).await;
        assert!(matches!(result, Err(AggregatorError::EventId(_))));
        assert_eq!(store.get("enwiki"), 0);
        assert_eq!(store.get(GROWTH_COUNTER), 0);
    }

    #[tokio::test]
    async fn failed_increment_aborts_the_event() {
        let store = MemoryCounters::default();
        store
            .fail_increments
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let result = process_event(
            &store,
            &id_with_timestamp(1597056638001),
            &edit_payload("enwiki", 0, 1),
        )
        .await;
        assert!(matches!(result, Err(AggregatorError::Counter(_))));
    }
}
