//! SSE wire-format reader for the wiki edit feed.
//!
//! [`notify`] opens one long-lived `text/event-stream` connection, decodes
//! the line grammar into [`Event`]s and pushes them onto the shared channel.
//! It never reconnects on its own; the coordinator owns that policy and uses
//! the returned last event id as the resume token for the next attempt.

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::event::Event;

const DEFAULT_EVENT_TYPE: &str = "message";

#[derive(Debug)]
pub enum SseError {
    /// Connection could not be established.
    Connect(reqwest::Error),
    /// The endpoint answered with a non-success status.
    BadStatus(reqwest::StatusCode),
    /// The connection died mid-stream.
    Transport(reqwest::Error),
    /// The upstream closed the stream (EOF). Resumable.
    StreamClosed,
    /// Nobody is reading the event channel. Fatal misconfiguration, not
    /// worth a reconnect.
    ChannelClosed,
}

impl std::fmt::Display for SseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SseError::Connect(e) => write!(f, "failed to connect to event stream: {}", e),
            SseError::BadStatus(s) => write!(f, "event stream returned status {}", s),
            SseError::Transport(e) => write!(f, "event stream read failed: {}", e),
            SseError::StreamClosed => write!(f, "event stream closed by upstream"),
            SseError::ChannelClosed => write!(f, "event channel has no receivers"),
        }
    }
}

impl std::error::Error for SseError {}

impl SseError {
    /// True when reconnecting with the last seen event id makes sense.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, SseError::ChannelClosed)
    }
}

/// Accumulates wire lines into one logical event.
#[derive(Debug, Default)]
struct EventBuilder {
    id: String,
    event_type: String,
    data: String,
}

impl EventBuilder {
    /// Feed one line (newline already stripped). Returns a complete event
    /// when the line is the blank dispatch marker and data has accumulated.
    fn push_line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            if self.data.is_empty() {
                // Keepalive gap or trailing blank line, nothing to dispatch.
                return None;
            }
            let event = Event {
                id: std::mem::take(&mut self.id),
                event_type: if self.event_type.is_empty() {
                    DEFAULT_EVENT_TYPE.to_string()
                } else {
                    std::mem::take(&mut self.event_type)
                },
                data: std::mem::take(&mut self.data),
            };
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("id: ") {
            self.id = value.to_string();
        } else if let Some(value) = line.strip_prefix("event: ") {
            self.event_type = value.to_string();
        } else if let Some(value) = line.strip_prefix("data: ") {
            // Continuation lines concatenate without a separator; the feed
            // splits large JSON bodies across multiple data lines.
            self.data.push_str(value);
        }
        None
    }
}

/// Connect to `endpoint` and stream events into `events` until the stream
/// ends or `stop` is raised.
///
/// When `resume_id` is set it is sent as the `Last-Event-ID` header so the
/// feed replays from just after that point. The last event id seen on the
/// wire is returned alongside the outcome in every exit path, so the caller
/// can persist it or hand it back in as the next resume token.
pub async fn notify(
    endpoint: &str,
    resume_id: Option<&str>,
    events: &mpsc::Sender<Event>,
    stop: &mut watch::Receiver<bool>,
) -> (String, Result<(), SseError>) {
    let mut last_event_id = String::new();

    if events.is_closed() {
        return (last_event_id, Err(SseError::ChannelClosed));
    }

    let client = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => return (last_event_id, Err(SseError::Connect(e))),
    };

    let mut request = client
        .get(endpoint)
        .header("Accept", "text/event-stream");
    if let Some(id) = resume_id {
        request = request.header("Last-Event-ID", id);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return (last_event_id, Err(SseError::Connect(e))),
    };
    if !response.status().is_success() {
        return (last_event_id, Err(SseError::BadStatus(response.status())));
    }

    log::debug!("connected to event stream at {}", endpoint);

    let mut body = response.bytes_stream();
    let mut builder = EventBuilder::default();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = stop.changed() => return (last_event_id, Ok(())),
            chunk = body.next() => chunk,
        };
        let bytes = match chunk {
            None => return (last_event_id, Err(SseError::StreamClosed)),
            Some(Err(e)) => return (last_event_id, Err(SseError::Transport(e))),
            Some(Ok(b)) => b,
        };
        buf.extend_from_slice(&bytes);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(event) = builder.push_line(line) {
                // Track the id even if the send below fails, so the caller
                // can still resume from it.
                last_event_id = event.id.clone();
                tokio::select! {
                    _ = stop.changed() => return (last_event_id, Ok(())),
                    sent = events.send(event) => {
                        if sent.is_err() {
                            return (last_event_id, Err(SseError::ChannelClosed));
                        }
                    }
                }
            }
        }
    }
}
