//! Supervised ingest pipeline: stream reader feeding sinks over one shared
//! bounded channel.
//!
//! The coordinator owns the channel and the stop signal. Shutdown is phased:
//! raise the stop signal, wait for the producer-side tasks (reader, spinner)
//! to finish, let the channel close by dropping its last sender, then wait
//! for the sinks to drain what is buffered. The channel therefore can never
//! close while a producer could still write to it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::IngesterConfig;
use crate::publisher::{FilePublisher, KafkaPublisher, Publisher, SharedEvents};
use crate::spinner::{self, Spinner};
use crate::sse;
use crate::supervisor::{Supervisor, TaskState};

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const SPINNER_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum CoordinatorError {
    Sink(crate::publisher::PublisherError),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Sink(e) => write!(f, "failed to initialize publisher: {}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<crate::publisher::PublisherError> for CoordinatorError {
    fn from(err: crate::publisher::PublisherError) -> Self {
        CoordinatorError::Sink(err)
    }
}

/// Raises the coordinator's stop signal. Cheap to clone into a signal
/// handler task.
#[derive(Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Coordinator {
    config: IngesterConfig,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(config: IngesterConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            stop_tx,
            stop_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run the pipeline until the stop signal is raised, then drain and
    /// return the last event id seen on the wire.
    pub async fn start(self) -> Result<String, CoordinatorError> {
        let (events_tx, events_rx) = mpsc::channel(self.config.channel_buffer);
        let shared_rx: SharedEvents = Arc::new(Mutex::new(events_rx));

        let mut resume_id: Option<String> = None;
        let mut sink_tasks: Vec<JoinHandle<()>> = Vec::new();

        if let Some(destination) = &self.config.file_destination {
            let mut publisher = FilePublisher::new(shared_rx.clone(), destination)?;
            self.negotiate_resume(&mut publisher, &mut resume_id).await;
            sink_tasks.push(spawn_sink("file_publisher", Box::new(publisher), self.stop_rx.clone()));
            log::debug!("file publisher is up");
        }

        if let Some(kafka) = &self.config.kafka {
            let mut publisher = KafkaPublisher::new(shared_rx.clone(), kafka)?;
            publisher.validate_connection()?;
            self.negotiate_resume(&mut publisher, &mut resume_id).await;
            sink_tasks.push(spawn_sink("kafka_publisher", Box::new(publisher), self.stop_rx.clone()));
            log::debug!("kafka publisher is up");
        }

        let reader = spawn_reader(
            self.config.endpoint.clone(),
            resume_id,
            events_tx,
            self.stop_rx.clone(),
        );
        log::debug!("stream reader is up");

        let ticker = if spinner::is_tty() {
            Some(spawn_spinner(self.stop_rx.clone()))
        } else {
            log::info!("Terminal is not a TTY, not displaying progress indicator");
            None
        };

        // Phase barrier: producers first. The reader task owns the only
        // sender, so the channel closes exactly when it finishes.
        let last_event_id = match reader.await {
            Ok(id) => id,
            Err(e) => {
                log::error!("stream reader task panicked: {}", e);
                String::new()
            }
        };
        // The reader may have exited on its own (fatal error); make sure the
        // ticker and the sinks' restart loops observe shutdown either way.
        let _ = self.stop_tx.send(true);
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        // Now the sinks can drain whatever is still buffered and exit.
        for task in sink_tasks {
            let _ = task.await;
        }

        Ok(last_event_id)
    }

    /// First sink to report a non-empty token wins; tokens from multiple
    /// sinks are not reconciled.
    async fn negotiate_resume(&self, publisher: &mut dyn Publisher, resume_id: &mut Option<String>) {
        if !self.config.resume || resume_id.is_some() {
            return;
        }
        match publisher.resume_id().await {
            Some(id) => {
                log::info!("Resume Event ID found: {}", id);
                *resume_id = Some(id);
            }
            None => log::info!("No resume ID found"),
        }
    }
}

fn spawn_sink(
    component: &'static str,
    mut publisher: Box<dyn Publisher>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut supervisor = Supervisor::new(component);
        loop {
            if *stop.borrow() {
                break;
            }
            match publisher.read_and_publish().await {
                // A clean return means the channel closed; it stays closed,
                // so there is nothing left to restart for.
                Ok(count) => {
                    log::info!("{} finished after processing {} events", component, count);
                    supervisor.task_restarted(false);
                    break;
                }
                Err(e) => {
                    log::error!(
                        "{} exited with error after processing {} events: {}",
                        component,
                        e.processed(),
                        e
                    );
                    supervisor.task_restarted(true);
                }
            }
        }
        supervisor.stop();
    })
}

fn spawn_reader(
    endpoint: String,
    resume_id: Option<String>,
    events: mpsc::Sender<crate::event::Event>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut supervisor = Supervisor::new("sse_reader");
        let mut resume_id = resume_id;
        let mut last_event_id = String::new();
        loop {
            if *stop.borrow() {
                break;
            }
            let (eid, result) = sse::notify(&endpoint, resume_id.as_deref(), &events, &mut stop).await;
            if !eid.is_empty() {
                last_event_id = eid;
                resume_id = Some(last_event_id.clone());
            }
            match result {
                Ok(()) => {
                    supervisor.task_restarted(false);
                }
                Err(e) if e.is_resumable() => {
                    log::error!("Event stream reader exited with error: {}", e);
                    if supervisor.task_restarted(true) == TaskState::Backoff {
                        tokio::select! {
                            _ = stop.changed() => {}
                            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                        }
                    }
                }
                Err(e) => {
                    // Nobody left to consume events; restarting cannot help.
                    log::error!("Event stream reader exited with fatal error: {}", e);
                    supervisor.task_restarted(true);
                    break;
                }
            }
        }
        supervisor.stop();
        last_event_id
    })
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
                _ = tokio::time::sleep(SPINNER_PERIOD) => {}
            }
        }
    })
}
