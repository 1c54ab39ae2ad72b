//! File-backed sink: one event per sequentially numbered file.
//!
//! Files are written atomically (temp file + rename) as two lines: the
//! event id, then the raw payload. The newest file's id line doubles as the
//! resume token after a restart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use metrics::counter;

use crate::event::Event;
use crate::metrics::{PUBLISH_EVENTS_TOTAL, PUBLISH_FILE_ERRORS_TOTAL};
use crate::publisher::{Publisher, PublisherError, SharedEvents};

pub struct FilePublisher {
    destination: PathBuf,
    source: SharedEvents,
    next_seq: u64,
    last_seq: Option<u64>,
    msg_count: i64,
}

impl FilePublisher {
    /// Create the destination directory if needed and pick up numbering
    /// after any files already present.
    pub fn new(source: SharedEvents, destination: &str) -> Result<Self, PublisherError> {
        let destination = PathBuf::from(destination);
        match std::fs::metadata(&destination) {
            Ok(meta) if meta.is_file() => {
                return Err(PublisherError::Destination(format!(
                    "destination path {} exists as file",
                    destination.display()
                )));
            }
            Ok(_) => {}
            Err(_) => {
                std::fs::create_dir_all(&destination).map_err(|e| {
                    PublisherError::Destination(format!(
                        "failed to create destination directory: {}",
                        e
                    ))
                })?;
            }
        }
        let last_seq = last_sequence(&destination)?;
        Ok(Self {
            destination,
            source,
            next_seq: last_seq.map(|n| n + 1).unwrap_or(0),
            last_seq,
            msg_count: 0,
        })
    }

    async fn write_event(&mut self, event: &Event) -> Result<(), PublisherError> {
        let seq = self.next_seq;
        let tmp = self.destination.join(format!(".event-{}.tmp", seq));
        let path = self.destination.join(format!("event-{}.dat", seq));
        let contents = format!("{}\n{}\n", event.id, event.data);

        let write = async {
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            counter!(PUBLISH_FILE_ERRORS_TOTAL, "type" => "file_write").increment(1);
            return Err(PublisherError::Write {
                processed: self.msg_count,
                source: e,
            });
        }

        self.next_seq += 1;
        self.last_seq = Some(seq);
        counter!(PUBLISH_EVENTS_TOTAL).increment(1);
        Ok(())
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn resume_id(&mut self) -> Option<String> {
        let seq = self.last_seq?;
        let path = self.destination.join(format!("event-{}.dat", seq));
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.lines().next().map(str::to_string).filter(|id| !id.is_empty()),
            Err(e) => {
                log::warn!("failed to read resume id from {}: {}", path.display(), e);
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
            self.write_event(&event).await?;
        }
    }
}

fn last_sequence(destination: &Path) -> Result<Option<u64>, PublisherError> {
    let entries = std::fs::read_dir(destination).map_err(|e| {
        PublisherError::Destination(format!(
            "failed to list destination directory {}: {}",
            destination.display(),
            e
        ))
    })?;
    let mut last = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = name
            .strip_prefix("event-")
            .and_then(|n| n.strip_suffix(".dat"))
            .and_then(|n| n.parse::<u64>().ok())
        {
            last = last.max(Some(seq));
        }
    }
    Ok(last)
}
