//! Directory-polling aggregation source.
//!
//! Processes the numbered event files a file sink wrote: line 1 is the
//! event id, line 2 the payload. A fully processed file is acknowledged by
//! deletion. Files that fail to decode stay behind for manual inspection
//! and are logged on every pass; an empty directory means wait and retry
//! while keeping an eye on the counter store.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use tokio::sync::watch;

use crate::aggregator::{process_event, AggregatorError, EventSource};
use crate::counters::Counters;
use crate::metrics::FILE_PROCESS_DURATION_MS;

const IDLE_WAIT: Duration = Duration::from_secs(5);

pub struct FileSource {
    source: PathBuf,
    store: Box<dyn Counters>,
}

impl FileSource {
    pub fn new(store: Box<dyn Counters>, source: &str) -> Result<Self, AggregatorError> {
        if source.is_empty() {
            return Err(AggregatorError::NoSource(
                "no source directory provided".to_string(),
            ));
        }
        let path = PathBuf::from(source);
        match std::fs::metadata(&path) {
            Err(_) => {
                return Err(AggregatorError::NoSource(format!(
                    "source directory {} does not exist",
                    source
                )));
            }
            Ok(meta) if meta.is_file() => {
                return Err(AggregatorError::NoSource(format!(
                    "source path {} exists as file",
                    source
                )));
            }
            Ok(_) => {}
        }
        Ok(Self {
            source: path,
            store,
        })
    }

    async fn list_event_files(&self) -> Result<Vec<PathBuf>, AggregatorError> {
        let mut entries = tokio::fs::read_dir(&self.source)
            .await
            .map_err(AggregatorError::Io)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(AggregatorError::Io)? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("event-") && name.ends_with(".dat") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names.into_iter().map(|n| self.source.join(n)).collect())
    }

    async fn process_file(&self, path: &Path) -> Result<(), AggregatorError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(AggregatorError::Io)?;
        let mut lines = contents.lines();
        let id = lines.next().ok_or_else(|| {
            AggregatorError::Malformed(format!(
                "premature end of file while reading {}",
                path.display()
            ))
        })?;
        let data = lines.next().ok_or_else(|| {
            AggregatorError::Malformed(format!(
                "premature end of file while reading {}",
                path.display()
            ))
        })?;

        process_event(self.store.as_ref(), id, data).await?;

        tokio::fs::remove_file(path)
            .await
            .map_err(AggregatorError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl EventSource for FileSource {
    fn component(&self) -> &'static str {
        "file_aggregator"
    }

    async fn run(&mut self, stop: &mut watch::Receiver<bool>) -> Result<(), AggregatorError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let files = self.list_event_files().await?;
            if files.is_empty() {
                // Nothing to do; make sure the store is still there before
                // going back to sleep.
                if let Err(e) = self.store.ping().await {
                    log::warn!("counter store health check failed: {}", e);
                }
                tokio::select! {
                    _ = stop.changed() => {}
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                }
                continue;
            }
            for path in files {
                if *stop.borrow() {
                    return Ok(());
                }
                let started = Instant::now();
                if let Err(e) = self.process_file(&path).await {
                    log::error!("Error processing file {}: {}", path.display(), e);
                }
                histogram!(FILE_PROCESS_DURATION_MS)
                    .record(started.elapsed().as_millis() as f64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::GROWTH_COUNTER;
    use crate::counters::memory::MemoryCounters;

    const GOOD_ID: &str = r#"[{"topic":"eqiad.mediawiki.recentchange","partition":0,"timestamp":1597056638001}]"#;

    fn write_event_file(dir: &Path, seq: u64, id: &str, data: &str) -> PathBuf {
        let path = dir.join(format!("event-{}.dat", seq));
        std::fs::write(&path, format!("{}\n{}\n", id, data)).unwrap();
        path
    }

    fn source_over(dir: &Path) -> FileSource {
        FileSource::new(Box::new(MemoryCounters::default()), dir.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn processes_and_deletes_good_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_event_file(
            dir.path(),
            0,
            GOOD_ID,
            r#"{"wiki":"enwiki","type":"edit","length":{"old":1,"new":4}}"#,
        );

        let store = std::sync::Arc::new(MemoryCounters::default());
        let source =
            FileSource::new(Box::new(store.clone()), dir.path().to_str().unwrap()).unwrap();
        source.process_file(&path).await.unwrap();

        assert!(!path.exists());
        assert_eq!(store.get("enwiki"), 1);
        assert_eq!(store.get("enwiki_edit"), 1);
        assert_eq!(store.get("day_18484_enwiki"), 1);
        assert_eq!(store.get(GROWTH_COUNTER), 3);
    }

    #[tokio::test]
    async fn malformed_files_stay_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event-0.dat");
        std::fs::write(&path, "only one line\n").unwrap();

        let source = source_over(dir.path());
        let result = source.process_file(&path).await;
        assert!(matches!(result, Err(AggregatorError::Malformed(_))));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn undecodable_payloads_stay_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_event_file(dir.path(), 0, GOOD_ID, "not json");

        let source = source_over(dir.path());
        let result = source.process_file(&path).await;
        assert!(matches!(result, Err(AggregatorError::Payload(_))));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn lists_only_event_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_event_file(dir.path(), 1, GOOD_ID, "{}");
        write_event_file(dir.path(), 0, GOOD_ID, "{}");
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let source = source_over(dir.path());
        let files = source.list_event_files().await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["event-0.dat", "event-1.dat"]);
    }

    #[tokio::test]
    async fn missing_source_directory_is_a_construction_error() {
        let result = FileSource::new(
            Box::new(MemoryCounters::default()),
            "/definitely/not/a/real/dir",
        );
        assert!(matches!(result, Err(AggregatorError::NoSource(_))));
    }
}
