use crate::events::{EngineEvent, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Event log implementation using gzip-compressed JSONL files.
///
/// Layout: `events/YYYY/MM/DD/<run_id>.jsonl.gz`, one file per run per
/// day. Appends buffer in memory and flush on size and on read, so the
/// log is append-mostly and safe for concurrent writers across runs.
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<Vec<EngineEvent>>,
}

const FLUSH_THRESHOLD: usize = 100;

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    fn event_file(&self, run_id: &RunId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{run_id}.jsonl.gz"))
    }

    /// Flush all buffered events to their per-run, per-day files.
    async fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut grouped: HashMap<PathBuf, Vec<EngineEvent>> = HashMap::new();
        for event in buffer.drain(..) {
            let path = self.event_file(&event.run_id, &event.timestamp);
            grouped.entry(path).or_default().push(event);
        }
        drop(buffer);

        for (path, events) in grouped {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);
            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// All log files for a run across day directories.
    fn log_files(&self, run_id: &RunId) -> Vec<PathBuf> {
        let events_dir = self.base_path.join("events");
        let filename = format!("{run_id}.jsonl.gz");

        walkdir::WalkDir::new(events_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_string_lossy() == filename)
            .map(|entry| entry.into_path())
            .collect()
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<EngineEvent>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("failed to open event log file")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read event log line")?;
        let event: EngineEvent = serde_json::from_str(&line).context("failed to parse event")?;
        events.push(event);
    }
    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[EngineEvent]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("failed to serialize event")?;
        encoder.write_all(json.as_bytes()).context("failed to write event")?;
        encoder.write_all(b"\n").context("failed to write newline")?;
    }
    let compressed = encoder.finish().context("failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("failed to write event log file")?;
    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: EngineEvent) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        buffer.push(event);

        if buffer.len() >= FLUSH_THRESHOLD {
            drop(buffer);
            self.flush().await?;
        }
        Ok(())
    }

    async fn run_events(&self, run_id: RunId) -> Result<Vec<EngineEvent>> {
        self.flush().await?;

        let mut all_events = Vec::new();
        for file in self.log_files(&run_id) {
            all_events.extend(read_jsonl_gz(&file)?);
        }
        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }

    async fn run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EngineEvent>> {
        let events = self.run_events(run_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::types::NodeId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_read_back() {
        let temp = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        log.append(EngineEvent::new(
            run_id,
            EventKind::StepStarted {
                node_id: NodeId::new("a"),
                attempt: 1,
            },
        ))
        .await
        .unwrap();
        log.append(EngineEvent::new(
            run_id,
            EventKind::StepCompleted {
                node_id: NodeId::new("a"),
                attempt: 1,
                duration_ms: 12,
            },
        ))
        .await
        .unwrap();

        let events = log.run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, EventKind::StepStarted { .. }));
        assert!(matches!(events[1].kind, EventKind::StepCompleted { .. }));
    }

    #[tokio::test]
    async fn runs_do_not_see_each_others_events() {
        let temp = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp.path().to_path_buf()).unwrap();

        let first = RunId::new();
        let second = RunId::new();
        log.append(EngineEvent::new(first, EventKind::RunCancelled { reason: "x".into() }))
            .await
            .unwrap();
        log.append(EngineEvent::new(second, EventKind::RunCancelled { reason: "y".into() }))
            .await
            .unwrap();

        assert_eq!(log.run_events(first).await.unwrap().len(), 1);
        assert_eq!(log.run_events(second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn range_query_filters_by_timestamp() {
        let temp = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        log.append(EngineEvent::new(run_id, EventKind::RunCompleted { duration_ms: 1 }))
            .await
            .unwrap();

        let all = log
            .run_events_range(run_id, Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let none = log
            .run_events_range(
                run_id,
                Utc::now() - chrono::Duration::hours(2),
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
