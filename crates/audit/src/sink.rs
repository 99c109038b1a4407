//! Destinations for flushed audit events.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AuditEvent, ChainHead, Error, Result, SqliteSink};

/// A destination for audit events.
///
/// Writes are synchronous; the logger runs them on the blocking pool under a
/// timeout, so an implementation may block on I/O.
pub trait AuditSink: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Persist a batch of events, in order. On error the whole batch is
    /// retried on the next flush, so events already stored may arrive again.
    fn write_batch(&self, events: &[AuditEvent]) -> Result<()>;

    /// The last event this sink already holds, if it outlives the process.
    fn resume_point(&self) -> Result<Option<ChainHead>> {
        Ok(None)
    }
}

/// Keeps events in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Appends events as JSON lines.
///
/// Events at or below the last written sequence are skipped, so a batch
/// retried after a timed-out write is not appended twice.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    head: Option<ChainHead>,
}

impl FileSink {
    /// Open (or create) the log file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let head = last_event(&file)?.as_ref().map(ChainHead::from);
        Ok(Self {
            path,
            state: Mutex::new(FileState { file, head }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let mut state = self.state.lock();

        let mut buf = Vec::new();
        let mut head = state.head.clone();
        for event in events {
            if let Some(last) = &head {
                if event.sequence == last.sequence && event.checksum != last.checksum {
                    return Err(Error::SequenceConflict {
                        sequence: event.sequence,
                    });
                }
                if event.sequence <= last.sequence {
                    continue;
                }
            }
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
            head = Some(ChainHead::from(event));
        }
        if buf.is_empty() {
            return Ok(());
        }

        state.file.write_all(&buf)?;
        state.file.sync_data()?;
        state.head = head;
        Ok(())
    }

    fn resume_point(&self) -> Result<Option<ChainHead>> {
        Ok(self.state.lock().head.clone())
    }
}

/// The final event recorded in a JSON-lines log.
fn last_event(file: &File) -> Result<Option<AuditEvent>> {
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last.map(|line| serde_json::from_str(&line).map_err(Error::from))
        .transpose()
}

/// Emits events through `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        for event in events {
            info!(
                target: "keel::audit",
                sequence = event.sequence,
                event_type = %event.event_type,
                principal = event.principal_id.as_deref().unwrap_or("-"),
                details = %event.details,
                checksum = %event.checksum,
                "audit event"
            );
        }
        Ok(())
    }
}

/// Sink declaration as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Memory,
    Tracing,
    File { path: PathBuf },
    Sqlite { path: PathBuf },
}

impl SinkConfig {
    pub fn build(&self) -> Result<Arc<dyn AuditSink>> {
        Ok(match self {
            Self::Memory => Arc::new(MemorySink::new()),
            Self::Tracing => Arc::new(TracingSink),
            Self::File { path } => Arc::new(FileSink::open(path)?),
            Self::Sqlite { path } => Arc::new(SqliteSink::open(path)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditEventType, GENESIS_CHECKSUM};
    use chrono::Utc;

    fn event(sequence: u64) -> AuditEvent {
        AuditEvent {
            sequence,
            event_type: AuditEventType::TokenIssued,
            details: serde_json::json!({ "jti": "tok_1" }),
            principal_id: Some("agent-7".into()),
            timestamp: Utc::now(),
            prev_checksum: GENESIS_CHECKSUM.into(),
            checksum: "c".repeat(64),
        }
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = FileSink::open(&path).unwrap();
        sink.write_batch(&[event(1), event(2)]).unwrap();
        sink.write_batch(&[event(3)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<AuditEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.iter().map(|e| e.sequence).collect::<Vec<_>>(), [1, 2, 3]);
    }

    fn sequences(path: &Path) -> Vec<u64> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).unwrap().sequence)
            .collect()
    }

    #[test]
    fn file_sink_skips_events_it_already_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = FileSink::open(&path).unwrap();
        sink.write_batch(&[event(1), event(2)]).unwrap();
        // The same batch again, as after a write that outlived its timeout.
        sink.write_batch(&[event(1), event(2), event(3)]).unwrap();
        sink.write_batch(&[event(3)]).unwrap();

        assert_eq!(sequences(&path), [1, 2, 3]);
    }

    #[test]
    fn reopened_file_sink_resumes_after_its_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        FileSink::open(&path)
            .unwrap()
            .write_batch(&[event(1), event(2)])
            .unwrap();

        let sink = FileSink::open(&path).unwrap();
        assert_eq!(sink.resume_point().unwrap(), Some(ChainHead::from(&event(2))));
        sink.write_batch(&[event(2), event(3)]).unwrap();
        assert_eq!(sequences(&path), [1, 2, 3]);
    }

    #[test]
    fn file_sink_rejects_a_different_event_at_its_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileSink::open(&path).unwrap();
        sink.write_batch(&[event(1)]).unwrap();

        let mut other = event(1);
        other.checksum = "d".repeat(64);
        assert!(matches!(
            sink.write_batch(&[other]),
            Err(Error::SequenceConflict { sequence: 1 })
        ));
        assert_eq!(sequences(&path), [1]);
    }

    #[test]
    fn sink_config_parses_tagged_tables() {
        let sinks: Vec<SinkConfig> = serde_json::from_value(serde_json::json!([
            { "type": "tracing" },
            { "type": "sqlite", "path": "audit.db" }
        ]))
        .unwrap();
        assert_eq!(
            sinks,
            [
                SinkConfig::Tracing,
                SinkConfig::Sqlite {
                    path: "audit.db".into()
                }
            ]
        );
    }
}
