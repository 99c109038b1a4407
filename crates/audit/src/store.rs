//! SQLite audit sink implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::chain::format_timestamp;
use crate::{AuditEvent, AuditSink, ChainHead, Error, Result, SearchCriteria, SearchOptions, verify_chain};

/// SQLite-backed audit sink. The table is append-only and queryable offline.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open or create an audit database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory audit database (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                sequence INTEGER PRIMARY KEY,
                event_type TEXT NOT NULL,
                principal_id TEXT,
                timestamp TEXT NOT NULL,
                details TEXT NOT NULL,
                prev_checksum TEXT NOT NULL,
                checksum TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_principal
                ON audit_events(principal_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_audit_type
                ON audit_events(event_type, sequence);
            "#,
        )?;
        Ok(())
    }

    /// Load events matching `criteria`, ordered by sequence.
    pub fn load_events(
        &self,
        criteria: &SearchCriteria,
        options: &SearchOptions,
    ) -> Result<Vec<AuditEvent>> {
        let order = if options.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT sequence, event_type, principal_id, timestamp, details, prev_checksum, checksum
             FROM audit_events
             WHERE (?1 IS NULL OR event_type = ?1)
               AND (?2 IS NULL OR principal_id = ?2)
               AND (?3 IS NULL OR timestamp >= ?3)
               AND (?4 IS NULL OR timestamp <= ?4)
             ORDER BY sequence {order}
             LIMIT ?5"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                criteria.event_type.map(|t| t.as_str()),
                criteria.principal_id,
                criteria.since.as_ref().map(format_timestamp),
                criteria.until.as_ref().map(format_timestamp),
                i64::try_from(options.limit).unwrap_or(i64::MAX),
            ],
            read_row,
        )?;

        rows.map(|row| row.map_err(Error::from).and_then(into_event))
            .collect()
    }

    /// Load the whole log, oldest first.
    pub fn load_all(&self) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, event_type, principal_id, timestamp, details, prev_checksum, checksum
             FROM audit_events ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], read_row)?;
        rows.map(|row| row.map_err(Error::from).and_then(into_event))
            .collect()
    }

    /// Verify the stored checksum chain from its first row.
    pub fn verify(&self) -> Result<usize> {
        let events = self.load_all()?;
        verify_chain(&events)?;
        Ok(events.len())
    }
}

impl AuditSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut existing =
                tx.prepare("SELECT checksum FROM audit_events WHERE sequence = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO audit_events
                 (sequence, event_type, principal_id, timestamp, details, prev_checksum, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for event in events {
                let sequence = i64::try_from(event.sequence)
                    .map_err(|_| Error::InvalidRecord("sequence overflow".into()))?;

                // A batch retried after a timeout may already be stored.
                let stored: Option<String> = existing
                    .query_row([sequence], |row| row.get(0))
                    .optional()?;
                match stored {
                    Some(checksum) if checksum == event.checksum => continue,
                    Some(_) => {
                        return Err(Error::SequenceConflict {
                            sequence: event.sequence,
                        });
                    }
                    None => {}
                }

                insert.execute(params![
                    sequence,
                    event.event_type.as_str(),
                    event.principal_id,
                    format_timestamp(&event.timestamp),
                    event.details.to_string(),
                    event.prev_checksum,
                    event.checksum,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn resume_point(&self) -> Result<Option<ChainHead>> {
        let conn = self.conn.lock();
        let head: Option<(i64, String)> = conn
            .query_row(
                "SELECT sequence, checksum FROM audit_events ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        head.map(|(sequence, checksum)| {
            let sequence = u64::try_from(sequence)
                .map_err(|_| Error::InvalidRecord(format!("negative sequence {sequence}")))?;
            Ok(ChainHead { sequence, checksum })
        })
        .transpose()
    }
}

type Row = (i64, String, Option<String>, String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_event(row: Row) -> Result<AuditEvent> {
    let (sequence, event_type, principal_id, timestamp, details, prev_checksum, checksum) = row;
    Ok(AuditEvent {
        sequence: u64::try_from(sequence)
            .map_err(|_| Error::InvalidRecord(format!("negative sequence {sequence}")))?,
        event_type: event_type.parse()?,
        details: serde_json::from_str(&details)?,
        principal_id,
        timestamp: timestamp
            .parse::<DateTime<Utc>>()
            .map_err(|e| Error::InvalidRecord(format!("bad timestamp '{timestamp}': {e}")))?,
        prev_checksum,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditConfig, AuditEventType, AuditLogger};
    use serde_json::json;
    use std::sync::Arc;

    async fn logged_sink(events: &[(AuditEventType, &str)]) -> Arc<SqliteSink> {
        let sink = Arc::new(SqliteSink::in_memory().unwrap());
        let logger = AuditLogger::new(AuditConfig::default(), vec![sink.clone() as Arc<dyn AuditSink>]);
        for (event_type, principal) in events {
            logger.log_event(*event_type, json!({ "n": 1 }), Some(*principal));
        }
        logger.flush().await.unwrap();
        sink
    }

    #[tokio::test]
    async fn stored_chain_round_trips_and_verifies() {
        let sink = logged_sink(&[
            (AuditEventType::CapabilityCreated, "alice"),
            (AuditEventType::CapabilityDelegated, "alice"),
            (AuditEventType::ValidationFailed, "bob"),
        ])
        .await;

        assert_eq!(sink.verify().unwrap(), 3);
        let all = sink.load_all().unwrap();
        assert_eq!(all.iter().map(|e| e.sequence).collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[tokio::test]
    async fn load_events_filters_and_limits() {
        let sink = logged_sink(&[
            (AuditEventType::CapabilityCreated, "alice"),
            (AuditEventType::ValidationFailed, "bob"),
            (AuditEventType::ValidationFailed, "alice"),
            (AuditEventType::ValidationFailed, "alice"),
        ])
        .await;

        let criteria = SearchCriteria::new()
            .event_type(AuditEventType::ValidationFailed)
            .principal("alice");
        let found = sink.load_events(&criteria, &SearchOptions::default()).unwrap();
        assert_eq!(found.iter().map(|e| e.sequence).collect::<Vec<_>>(), [3, 4]);

        let newest = sink
            .load_events(&SearchCriteria::new(), &SearchOptions::limit(1).newest_first())
            .unwrap();
        assert_eq!(newest[0].sequence, 4);
    }

    #[tokio::test]
    async fn tampered_row_fails_verification() {
        let sink = logged_sink(&[
            (AuditEventType::CapabilityRevoked, "alice"),
            (AuditEventType::CapabilityRevoked, "alice"),
        ])
        .await;

        sink.conn
            .lock()
            .execute(
                "UPDATE audit_events SET principal_id = 'mallory' WHERE sequence = 1",
                [],
            )
            .unwrap();

        assert!(matches!(sink.verify(), Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn restarted_logger_extends_an_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        {
            let sink = Arc::new(SqliteSink::open(&path).unwrap());
            let logger = AuditLogger::new(AuditConfig::default(), vec![sink as Arc<dyn AuditSink>]);
            logger.log_event(AuditEventType::CapabilityCreated, json!({}), Some("alice"));
            logger.log_event(AuditEventType::TokenIssued, json!({}), Some("alice"));
            logger.flush().await.unwrap();
        }

        let sink = Arc::new(SqliteSink::open(&path).unwrap());
        let logger = AuditLogger::new(AuditConfig::default(), vec![sink.clone() as Arc<dyn AuditSink>]);
        logger.log_event(AuditEventType::SecurityViolation, json!({}), Some("mallory"));
        assert_eq!(logger.flush().await.unwrap(), 1);

        assert_eq!(sink.verify().unwrap(), 3);
        let last = sink.load_all().unwrap().pop().unwrap();
        assert_eq!(last.sequence, 3);
        assert_eq!(last.event_type, AuditEventType::SecurityViolation);
        assert_eq!(sink.resume_point().unwrap(), Some(ChainHead::from(&last)));
    }

    #[tokio::test]
    async fn rewritten_rows_are_skipped_and_conflicting_rows_rejected() {
        let sink = logged_sink(&[
            (AuditEventType::CapabilityCreated, "alice"),
            (AuditEventType::CapabilityRevoked, "alice"),
        ])
        .await;
        let stored = sink.load_all().unwrap();

        sink.write_batch(&stored).unwrap();
        assert_eq!(sink.verify().unwrap(), 2);

        let mut forged = stored[1].clone();
        forged.principal_id = Some("mallory".into());
        forged.checksum = forged.expected_checksum();
        assert!(matches!(
            sink.write_batch(&[forged]),
            Err(Error::SequenceConflict { sequence: 2 })
        ));
        assert_eq!(sink.load_all().unwrap(), stored);
    }

    #[test]
    fn empty_database_has_no_resume_point() {
        let sink = SqliteSink::in_memory().unwrap();
        assert_eq!(sink.resume_point().unwrap(), None);
    }
}
