use std::path::Path;

use chrono::{NaiveDateTime, Timelike};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::analytics::DetectionResult;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("recorder io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recorder lock poisoned")]
    Poisoned,
}

/// One row of the coverage table.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRecord {
    pub hive_id: String,
    pub filename: String,
    /// Second precision; sub-second part is dropped.
    pub timestamp: NaiveDateTime,
    pub coverage_percent: f64,
}

impl CoverageRecord {
    pub fn from_result(result: &DetectionResult, hive_id: Option<&str>) -> Self {
        Self {
            hive_id: hive_id_for(&result.filename, hive_id),
            filename: result.filename.clone(),
            timestamp: result
                .timestamp
                .with_nanosecond(0)
                .unwrap_or(result.timestamp),
            coverage_percent: result.coverage_percent,
        }
    }
}

/// Hive id for a record: the configured one, else `HIVE_<prefix>` where the
/// prefix is the filename stem up to the first underscore.
pub fn hive_id_for(filename: &str, configured: Option<&str>) -> String {
    if let Some(id) = configured {
        return id.to_string();
    }
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let prefix = stem.split('_').next().unwrap_or(stem);
    format!("HIVE_{prefix}")
}

pub trait Recorder: Send {
    fn record(&mut self, record: &CoverageRecord) -> Result<(), RecorderError>;
}

pub struct SqliteRecorder {
    conn: Connection,
}

impl SqliteRecorder {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, RecorderError> {
        let conn = Connection::open(db_path)?;
        let recorder = Self { conn };
        recorder.ensure_schema()?;
        Ok(recorder)
    }

    fn ensure_schema(&self) -> Result<(), RecorderError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bee_detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              hive_id TEXT NOT NULL,
              filename TEXT,
              timestamp TEXT,
              bee_coverage REAL
            );

            CREATE INDEX IF NOT EXISTS idx_hive_timestamp ON bee_detections(hive_id, timestamp);
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
impl SqliteRecorder {
    fn open_in_memory() -> Result<Self, RecorderError> {
        let conn = Connection::open_in_memory()?;
        let recorder = Self { conn };
        recorder.ensure_schema()?;
        Ok(recorder)
    }

    fn records_for(&self, hive_id: &str) -> Result<Vec<CoverageRecord>, RecorderError> {
        let mut stmt = self.conn.prepare(
            "SELECT hive_id, filename, timestamp, bee_coverage FROM bee_detections
             WHERE hive_id = ?1 ORDER BY timestamp, id",
        )?;
        let mut rows = stmt.query(params![hive_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(2)?;
            let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            out.push(CoverageRecord {
                hive_id: row.get(0)?,
                filename: row.get(1)?,
                timestamp,
                coverage_percent: row.get(3)?,
            });
        }
        Ok(out)
    }
}

impl Recorder for SqliteRecorder {
    fn record(&mut self, record: &CoverageRecord) -> Result<(), RecorderError> {
        self.conn.execute(
            "INSERT INTO bee_detections (hive_id, filename, timestamp, bee_coverage)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.hive_id,
                record.filename,
                record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                record.coverage_percent,
            ],
        )?;

        tracing::debug!(
            hive = %record.hive_id,
            filename = %record.filename,
            coverage = format!("{:.2}", record.coverage_percent),
            "saved detection result"
        );
        Ok(())
    }
}
