//! Durable observation store backed by an embedded SQLite database.
//!
//! The store is the spool between sampling and delivery: rows are appended
//! PENDING, read back in bounded batches by the transmitter, then deleted
//! on confirmed acceptance or flipped to ERROR on per-row rejection.

use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::warn;

use crate::observation::{
    decode_parameters, encode_parameters, Observation, ObservationResult, ObservationStatus,
    StreamTarget,
};

/// Attempts made against a locked database before reporting it unavailable.
const MAX_LOCK_ATTEMPTS: u32 = 5;

/// Pause between attempts on a locked database.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors surfaced by spool storage operations.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying database reported an error
    Sqlite(rusqlite::Error),

    /// The database stayed locked through every retry attempt.
    /// Distinct from an empty result: callers skip the cycle instead of
    /// treating the spool as drained.
    Unavailable { attempts: u32 },

    /// The connection mutex was poisoned by a panicking thread
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "Spool database error: {}", e),
            StoreError::Unavailable { attempts } => {
                write!(f, "Spool database unavailable after {} attempts", attempts)
            }
            StoreError::Poisoned => write!(f, "Spool database lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

/// SQLite-backed spool of observations awaiting delivery.
///
/// Thread-safe via an internal Mutex (a SQLite `Connection` is not `Sync`),
/// so one store can be shared behind an `Arc` by the spool writer and the
/// transmitter.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE observation (
///     id INTEGER PRIMARY KEY,
///     feature_of_interest_id TEXT NULL,
///     stream_id TEXT NOT NULL,
///     phenomenon_time TEXT,
///     result TEXT NOT NULL,
///     parameters TEXT,
///     status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING','ERROR'))
/// );
/// CREATE INDEX idx_observation_status ON observation(status);
/// ```
pub struct ObservationStore {
    conn: Mutex<Connection>,
}

impl ObservationStore {
    /// Open (or create) a file-backed spool database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory spool database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS observation (
                    id INTEGER PRIMARY KEY,
                    feature_of_interest_id TEXT NULL,
                    stream_id TEXT NOT NULL,
                    phenomenon_time TEXT,
                    result TEXT NOT NULL,
                    parameters TEXT,
                    status TEXT NOT NULL DEFAULT 'PENDING'
                        CHECK(status IN ('PENDING','ERROR'))
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_observation_status ON observation(status)",
                [],
            )?;
            Ok(())
        })
    }

    /// Append a new PENDING observation and return its assigned row id.
    /// The write is committed before this returns.
    pub fn append(&self, observation: &Observation) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO observation
                     (feature_of_interest_id, stream_id, phenomenon_time, result, parameters, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    observation.feature_of_interest_id,
                    observation.stream.stream_id(),
                    observation.phenomenon_time,
                    observation.result.encode(),
                    encode_parameters(&observation.parameters),
                    observation.status.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Return up to `limit` PENDING observations in insertion order.
    ///
    /// Lock contention is retried internally; exhausting the attempts
    /// yields `StoreError::Unavailable`, never an empty list.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<Observation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, feature_of_interest_id, stream_id, phenomenon_time,
                        result, parameters, status
                 FROM observation
                 WHERE status = 'PENDING'
                 ORDER BY id ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], Self::row_to_observation)?;
            rows.collect()
        })
    }

    /// Return every stored observation, for diagnostics and tests.
    pub fn get_all(&self) -> Result<Vec<Observation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, feature_of_interest_id, stream_id, phenomenon_time,
                        result, parameters, status
                 FROM observation
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], Self::row_to_observation)?;
            rows.collect()
        })
    }

    /// Count PENDING observations.
    pub fn count_pending(&self) -> Result<usize, StoreError> {
        let count = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM observation WHERE status = 'PENDING'",
                [],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count as usize)
    }

    /// Delete rows by id in one transaction. Absent ids are no-ops.
    pub fn delete(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM observation WHERE id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()
        })
    }

    /// Set the status of the given rows in one transaction.
    pub fn update_status(&self, ids: &[i64], status: ObservationStatus) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE observation SET status = ?1 WHERE id = ?2")?;
                for id in ids {
                    stmt.execute(params![status.as_str(), id])?;
                }
            }
            tx.commit()
        })
    }

    /// Flip every ERROR row back to PENDING so the next delivery cycle
    /// resubmits it. Returns the number of rows reset.
    pub fn reset_errors(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE observation SET status = 'PENDING' WHERE status = 'ERROR'",
                [],
            )
        })
    }

    /// Run `op` against the connection, retrying on SQLITE_BUSY/LOCKED.
    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            match op(&mut conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) && attempt < MAX_LOCK_ATTEMPTS => {
                    drop(conn);
                    warn!(
                        attempt = attempt,
                        max_attempts = MAX_LOCK_ATTEMPTS,
                        "spool database locked, retrying"
                    );
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) if is_locked(&e) => {
                    return Err(StoreError::Unavailable {
                        attempts: MAX_LOCK_ATTEMPTS,
                    });
                }
                Err(e) => return Err(StoreError::Sqlite(e)),
            }
        }
        Err(StoreError::Unavailable {
            attempts: MAX_LOCK_ATTEMPTS,
        })
    }

    /// Map a SELECT row onto an Observation.
    fn row_to_observation(row: &rusqlite::Row) -> rusqlite::Result<Observation> {
        let id: i64 = row.get(0)?;
        let feature_of_interest_id: Option<String> = row.get(1)?;
        let stream_id: String = row.get(2)?;
        let phenomenon_time: Option<String> = row.get(3)?;
        let result_text: String = row.get(4)?;
        let parameters_text: Option<String> = row.get(5)?;
        let status_text: String = row.get(6)?;

        let result = ObservationResult::decode(&result_text);
        let stream = match &result {
            ObservationResult::Multi(_) => StreamTarget::MultiDatastream(stream_id),
            ObservationResult::Single(_) => StreamTarget::Datastream(stream_id),
        };

        Ok(Observation {
            id: Some(id),
            feature_of_interest_id,
            stream,
            phenomenon_time: phenomenon_time.unwrap_or_default(),
            result,
            // The CHECK constraint admits only the two known values
            status: ObservationStatus::parse(&status_text).unwrap_or(ObservationStatus::Pending),
            parameters: decode_parameters(parameters_text.as_deref()),
        })
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
