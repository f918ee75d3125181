//! SQLite persistence for the gallery and the attendance log.
//!
//! [`Store`] is a cheap, cloneable handle over a single `tokio-rusqlite`
//! connection thread. Every operation runs as one closure on that thread, so
//! each mutation is atomic and mutations are serialized with each other.

pub mod codec;
mod error;

mod attendance;
mod gallery;

pub use error::StoreError;

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE,
    role            TEXT NOT NULL,
    department      TEXT NOT NULL,
    embedding       BLOB NOT NULL,
    embedding_dim   INTEGER NOT NULL CHECK (embedding_dim > 0),
    embedding_dtype TEXT NOT NULL,
    model_version   TEXT,
    enrolled_at_us  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identities_scan ON identities(enrolled_at_us, id);

CREATE TABLE IF NOT EXISTS attendance (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    identity_id     TEXT NOT NULL REFERENCES identities(id),
    kind            TEXT NOT NULL CHECK (kind IN ('IN', 'OUT')),
    recorded_at_us  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_recent ON attendance(recorded_at_us, seq);
CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance(identity_id);
";

/// Handle to the presence database.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open or create the database file, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.init(true).await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// A private database that lives as long as the handle.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, wal: bool) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update(None, "foreign_keys", true)?;
            if wal {
                let mode: String = conn.pragma_update_and_check(
                    None,
                    "journal_mode",
                    "WAL",
                    |row| row.get(0),
                )?;
                tracing::debug!(journal_mode = %mode, "journal mode set");
            }

            let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
            if version > SCHEMA_VERSION {
                return Err(StoreError::InvalidDbValue(format!(
                    "database schema v{version} is newer than supported v{SCHEMA_VERSION}"
                )));
            }
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            Ok(())
        })
        .await
    }

    /// Run `f` on the connection thread and flatten the two error layers.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(move |conn| Ok(f(conn))).await?
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| StoreError::InvalidDbValue(format!("timestamp out of range: {us}")))
}

/// Convert a paging bound to SQLite's integer type.
fn to_sql_int(value: u32) -> i64 {
    i64::from(value)
}
