//! # SQLite Schema for Cedar Store
//!
//! SQLite is the durable substrate beneath the global log. The schema is one
//! append-only table plus a metadata table:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  log_entries                          cedar_metadata          │
//! │  ┌─────────────────────┐              ┌──────────────────┐    │
//! │  │ global_pos (PK)     │              │ key (PK)         │    │
//! │  │ kind                │              │ value            │    │
//! │  │ stream_id ──────────┼── index ──┐  └──────────────────┘    │
//! │  │ stream_version      │           │                          │
//! │  │ event_id, type, ... │   (stream_id, stream_version)        │
//! │  │ checksum            │                                      │
//! │  └─────────────────────┘                                      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stream metadata (current version, deletion state) is not stored separately.
//! It is derived on startup by replaying `log_entries` in position order, so
//! the log is the single source of truth and can never disagree with an index.
//!
//! ## Connections
//!
//! The storage writer owns one read-write connection. File databases also get
//! a pool of read-only connections (see [`open_read_only`]); in WAL mode they
//! read committed data without waiting for the writer. An in-memory database
//! is private to its connection, so there readers share the writer's
//! [`SharedConnection`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::config::Durability;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Opening a database with another version fails.
const SCHEMA_VERSION: i32 = 1;

/// How long a reader waits on a locked database file before giving up.
const READER_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection that may be used from several threads, one at a time.
pub type SharedConnection = Arc<Mutex<Connection>>;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per committed log entry, events and tombstones alike.
///
/// # Columns
///
/// - `global_pos`: position in the global log. Dense, zero-based, never reused
/// - `kind`: 0 = event, 1 = tombstone
/// - `stream_id`: owning stream (the deleted stream for tombstones)
/// - `stream_version`: event version, or the stream's last version for tombstones
/// - `event_id` .. `metadata`: event fields, NULL for tombstones
/// - `created_ms`: commit time, Unix milliseconds
/// - `checksum`: XXH3-64 over the entry, see [`crate::codec::entry_checksum`]
const CREATE_LOG_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    global_pos     INTEGER PRIMARY KEY,
    kind           INTEGER NOT NULL,
    stream_id      TEXT    NOT NULL,
    stream_version INTEGER NOT NULL,
    event_id       BLOB,
    event_type     TEXT,
    is_json        INTEGER,
    data           BLOB,
    metadata       BLOB,
    created_ms     INTEGER NOT NULL,
    checksum       BLOB    NOT NULL
)
"#;

/// Serves stream reads: `WHERE stream_id = ? AND stream_version BETWEEN ? AND ?`.
const CREATE_LOG_ENTRIES_STREAM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS log_entries_stream
ON log_entries(stream_id, stream_version)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS cedar_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the store's schema initialised and verified.
///
/// # Ownership
///
/// `Database` owns its `Connection`. Recovery borrows it through
/// [`Database::connection`]; [`Database::into_shared`] then hands it to the
/// storage writer thread (and, for in-memory stores, the reader).
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initialising it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(durability)?;
        Ok(db)
    }

    /// Creates an in-memory database. Contents are lost when the store stops.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(Durability::Normal)?;
        Ok(db)
    }

    fn initialize(&mut self, durability: Durability) -> Result<()> {
        // WAL: readers of the file (backup tools, diagnostics) never block the writer.
        // In-memory databases silently keep journal_mode=memory.
        self.conn
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        self.conn.execute_batch(match durability {
            Durability::Normal => "PRAGMA synchronous = NORMAL",
            Durability::Full => "PRAGMA synchronous = FULL",
        })?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_LOG_ENTRIES)?;
        self.conn.execute_batch(CREATE_LOG_ENTRIES_STREAM_INDEX)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cedar_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO cedar_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Borrows the underlying connection (recovery and tests).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Wraps the connection so the writer and readers can share it.
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self.conn))
    }
}

/// Opens a read-only connection to a database file created by [`Database::open`].
pub fn open_read_only(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(READER_BUSY_TIMEOUT)?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
