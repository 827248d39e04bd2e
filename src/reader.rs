//! # Log Reader
//!
//! Serves stream reads, `$all` reads and subscription catch-up straight from
//! SQLite. Nothing but per-stream metadata is kept in memory, so the log can
//! grow past RAM.
//!
//! ## Connections
//!
//! ```text
//!   read_stream / read_all
//!          │ spawn_blocking
//!          ▼
//!   ┌──────────────────────────────┐
//!   │ LogReader (round robin)      │
//!   │  conn 0 │ conn 1 │ … │ conn N │   read-only, WAL snapshots
//!   └──────────────────────────────┘
//! ```
//!
//! File-backed stores open `reader_connections` read-only connections, so
//! reads never queue behind the writer's transaction. An in-memory database
//! only exists on its one connection; there the reader shares it with the
//! storage writer.
//!
//! ## Visibility
//!
//! SQLite may already hold rows that are not visible yet (durable, but an
//! earlier position is still in flight). Callers pass the bound they are
//! allowed to see: the log head for `$all`, the index's version range for
//! streams. Rows are checksummed on every read.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::codec::KIND_EVENT;
use crate::error::{Error, Result};
use crate::schema::{open_read_only, SharedConnection};
use crate::storage::{StoredRow, ENTRY_COLUMNS};
use crate::types::{GlobalPos, LogEntry, ReadDirection, RecordedEvent, StreamId, StreamVersion};

/// An inclusive run of stream versions, read in `direction`.
///
/// `first` is the version read first: the lowest one going forward, the
/// highest one going backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub first: StreamVersion,
    pub last: StreamVersion,
    pub direction: ReadDirection,
}

impl VersionRange {
    pub fn forward(first: StreamVersion, last: StreamVersion) -> Self {
        Self {
            first,
            last,
            direction: ReadDirection::Forward,
        }
    }

    fn bounds(&self) -> (u64, u64) {
        let (a, b) = (self.first.as_raw(), self.last.as_raw());
        (a.min(b), a.max(b))
    }
}

// =============================================================================
// Reader Pool
// =============================================================================

pub struct LogReader {
    connections: Vec<SharedConnection>,
    next: AtomicUsize,
}

impl LogReader {
    /// Opens `count` read-only connections to a database file.
    pub fn open(path: impl AsRef<Path>, count: usize) -> Result<Self> {
        let connections = (0..count.max(1))
            .map(|_| open_read_only(path.as_ref()).map(|conn| Arc::new(Mutex::new(conn))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Reads through a connection shared with the writer (in-memory stores).
    pub fn shared(conn: SharedConnection) -> Self {
        Self {
            connections: vec![conn],
            next: AtomicUsize::new(0),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Reads visible `$all` entries. Only positions below `head` are visible.
    ///
    /// `from` is inclusive; `GlobalPos::END` reads backward from the newest entry.
    pub async fn read_all(
        &self,
        from: GlobalPos,
        max_count: usize,
        direction: ReadDirection,
        head: GlobalPos,
    ) -> Result<Vec<LogEntry>> {
        self.run(move |conn| read_all(conn, from, max_count, direction, head))
            .await
    }

    /// Reads the events of one stream whose versions fall in `range`.
    pub async fn read_stream(
        &self,
        stream_id: &StreamId,
        range: VersionRange,
    ) -> Result<Vec<RecordedEvent>> {
        let stream_id = stream_id.clone();
        self.run(move |conn| read_stream(conn, &stream_id, range)).await
    }

    async fn run<T, F>(&self, read: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let conn = self.connections[slot].clone();

        tokio::task::spawn_blocking(move || read(&conn.lock()))
            .await
            .map_err(|e| Error::EngineUnavailable(format!("read task failed: {e}")))?
    }
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Reads up to `max_count` entries below `head`, starting at `from`.
pub fn read_all(
    conn: &Connection,
    from: GlobalPos,
    max_count: usize,
    direction: ReadDirection,
    head: GlobalPos,
) -> Result<Vec<LogEntry>> {
    let head = head.as_raw();
    let limit = max_count.min(i64::MAX as usize) as i64;

    let rows = match direction {
        ReadDirection::Forward => {
            if from.as_raw() >= head || limit == 0 {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM log_entries
                 WHERE global_pos >= ?1 AND global_pos < ?2
                 ORDER BY global_pos ASC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![from.as_raw() as i64, head as i64, limit],
                    StoredRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        ReadDirection::Backward => {
            let Some(newest) = head.checked_sub(1) else {
                return Ok(Vec::new());
            };
            if limit == 0 {
                return Ok(Vec::new());
            }
            let start = from.as_raw().min(newest);
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM log_entries
                 WHERE global_pos <= ?1
                 ORDER BY global_pos DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![start as i64, limit], StoredRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };

    rows.into_iter().map(StoredRow::into_entry).collect()
}

/// Reads the events of `stream_id` with versions in `range`, in its direction.
pub fn read_stream(
    conn: &Connection,
    stream_id: &StreamId,
    range: VersionRange,
) -> Result<Vec<RecordedEvent>> {
    let (lo, hi) = range.bounds();
    let order = match range.direction {
        ReadDirection::Forward => "ASC",
        ReadDirection::Backward => "DESC",
    };

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM log_entries
         WHERE stream_id = ?1 AND kind = ?2 AND stream_version BETWEEN ?3 AND ?4
         ORDER BY stream_version {order}"
    ))?;
    let rows = stmt
        .query_map(
            params![stream_id.as_str(), KIND_EVENT, lo as i64, hi as i64],
            StoredRow::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| match row.into_entry()? {
            LogEntry::Event(event) => Ok(event),
            LogEntry::Tombstone(t) => Err(Error::Corruption {
                position: t.global_position,
                reason: "tombstone stored with event kind".into(),
            }),
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage::insert_entries;
    use crate::types::{EventId, StreamTombstone};

    fn event(pos: u64, stream: &str, version: u64) -> Arc<LogEntry> {
        Arc::new(LogEntry::Event(RecordedEvent {
            event_id: EventId::new(),
            stream_id: StreamId::new(stream),
            event_type: "Tested".into(),
            is_json: true,
            data: b"{}".to_vec(),
            metadata: None,
            stream_version: StreamVersion::from_raw(version),
            global_position: GlobalPos::from_raw(pos),
            created_ms: pos,
        }))
    }

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        insert_entries(
            db.connection(),
            &[
                event(0, "a", 0),
                event(1, "b", 0),
                event(2, "a", 1),
                Arc::new(LogEntry::Tombstone(StreamTombstone {
                    stream_id: StreamId::new("b"),
                    last_version: StreamVersion::FIRST,
                    global_position: GlobalPos::from_raw(3),
                    created_ms: 3,
                })),
                event(4, "a", 2),
            ],
        )
        .unwrap();
        db
    }

    fn positions(entries: &[LogEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.global_position().as_raw()).collect()
    }

    #[test]
    fn test_read_all_respects_head() {
        let db = seeded();
        let conn = db.connection();
        let head = GlobalPos::from_raw(4);

        let forward = read_all(conn, GlobalPos::from_raw(1), 10, ReadDirection::Forward, head).unwrap();
        assert_eq!(positions(&forward), vec![1, 2, 3]);

        let backward = read_all(conn, GlobalPos::END, 2, ReadDirection::Backward, head).unwrap();
        assert_eq!(positions(&backward), vec![3, 2]);

        assert!(read_all(conn, GlobalPos::from_raw(4), 10, ReadDirection::Forward, head)
            .unwrap()
            .is_empty());
        assert!(read_all(conn, GlobalPos::END, 10, ReadDirection::Backward, GlobalPos::FIRST)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_read_stream_range_and_direction() {
        let db = seeded();
        let conn = db.connection();

        let forward = read_stream(
            conn,
            &StreamId::new("a"),
            VersionRange::forward(StreamVersion::from_raw(1), StreamVersion::from_raw(2)),
        )
        .unwrap();
        assert_eq!(
            forward.iter().map(|e| e.global_position.as_raw()).collect::<Vec<_>>(),
            vec![2, 4]
        );

        let backward = read_stream(
            conn,
            &StreamId::new("a"),
            VersionRange {
                first: StreamVersion::from_raw(2),
                last: StreamVersion::FIRST,
                direction: ReadDirection::Backward,
            },
        )
        .unwrap();
        assert_eq!(
            backward.iter().map(|e| e.stream_version.as_raw()).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );

        // The tombstone of "b" shares its stream id but is not an event.
        let b = read_stream(
            conn,
            &StreamId::new("b"),
            VersionRange::forward(StreamVersion::FIRST, StreamVersion::from_raw(5)),
        )
        .unwrap();
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_tampered_row_is_reported() {
        let db = seeded();
        db.connection()
            .execute("UPDATE log_entries SET event_type = 'Forged' WHERE global_pos = 2", [])
            .unwrap();

        let err = read_all(db.connection(), GlobalPos::FIRST, 10, ReadDirection::Forward, GlobalPos::from_raw(5))
            .unwrap_err();
        assert!(matches!(err, Error::Corruption { position, .. } if position.as_raw() == 2));
    }

    #[tokio::test]
    async fn test_pool_reads_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.db");
        {
            let db = Database::open(&path, crate::Durability::Normal).unwrap();
            insert_entries(db.connection(), &[event(0, "a", 0), event(1, "a", 1)]).unwrap();
        }

        let reader = LogReader::open(&path, 3).unwrap();
        assert_eq!(reader.connection_count(), 3);
        for _ in 0..4 {
            let entries = reader
                .read_all(GlobalPos::FIRST, 10, ReadDirection::Forward, GlobalPos::from_raw(2))
                .await
                .unwrap();
            assert_eq!(positions(&entries), vec![0, 1]);
        }
    }
}
