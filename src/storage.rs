//! # Durable Storage Writer
//!
//! This module is the durable, ordered append primitive beneath the global
//! log. A dedicated OS thread owns the read-write SQLite connection; the async
//! side talks to it through a channel and never waits on disk while holding
//! a store-wide lock.
//!
//! ## Group Commit
//!
//! ```text
//!   GlobalLog (positions assigned, request queued, lock released)
//!        │ StorageRequest::Append
//!        ▼
//!   ┌───────────────────────────────────────────────────────────┐
//!   │ cedar-storage-writer thread                               │
//!   │   1. block for one request                                │
//!   │   2. drain whatever else is queued (up to max_group_size) │
//!   │   3. BEGIN                                                │
//!   │        SAVEPOINT; INSERT rows; RELEASE   (per request)    │
//!   │      COMMIT                                               │
//!   │   4. answer every request of the group                    │
//!   └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Appends that queue up while a commit is on disk share the next fsync.
//! Without contention a group is a single request and nothing waits for a
//! timer.
//!
//! ## Contiguity
//!
//! Positions are assigned before the write, so requests arrive in position
//! order. The writer tracks the next position it expects on disk. When a
//! request fails, every queued request behind it is refused rather than
//! written over a hole; the rejection carries `resume_at`, the position the
//! log must hand out next.
//!
//! ## Acknowledgement Contract
//!
//! - `Ok(())`: the rows are committed (to the configured `synchronous` level)
//! - `Err(Rejected)`: nothing of the request is on disk
//! - no reply (the thread died mid-write): the outcome is unknown, reported
//!   as [`StorageFailure::Unknown`]
//!
//! After a shutdown request the writer closes its channel and refuses
//! whatever is still queued, so a late write is a clean rejection.
//!
//! ## Recovery
//!
//! [`recover`] streams the log back in position order on startup, checking
//! that positions are dense and every checksum matches. Rows are handed to a
//! callback one at a time and never held in memory together.

use std::thread::JoinHandle;

use rusqlite::{params, Connection, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::codec::{entry_checksum, KIND_EVENT, KIND_TOMBSTONE};
use crate::error::{Error, Result};
use crate::schema::SharedConnection;
use crate::types::{
    EventId, GlobalPos, LogEntry, RecordedEvent, SharedEntry, StreamId, StreamTombstone,
    StreamVersion,
};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Columns read back from `log_entries`, in [`StoredRow::from_row`] order.
pub(crate) const ENTRY_COLUMNS: &str = "global_pos, kind, stream_id, stream_version, event_id, \
     event_type, is_json, data, metadata, created_ms, checksum";

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the storage writer thread.
pub enum StorageRequest {
    /// Persist entries atomically. They start at the writer's next position.
    Append(PendingAppend),

    /// Stop the writer after the current group; refuse anything queued later.
    Shutdown,
}

pub struct PendingAppend {
    entries: Vec<SharedEntry>,
    response: oneshot::Sender<WriteOutcome>,
}

impl PendingAppend {
    fn first_position(&self) -> Option<u64> {
        self.entries.first().map(|e| e.global_position().as_raw())
    }
}

/// The writer's answer to one append request.
pub type WriteOutcome = std::result::Result<(), Rejected>;

/// A write the writer refused or rolled back. None of its rows are on disk.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    /// The next position the writer expects; positions from here on are free.
    pub resume_at: GlobalPos,
}

/// Why a durable write did not succeed.
#[derive(Debug)]
pub enum StorageFailure {
    /// Nothing is on disk. `resume_at` is known when the writer answered.
    NotWritten {
        error: Error,
        resume_at: Option<GlobalPos>,
    },
    /// The writer vanished before answering. The entries may or may not be on disk.
    Unknown(String),
}

// =============================================================================
// Storage Writer
// =============================================================================

/// Owns the read-write connection on the writer thread.
pub struct StorageWriter {
    conn: SharedConnection,
    /// Position the next stored row must have.
    next_position: u64,

    /// Blocks each group until a permit arrives, to hold writes in flight.
    #[cfg(test)]
    gate: Option<std::sync::mpsc::Receiver<()>>,
}

impl StorageWriter {
    pub fn new(conn: SharedConnection) -> Result<Self> {
        let next: i64 = conn.lock().query_row(
            "SELECT COALESCE(MAX(global_pos) + 1, 0) FROM log_entries",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            conn,
            next_position: next as u64,
            #[cfg(test)]
            gate: None,
        })
    }

    pub fn next_position(&self) -> GlobalPos {
        GlobalPos::from_raw(self.next_position)
    }

    /// Commits a group of requests in one transaction and answers each of them.
    fn write_group(&mut self, group: Vec<PendingAppend>) {
        #[cfg(test)]
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }

        let start = self.next_position;
        match self.stage_group(&group) {
            Ok(results) => {
                let resume_at = self.next_position();
                let mut written = 0usize;
                for (request, result) in group.into_iter().zip(results) {
                    let outcome = match result {
                        None => {
                            written += request.entries.len();
                            Ok(())
                        }
                        Some(error) => Err(Rejected { error, resume_at }),
                    };
                    // The requester may have gone away; the outcome is on disk regardless.
                    let _ = request.response.send(outcome);
                }
                debug!(first_position = start, entries = written, "persisted log entries");
            }
            Err(e) => {
                error!(error = %e, first_position = start, "group commit failed");
                self.next_position = start;
                let reason = format!("group commit failed: {e}");
                for request in group {
                    let _ = request.response.send(Err(Rejected {
                        error: Error::EngineUnavailable(reason.clone()),
                        resume_at: GlobalPos::from_raw(start),
                    }));
                }
            }
        }
    }

    /// Writes each request under its own savepoint.
    ///
    /// Returns one slot per request: `None` if staged, or why it was refused.
    /// A request that does not start at the next position is refused, so a
    /// failure also refuses everything queued behind it.
    fn stage_group(&mut self, group: &[PendingAppend]) -> Result<Vec<Option<Error>>> {
        let mut conn = self.conn.lock();
        let mut tx = conn.transaction()?;
        let mut next = self.next_position;
        let mut results = Vec::with_capacity(group.len());

        for request in group {
            if request.first_position() != Some(next) {
                results.push(Some(Error::EngineUnavailable(
                    "an earlier write to the log failed".into(),
                )));
                continue;
            }

            let savepoint = tx.savepoint()?;
            match insert_entries(&savepoint, &request.entries) {
                Ok(()) => {
                    savepoint.commit()?;
                    next += request.entries.len() as u64;
                    results.push(None);
                }
                Err(e) => {
                    // Dropping the savepoint rolls back this request only.
                    drop(savepoint);
                    error!(error = %e, first_position = next, "failed to persist log entries");
                    results.push(Some(e));
                }
            }
        }

        tx.commit()?;
        self.next_position = next;
        Ok(results)
    }
}

/// Inserts entries in order. The caller owns the transaction.
pub(crate) fn insert_entries(conn: &Connection, entries: &[SharedEntry]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO log_entries
            (global_pos, kind, stream_id, stream_version, event_id, event_type,
             is_json, data, metadata, created_ms, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;

    for entry in entries {
        let checksum = entry_checksum(entry);
        match entry.as_ref() {
            LogEntry::Event(e) => {
                stmt.execute(params![
                    e.global_position.as_raw() as i64,
                    KIND_EVENT,
                    e.stream_id.as_str(),
                    e.stream_version.as_raw() as i64,
                    &e.event_id.as_bytes()[..],
                    e.event_type,
                    e.is_json,
                    e.data,
                    e.metadata,
                    e.created_ms as i64,
                    checksum,
                ])?;
            }
            LogEntry::Tombstone(t) => {
                stmt.execute(params![
                    t.global_position.as_raw() as i64,
                    KIND_TOMBSTONE,
                    t.stream_id.as_str(),
                    t.last_version.as_raw() as i64,
                    Option::<Vec<u8>>::None,
                    Option::<String>::None,
                    Option::<bool>::None,
                    Option::<Vec<u8>>::None,
                    Option::<Vec<u8>>::None,
                    t.created_ms as i64,
                    checksum,
                ])?;
            }
        }
    }
    Ok(())
}

fn run_storage_writer(
    mut writer: StorageWriter,
    mut rx: mpsc::Receiver<StorageRequest>,
    max_group_size: usize,
) {
    loop {
        let mut group = Vec::new();
        match rx.blocking_recv() {
            Some(StorageRequest::Append(request)) => group.push(request),
            Some(StorageRequest::Shutdown) | None => break,
        }

        let mut stopping = false;
        while group.len() < max_group_size {
            match rx.try_recv() {
                Ok(StorageRequest::Append(request)) => group.push(request),
                Ok(StorageRequest::Shutdown) => {
                    stopping = true;
                    break;
                }
                Err(_) => break,
            }
        }

        writer.write_group(group);
        if stopping {
            break;
        }
    }

    // Late senders now fail to send; whatever already queued is refused.
    rx.close();
    let mut refused = 0usize;
    while let Ok(request) = rx.try_recv() {
        if let StorageRequest::Append(request) = request {
            refused += 1;
            let _ = request.response.send(Err(Rejected {
                error: Error::EngineUnavailable("storage writer is shutting down".into()),
                resume_at: writer.next_position(),
            }));
        }
    }

    info!(next_position = %writer.next_position(), refused, "storage writer stopped");
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to the storage writer thread.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageRequest>,
}

/// A queued write whose acknowledgement has not arrived yet.
pub struct PendingWrite {
    rx: oneshot::Receiver<WriteOutcome>,
}

impl PendingWrite {
    /// Waits until the entries are durable, or the writer refused them.
    pub async fn durable(self) -> std::result::Result<(), StorageFailure> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Rejected { error, resume_at })) => Err(StorageFailure::NotWritten {
                error,
                resume_at: Some(resume_at),
            }),
            Err(_) => Err(StorageFailure::Unknown(
                "storage writer exited before acknowledging".into(),
            )),
        }
    }
}

impl StorageHandle {
    /// Queues entries for the writer without waiting for the disk.
    ///
    /// Requests are written in the order they are queued.
    pub async fn submit(
        &self,
        entries: Vec<SharedEntry>,
    ) -> std::result::Result<PendingWrite, StorageFailure> {
        let (response, rx) = oneshot::channel();

        self.tx
            .send(StorageRequest::Append(PendingAppend { entries, response }))
            .await
            .map_err(|_| StorageFailure::NotWritten {
                error: Error::EngineUnavailable("storage writer has stopped".into()),
                resume_at: None,
            })?;

        Ok(PendingWrite { rx })
    }

    /// Persists entries and waits for the durable acknowledgement.
    pub async fn append(&self, entries: Vec<SharedEntry>) -> std::result::Result<(), StorageFailure> {
        self.submit(entries).await?.durable().await
    }

    /// Asks the writer to stop once the current group is done.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StorageRequest::Shutdown).await;
    }
}

/// Spawns the storage writer thread and returns a handle to it.
pub fn spawn_storage_writer(
    conn: SharedConnection,
    max_group_size: usize,
) -> Result<(StorageHandle, JoinHandle<()>)> {
    spawn_writer_thread(StorageWriter::new(conn)?, max_group_size)
}

/// Like [`spawn_storage_writer`], but every group waits for a permit first.
#[cfg(test)]
pub(crate) fn spawn_gated_storage_writer(
    conn: SharedConnection,
) -> Result<(StorageHandle, JoinHandle<()>, std::sync::mpsc::Sender<()>)> {
    let (permits, gate) = std::sync::mpsc::channel();
    let mut writer = StorageWriter::new(conn)?;
    writer.gate = Some(gate);
    let (handle, join) = spawn_writer_thread(writer, crate::config::DEFAULT_MAX_GROUP_SIZE)?;
    Ok((handle, join, permits))
}

fn spawn_writer_thread(
    writer: StorageWriter,
    max_group_size: usize,
) -> Result<(StorageHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let join = std::thread::Builder::new()
        .name("cedar-storage-writer".to_string())
        .spawn(move || run_storage_writer(writer, rx, max_group_size.max(1)))
        .map_err(|e| Error::EngineUnavailable(format!("failed to spawn storage writer: {e}")))?;

    Ok((StorageHandle { tx }, join))
}

// =============================================================================
// Recovery
// =============================================================================

/// Replays every stored entry in position order through `apply`.
///
/// Verifies continuity and checksums. Returns the position the next entry
/// will receive.
pub fn recover(conn: &Connection, mut apply: impl FnMut(&LogEntry) -> Result<()>) -> Result<GlobalPos> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM log_entries ORDER BY global_pos"
    ))?;
    let mut rows = stmt.query([])?;

    let mut expected = 0u64;
    while let Some(row) = rows.next()? {
        let row = StoredRow::from_row(row)?;
        let position = GlobalPos::from_raw(row.global_pos as u64);
        if row.global_pos < 0 || position.as_raw() != expected {
            return Err(Error::Corruption {
                position,
                reason: format!("expected position {expected}, log has a gap"),
            });
        }
        apply(&row.into_entry()?)?;
        expected += 1;
    }

    info!(entries = expected, "recovered global log from storage");
    Ok(GlobalPos::from_raw(expected))
}

/// A raw `log_entries` row.
pub(crate) struct StoredRow {
    global_pos: i64,
    kind: i64,
    stream_id: String,
    stream_version: i64,
    event_id: Option<Vec<u8>>,
    event_type: Option<String>,
    is_json: Option<bool>,
    data: Option<Vec<u8>>,
    metadata: Option<Vec<u8>>,
    created_ms: i64,
    checksum: Vec<u8>,
}

impl StoredRow {
    /// Reads a row selected with [`ENTRY_COLUMNS`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            global_pos: row.get(0)?,
            kind: row.get(1)?,
            stream_id: row.get(2)?,
            stream_version: row.get(3)?,
            event_id: row.get(4)?,
            event_type: row.get(5)?,
            is_json: row.get(6)?,
            data: row.get(7)?,
            metadata: row.get(8)?,
            created_ms: row.get(9)?,
            checksum: row.get(10)?,
        })
    }

    /// Decodes the row and verifies its checksum.
    pub(crate) fn into_entry(self) -> Result<LogEntry> {
        let position = GlobalPos::from_raw(self.global_pos.max(0) as u64);
        let corrupt = |reason: &str| Error::Corruption {
            position,
            reason: reason.to_string(),
        };

        let entry = match self.kind {
            KIND_EVENT => {
                let id_bytes: [u8; 16] = self
                    .event_id
                    .as_deref()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| corrupt("event id is missing or not 16 bytes"))?;
                LogEntry::Event(RecordedEvent {
                    event_id: EventId::from_bytes(id_bytes),
                    stream_id: StreamId::new(self.stream_id),
                    event_type: self.event_type.ok_or_else(|| corrupt("event type is missing"))?,
                    is_json: self.is_json.unwrap_or(false),
                    data: self.data.ok_or_else(|| corrupt("event data is missing"))?,
                    metadata: self.metadata,
                    stream_version: StreamVersion::from_raw(self.stream_version as u64),
                    global_position: position,
                    created_ms: self.created_ms as u64,
                })
            }
            KIND_TOMBSTONE => LogEntry::Tombstone(StreamTombstone {
                stream_id: StreamId::new(self.stream_id),
                last_version: StreamVersion::from_raw(self.stream_version as u64),
                global_position: position,
                created_ms: self.created_ms as u64,
            }),
            other => return Err(corrupt(&format!("unknown entry kind {other}"))),
        };

        if entry_checksum(&entry) != self.checksum {
            return Err(corrupt("checksum mismatch"));
        }
        Ok(entry)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use std::sync::Arc;

    fn event(pos: u64, stream: &str, version: u64) -> SharedEntry {
        Arc::new(LogEntry::Event(RecordedEvent {
            event_id: EventId::new(),
            stream_id: StreamId::new(stream),
            event_type: "Tested".into(),
            is_json: false,
            data: vec![pos as u8; 4],
            metadata: (pos % 2 == 0).then(|| b"meta".to_vec()),
            stream_version: StreamVersion::from_raw(version),
            global_position: GlobalPos::from_raw(pos),
            created_ms: 1_000 + pos,
        }))
    }

    fn tombstone(pos: u64, stream: &str, last: u64) -> SharedEntry {
        Arc::new(LogEntry::Tombstone(StreamTombstone {
            stream_id: StreamId::new(stream),
            last_version: StreamVersion::from_raw(last),
            global_position: GlobalPos::from_raw(pos),
            created_ms: 2_000,
        }))
    }

    fn recover_all(conn: &Connection) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        recover(conn, |entry| {
            entries.push(entry.clone());
            Ok(())
        })?;
        Ok(entries)
    }

    fn group_of(requests: Vec<Vec<SharedEntry>>) -> (Vec<PendingAppend>, Vec<oneshot::Receiver<WriteOutcome>>) {
        requests
            .into_iter()
            .map(|entries| {
                let (response, rx) = oneshot::channel();
                (PendingAppend { entries, response }, rx)
            })
            .unzip()
    }

    #[test]
    fn test_insert_then_recover() {
        let db = Database::open_in_memory().unwrap();
        let batch = vec![event(0, "a", 0), event(1, "b", 0), tombstone(2, "a", 0)];
        insert_entries(db.connection(), &batch).unwrap();

        let recovered = recover_all(db.connection()).unwrap();
        assert_eq!(recovered.len(), 3);
        for (stored, original) in recovered.iter().zip(&batch) {
            assert_eq!(stored, original.as_ref());
        }
    }

    #[test]
    fn test_failed_request_refuses_the_ones_behind_it() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON log_entries
                 WHEN NEW.stream_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
            )
            .unwrap();
        let conn = db.into_shared();
        let mut writer = StorageWriter::new(conn.clone()).unwrap();

        let (group, mut replies) = group_of(vec![
            vec![event(0, "a", 0)],
            vec![event(1, "poison", 0)],
            vec![event(2, "c", 0)],
        ]);
        writer.write_group(group);

        assert!(matches!(replies[0].try_recv(), Ok(Ok(()))));
        assert!(matches!(
            replies[1].try_recv(),
            Ok(Err(Rejected { error: Error::Sqlite(_), resume_at })) if resume_at.as_raw() == 1
        ));
        // Writing "c" at position 2 would leave a hole at 1.
        assert!(matches!(
            replies[2].try_recv(),
            Ok(Err(Rejected { resume_at, .. })) if resume_at.as_raw() == 1
        ));

        assert_eq!(writer.next_position().as_raw(), 1);
        assert_eq!(recover_all(&conn.lock()).unwrap().len(), 1);

        // A request that starts at the reported position goes through.
        let (group, mut replies) = group_of(vec![vec![event(1, "c", 0)]]);
        writer.write_group(group);
        assert!(matches!(replies[0].try_recv(), Ok(Ok(()))));
        assert_eq!(writer.next_position().as_raw(), 2);
    }

    #[test]
    fn test_out_of_order_request_is_refused() {
        let conn = Database::open_in_memory().unwrap().into_shared();
        let mut writer = StorageWriter::new(conn.clone()).unwrap();

        let (group, mut replies) = group_of(vec![vec![event(3, "a", 0)]]);
        writer.write_group(group);

        assert!(matches!(
            replies[0].try_recv(),
            Ok(Err(Rejected { resume_at, .. })) if resume_at == GlobalPos::FIRST
        ));
        assert!(recover_all(&conn.lock()).unwrap().is_empty());
    }

    #[test]
    fn test_writer_resumes_after_existing_rows() {
        let db = Database::open_in_memory().unwrap();
        insert_entries(db.connection(), &[event(0, "a", 0), event(1, "a", 1)]).unwrap();

        let writer = StorageWriter::new(db.into_shared()).unwrap();
        assert_eq!(writer.next_position().as_raw(), 2);
    }

    #[test]
    fn test_gap_detected() {
        let db = Database::open_in_memory().unwrap();
        insert_entries(db.connection(), &[event(0, "a", 0), event(2, "a", 1)]).unwrap();

        let err = recover_all(db.connection()).unwrap_err();
        assert!(matches!(err, Error::Corruption { position, .. } if position.as_raw() == 2));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let db = Database::open_in_memory().unwrap();
        insert_entries(db.connection(), &[event(0, "a", 0)]).unwrap();
        db.connection()
            .execute("UPDATE log_entries SET data = x'00' WHERE global_pos = 0", [])
            .unwrap();

        let err = recover_all(db.connection()).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_handle_round_trip_and_shutdown() {
        let conn = Database::open_in_memory().unwrap().into_shared();
        let (handle, join) = spawn_storage_writer(conn, 16).unwrap();

        handle.append(vec![event(0, "a", 0)]).await.unwrap();
        handle.shutdown().await;
        tokio::task::spawn_blocking(move || join.join()).await.unwrap().unwrap();

        let result = handle.append(vec![event(1, "a", 1)]).await;
        assert!(matches!(
            result,
            Err(StorageFailure::NotWritten { error: Error::EngineUnavailable(_), resume_at: None })
        ));
    }

    #[tokio::test]
    async fn test_rejected_write_reports_not_written() {
        let db = Database::open_in_memory().unwrap();
        db.connection().execute_batch("PRAGMA query_only = ON").unwrap();
        let (handle, _join) = spawn_storage_writer(db.into_shared(), 16).unwrap();

        let result = handle.append(vec![event(0, "a", 0)]).await;
        assert!(matches!(
            result,
            Err(StorageFailure::NotWritten { error: Error::Sqlite(_), resume_at: Some(p) }) if p == GlobalPos::FIRST
        ));
    }

    #[tokio::test]
    async fn test_write_queued_behind_shutdown_is_refused_cleanly() {
        let conn = Database::open_in_memory().unwrap().into_shared();
        let (handle, join, permits) = spawn_gated_storage_writer(conn.clone()).unwrap();

        // The first write is held at the gate while shutdown and a late
        // write queue up behind it.
        let first = handle.submit(vec![event(0, "a", 0)]).await.unwrap();
        handle.shutdown().await;
        let late = handle.submit(vec![event(1, "b", 0)]).await.unwrap();

        permits.send(()).unwrap();
        first.durable().await.unwrap();
        assert!(matches!(
            late.durable().await,
            Err(StorageFailure::NotWritten { error: Error::EngineUnavailable(_), resume_at: Some(p) })
                if p.as_raw() == 1
        ));

        tokio::task::spawn_blocking(move || join.join()).await.unwrap().unwrap();
        assert_eq!(recover_all(&conn.lock()).unwrap().len(), 1);
    }
}
