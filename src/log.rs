//! # The Global Log
//!
//! The global log is the single ordered sequence of every committed entry in
//! the store. It is the source of the `$all` ordering and the only place where
//! global positions are assigned.
//!
//! ## Commit Protocol
//!
//! Position assignment is the one store-wide serialization point, and it is
//! short: nothing waits for the disk while holding it.
//!
//! ```text
//!   append(pending, before_visible)
//!   ┌──────────── sequencer ────────────┐
//!   │ 1. assign positions next..next+n  │
//!   │ 2. queue the write (FIFO)         │
//!   └───────────────────────────────────┘
//!     3. await the durable ack           (group commit on the writer thread)
//!     4. wait until head == first        (earlier batches became visible)
//!     5. before_visible(entries)         (stream index commit)
//!   ┌──────────── publish lock ─────────┐
//!   │ 6. head = first + n               │
//!   │ 7. publish to subscribers         │
//!   └───────────────────────────────────┘
//! ```
//!
//! Writes queue in position order and the storage writer refuses anything
//! that would leave a hole, so disk order is position order. Step 4 makes
//! visibility follow the same order.
//!
//! ## Rejected Writes
//!
//! A write the storage writer refused is not on disk, and neither is any
//! write queued behind it. The rejection reports where the writer stands; the
//! first rejected append of a generation rewinds `next` there and bumps the
//! generation, so positions are handed out again exactly once.
//!
//! ## Reads
//!
//! Entries are not kept in memory. `$all` reads go to SQLite through the
//! [`LogReader`], bounded by `head`. Since `head` moves by a whole batch at a
//! time, a read never sees half of a batch.
//!
//! ## Unknown Outcomes
//!
//! If the storage writer disappears mid-write, or an append is abandoned
//! while its entries are in flight, we cannot know what reached disk. Reusing
//! positions could then fork the log, so the log latches into a failed state
//! and refuses every later write with `EngineUnavailable`. Reads keep working.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::reader::LogReader;
use crate::storage::{StorageFailure, StorageHandle};
use crate::subscription::Notifier;
use crate::types::{
    EventData, GlobalPos, LogEntry, ReadDirection, RecordedEvent, SharedEntry, StreamId,
    StreamTombstone, StreamVersion,
};

// =============================================================================
// Pending Entries
// =============================================================================

/// An entry that has been validated but not yet assigned a global position.
#[derive(Debug)]
pub enum PendingEntry {
    Event {
        stream_id: StreamId,
        stream_version: StreamVersion,
        data: EventData,
    },
    Tombstone {
        stream_id: StreamId,
        last_version: StreamVersion,
    },
}

impl PendingEntry {
    fn into_entry(self, global_position: GlobalPos, created_ms: u64) -> LogEntry {
        match self {
            PendingEntry::Event {
                stream_id,
                stream_version,
                data,
            } => LogEntry::Event(RecordedEvent {
                event_id: data.event_id,
                stream_id,
                event_type: data.event_type,
                is_json: data.is_json,
                data: data.data,
                metadata: data.metadata,
                stream_version,
                global_position,
                created_ms,
            }),
            PendingEntry::Tombstone {
                stream_id,
                last_version,
            } => LogEntry::Tombstone(StreamTombstone {
                stream_id,
                last_version,
                global_position,
                created_ms,
            }),
        }
    }
}

// =============================================================================
// Global Log
// =============================================================================

struct Sequencer {
    /// Position the next queued entry receives.
    next: u64,
    /// Bumped on every rewind; stale rejections carry an older value.
    generation: u64,
}

pub struct GlobalLog {
    sequencer: Mutex<Sequencer>,

    /// Number of entries visible to `$all` readers.
    visible: watch::Sender<u64>,

    /// Keeps head updates and their notifications in position order.
    publish_lock: parking_lot::Mutex<()>,

    /// Set when a durable write ended with an unknown outcome.
    failed: AtomicBool,

    storage: StorageHandle,
    reader: Arc<LogReader>,
    notifier: Arc<Notifier>,
}

impl GlobalLog {
    /// Creates the log on top of `head` recovered entries.
    pub fn new(
        head: GlobalPos,
        storage: StorageHandle,
        reader: Arc<LogReader>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (visible, _) = watch::channel(head.as_raw());

        Self {
            sequencer: Mutex::new(Sequencer {
                next: head.as_raw(),
                generation: 0,
            }),
            visible,
            publish_lock: parking_lot::Mutex::new(()),
            failed: AtomicBool::new(false),
            storage,
            reader,
            notifier,
        }
    }

    /// The position the next visible entry will receive.
    pub fn head(&self) -> GlobalPos {
        GlobalPos::from_raw(*self.visible.borrow())
    }

    /// Position of the newest visible entry, if any.
    pub fn last_position(&self) -> Option<GlobalPos> {
        self.visible.borrow().checked_sub(1).map(GlobalPos::from_raw)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn reader(&self) -> &Arc<LogReader> {
        &self.reader
    }

    /// Reads up to `max_count` visible entries starting at `from`, ascending.
    pub async fn read_forward(&self, from: GlobalPos, max_count: usize) -> Result<Vec<LogEntry>> {
        self.reader
            .read_all(from, max_count, ReadDirection::Forward, self.head())
            .await
    }

    /// Reads up to `max_count` visible entries starting at `from`, descending.
    ///
    /// `GlobalPos::END` starts at the newest entry.
    pub async fn read_backward(&self, from: GlobalPos, max_count: usize) -> Result<Vec<LogEntry>> {
        self.reader
            .read_all(from, max_count, ReadDirection::Backward, self.head())
            .await
    }

    /// Commits entries at the next positions.
    ///
    /// `before_visible` runs after the entries are durable and every earlier
    /// position is visible, but before `$all` readers or subscribers can
    /// observe them. The stream index commits there, so a stream read never
    /// lags a subscriber.
    pub async fn append<F>(&self, pending: Vec<PendingEntry>, before_visible: F) -> Result<Vec<SharedEntry>>
    where
        F: FnOnce(&[SharedEntry]),
    {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let (batch, write, generation, mut in_flight) = {
            let mut sequencer = self.sequencer.lock().await;

            if self.is_failed() {
                warn!("rejecting write: global log is in a failed state");
                return Err(Error::EngineUnavailable(
                    "global log stopped accepting writes after a storage failure".into(),
                ));
            }

            let first = sequencer.next;
            let created_ms = current_time_ms();
            let batch: Vec<SharedEntry> = pending
                .into_iter()
                .enumerate()
                .map(|(i, p)| Arc::new(p.into_entry(GlobalPos::from_raw(first + i as u64), created_ms)))
                .collect();

            let write = match self.storage.submit(batch.clone()).await {
                Ok(write) => write,
                Err(failure) => return Err(self.unavailable(failure, first)),
            };
            let in_flight = InFlight::new(self);

            sequencer.next += batch.len() as u64;
            (batch, write, sequencer.generation, in_flight)
        };

        let first = batch[0].global_position().as_raw();
        let count = batch.len() as u64;

        match write.durable().await {
            Ok(()) => {}
            Err(StorageFailure::NotWritten { error, resume_at }) => {
                in_flight.settle();
                if let Some(resume_at) = resume_at {
                    self.rewind(generation, resume_at.as_raw()).await;
                }
                return Err(self.unavailable(
                    StorageFailure::NotWritten { error, resume_at },
                    first,
                ));
            }
            Err(unknown @ StorageFailure::Unknown(_)) => {
                in_flight.settle();
                self.fail();
                return Err(self.unavailable(unknown, first));
            }
        }

        // Wait for every earlier position to become visible.
        let mut visible = self.visible.subscribe();
        let turn = visible
            .wait_for(|head| *head == first || self.is_failed())
            .await
            .map(|head| *head == first)
            .unwrap_or(false);
        if !turn {
            // The entries are durable, but an earlier write's outcome is unknown.
            in_flight.settle();
            error!(first_position = first, "durable write stranded behind a failed write");
            return Err(Error::EngineUnavailable(
                "global log stopped accepting writes after a storage failure".into(),
            ));
        }

        before_visible(&batch);

        {
            let _publish = self.publish_lock.lock();
            self.visible.send_replace(first + count);
            for entry in &batch {
                self.notifier.publish(entry);
            }
        }
        in_flight.settle();

        debug!(first_position = first, count, "committed to global log");
        Ok(batch)
    }

    /// Hands positions from `resume_at` out again after a rejected write.
    ///
    /// Only the first rejection of a generation rewinds; later ones are stale.
    async fn rewind(&self, generation: u64, resume_at: u64) {
        let mut sequencer = self.sequencer.lock().await;
        if sequencer.generation == generation && resume_at < sequencer.next {
            debug!(from = sequencer.next, to = resume_at, "rewinding global log positions");
            sequencer.next = resume_at;
            sequencer.generation += 1;
        }
    }

    /// Latches the failed state and wakes appends waiting for their turn.
    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.visible.send_modify(|_| {});
    }

    fn unavailable(&self, failure: StorageFailure, first: u64) -> Error {
        match failure {
            StorageFailure::NotWritten { error, .. } => {
                warn!(error = %error, first_position = first, "durable write rejected");
                match error {
                    Error::EngineUnavailable(_) => error,
                    other => Error::EngineUnavailable(other.to_string()),
                }
            }
            StorageFailure::Unknown(reason) => {
                error!(%reason, first_position = first, "durable write outcome unknown; refusing further writes");
                Error::EngineUnavailable(reason)
            }
        }
    }

    /// Position the next queued entry will receive.
    #[cfg(test)]
    pub(crate) async fn assigned(&self) -> u64 {
        self.sequencer.lock().await.next
    }

    /// An empty log over `db`, with its own writer thread.
    #[cfg(test)]
    pub(crate) fn for_tests(db: crate::schema::Database, capacity: usize) -> Self {
        let conn = db.into_shared();
        let (storage, _join) =
            crate::storage::spawn_storage_writer(conn.clone(), crate::config::DEFAULT_MAX_GROUP_SIZE)
                .unwrap();
        Self::new(
            GlobalPos::FIRST,
            storage,
            Arc::new(LogReader::shared(conn)),
            Arc::new(Notifier::new(capacity)),
        )
    }
}

/// Latches the log into the failed state if an append future is dropped while
/// its entries are in flight.
struct InFlight<'a> {
    log: &'a GlobalLog,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(log: &'a GlobalLog) -> Self {
        Self { log, settled: false }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.log.fail();
            error!("append dropped with entries in flight; refusing further writes");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
