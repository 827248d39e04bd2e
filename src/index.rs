//! # Stream Index
//!
//! Maps each stream id to its metadata: lifecycle state, version counters and
//! the tombstone position. It is the authority for optimistic concurrency
//! checks, for deletion gating and for which versions a stream read may see.
//! Event bodies live in SQLite only.
//!
//! ## Partitioning
//!
//! ```text
//!  DashMap<StreamId, Arc<StreamSlot>>        (sharded; lookups never block
//!   ├─ "order-1" ─► StreamSlot                writers of other streams)
//!   │               ├─ gate:   tokio Mutex   (one writer per stream)
//!   │               └─ record: RwLock<Option<StreamRecord>>
//!   └─ "order-2" ─► StreamSlot
//! ```
//!
//! A writer first takes the stream's `gate` ([`StreamIndex::lock`]), validates
//! its expected version and reserves the next versions, then commits the
//! reservation once the global log has made the events durable. The `record`
//! lock is only held for the instant of a snapshot or a commit, so readers
//! never wait for a writer's durable write.
//!
//! ## Expected-Version Rules
//!
//! | stream state | `Any`  | `NoStream` | `StreamExists` | `Exact(n)`        |
//! |--------------|--------|------------|----------------|-------------------|
//! | absent       | ok (0) | ok (0)     | conflict       | conflict          |
//! | active       | ok     | conflict   | ok             | ok iff n == last  |
//! | soft-deleted | ok, recreates | ok, recreates | deleted | deleted     |
//!
//! A recreated stream continues numbering after the last version it ever had;
//! the old versions stay hidden from stream reads.
//!
//! ## Slot Lifetime
//!
//! Taking a gate creates the stream's slot. A lock dropped without a record
//! (a failed first append, a delete of a missing stream) removes the slot
//! again unless another writer is already waiting on it, so failed requests
//! for arbitrary ids leave nothing behind.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::VersionRange;
use crate::types::{
    CurrentVersion, ExpectedVersion, GlobalPos, LogEntry, ReadDirection, StreamId, StreamInfo,
    StreamState, StreamVersion,
};

// =============================================================================
// Stream Record
// =============================================================================

#[derive(Debug, Clone)]
struct StreamRecord {
    state: StreamState,
    first_visible: u64,
    /// Number of versions ever assigned, across all incarnations.
    next_version: u64,
    deleted_at: Option<GlobalPos>,
}

impl StreamRecord {
    fn empty() -> Self {
        Self {
            state: StreamState::Active,
            first_visible: 0,
            next_version: 0,
            deleted_at: None,
        }
    }

    /// Records only exist after a first commit, so `next_version` is never 0.
    fn last_version(&self) -> StreamVersion {
        StreamVersion::from_raw(self.next_version.saturating_sub(1))
    }

    fn info(&self, stream_id: &StreamId) -> StreamInfo {
        StreamInfo {
            stream_id: stream_id.clone(),
            state: self.state,
            last_version: self.last_version(),
            first_visible: StreamVersion::from_raw(self.first_visible),
            deleted_at: self.deleted_at,
        }
    }
}

/// Validates `expected` and returns the version the next event would get.
fn check_expected(
    stream_id: &StreamId,
    record: Option<&StreamRecord>,
    expected: ExpectedVersion,
) -> Result<StreamVersion> {
    let conflict = |actual| Error::WrongExpectedVersion {
        stream_id: stream_id.clone(),
        expected,
        actual,
    };

    match record {
        None => match expected {
            ExpectedVersion::Any | ExpectedVersion::NoStream => Ok(StreamVersion::FIRST),
            ExpectedVersion::StreamExists | ExpectedVersion::Exact(_) => {
                Err(conflict(CurrentVersion::NoStream))
            }
        },
        Some(record) if record.state == StreamState::SoftDeleted => match expected {
            ExpectedVersion::Any | ExpectedVersion::NoStream => {
                Ok(StreamVersion::from_raw(record.next_version))
            }
            ExpectedVersion::StreamExists | ExpectedVersion::Exact(_) => Err(Error::StreamDeleted {
                stream_id: stream_id.clone(),
            }),
        },
        Some(record) => {
            let last = record.last_version();
            match expected {
                ExpectedVersion::Any | ExpectedVersion::StreamExists => Ok(last.next()),
                ExpectedVersion::Exact(n) if n == last.as_raw() => Ok(last.next()),
                ExpectedVersion::NoStream | ExpectedVersion::Exact(_) => {
                    Err(conflict(CurrentVersion::Version(last)))
                }
            }
        }
    }
}

// =============================================================================
// Stream Slots
// =============================================================================

#[derive(Default)]
struct StreamSlot {
    gate: Arc<Mutex<()>>,
    record: RwLock<Option<StreamRecord>>,
}

/// A range of versions reserved for one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    first: StreamVersion,
    count: usize,
    recreates: bool,
}

impl Reservation {
    pub fn first(&self) -> StreamVersion {
        self.first
    }

    pub fn last(&self) -> StreamVersion {
        StreamVersion::from_raw(self.first.as_raw() + self.count as u64 - 1)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// True when this append brings a soft-deleted stream back.
    pub fn recreates(&self) -> bool {
        self.recreates
    }

    pub fn versions(&self) -> impl Iterator<Item = StreamVersion> {
        let first = self.first.as_raw();
        (first..first + self.count as u64).map(StreamVersion::from_raw)
    }
}

// =============================================================================
// Stream Index
// =============================================================================

type SlotMap = DashMap<StreamId, Arc<StreamSlot>>;

#[derive(Default)]
pub struct StreamIndex {
    streams: Arc<SlotMap>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one recovered log entry. Entries must arrive in position order.
    pub fn replay(&self, entry: &LogEntry) -> Result<()> {
        let position = entry.global_position();
        let slot = self
            .streams
            .entry(entry.stream_id().clone())
            .or_default()
            .value()
            .clone();
        let mut guard = slot.record.write();

        match entry {
            LogEntry::Event(event) => {
                let record = guard.get_or_insert_with(StreamRecord::empty);
                if event.stream_version.as_raw() != record.next_version {
                    return Err(Error::Corruption {
                        position,
                        reason: format!(
                            "stream '{}' expected version {}, found {}",
                            event.stream_id, record.next_version, event.stream_version
                        ),
                    });
                }
                if record.state == StreamState::SoftDeleted {
                    record.state = StreamState::Active;
                    record.first_visible = record.next_version;
                    record.deleted_at = None;
                }
                record.next_version += 1;
            }
            LogEntry::Tombstone(tombstone) => match guard.as_mut() {
                Some(record)
                    if record.state == StreamState::Active
                        && record.last_version() == tombstone.last_version =>
                {
                    record.state = StreamState::SoftDeleted;
                    record.deleted_at = Some(position);
                }
                _ => {
                    return Err(Error::Corruption {
                        position,
                        reason: format!(
                            "tombstone for stream '{}' does not match its history",
                            tombstone.stream_id
                        ),
                    });
                }
            },
        }
        Ok(())
    }

    /// Snapshot of a stream's metadata. `None` if the stream was never created.
    ///
    /// Never waits for a writer holding the stream's gate.
    pub fn get(&self, stream_id: &StreamId) -> Option<StreamInfo> {
        let slot = self.streams.get(stream_id)?;
        let record = slot.record.read();
        record.as_ref().map(|r| r.info(stream_id))
    }

    /// Number of streams that have been written at least once.
    pub fn stream_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|slot| slot.value().record.read().is_some())
            .count()
    }

    /// Number of slots, including ones whose stream was never written.
    pub fn slot_count(&self) -> usize {
        self.streams.len()
    }

    /// Resolves a stream read to a version range, from one consistent snapshot.
    ///
    /// `None` means the read is past either end of the visible versions.
    /// Fails with `StreamNotFound` or `StreamDeleted` when the stream is not readable.
    pub fn read(
        &self,
        stream_id: &StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<(StreamInfo, Option<VersionRange>)> {
        let not_found = || Error::StreamNotFound {
            stream_id: stream_id.clone(),
        };
        let slot = self.streams.get(stream_id).ok_or_else(not_found)?;
        let guard = slot.record.read();
        let record = guard.as_ref().ok_or_else(not_found)?;

        if record.state == StreamState::SoftDeleted {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.clone(),
            });
        }

        let info = record.info(stream_id);
        let first = record.first_visible;
        let last = record.last_version().as_raw();
        let max = max_count as u64;

        let range = match direction {
            ReadDirection::Forward => {
                let start = from.as_raw().max(first);
                (start <= last && max > 0).then(|| VersionRange {
                    first: StreamVersion::from_raw(start),
                    last: StreamVersion::from_raw(last.min(start.saturating_add(max - 1))),
                    direction,
                })
            }
            ReadDirection::Backward => {
                let start = from.as_raw().min(last);
                (start >= first && max > 0).then(|| VersionRange {
                    first: StreamVersion::from_raw(start),
                    last: StreamVersion::from_raw(start.saturating_sub(max - 1).max(first)),
                    direction,
                })
            }
        };
        Ok((info, range))
    }

    /// Acquires the stream's writer gate. Writers of other streams are unaffected.
    pub async fn lock(&self, stream_id: &StreamId) -> StreamLock {
        let slot = self
            .streams
            .entry(stream_id.clone())
            .or_default()
            .value()
            .clone();
        let guard = slot.gate.clone().lock_owned().await;

        StreamLock {
            stream_id: stream_id.clone(),
            slot,
            streams: self.streams.clone(),
            guard: Some(guard),
        }
    }
}

// =============================================================================
// Stream Lock
// =============================================================================

/// Exclusive write access to one stream.
///
/// Dropping the lock without committing releases any reservation: the record
/// is only changed by [`commit`](StreamLock::commit) and
/// [`mark_deleted`](StreamLock::mark_deleted).
pub struct StreamLock {
    stream_id: StreamId,
    slot: Arc<StreamSlot>,
    streams: Arc<SlotMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl StreamLock {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn info(&self) -> Option<StreamInfo> {
        self.slot
            .record
            .read()
            .as_ref()
            .map(|r| r.info(&self.stream_id))
    }

    /// Validates `expected` and reserves `count` versions for an append.
    pub fn reserve_append(&self, expected: ExpectedVersion, count: usize) -> Result<Reservation> {
        if count == 0 {
            return Err(Error::InvalidArgument("append requires at least one event".into()));
        }
        let record = self.slot.record.read();
        let first = check_expected(&self.stream_id, record.as_ref(), expected)?;
        let recreates = record
            .as_ref()
            .is_some_and(|r| r.state == StreamState::SoftDeleted);

        Ok(Reservation {
            first,
            count,
            recreates,
        })
    }

    /// Validates `expected` for a delete and returns the stream's last version.
    pub fn reserve_delete(&self, expected: ExpectedVersion) -> Result<StreamVersion> {
        let record = self.slot.record.read();
        match record.as_ref() {
            None => Err(Error::StreamNotFound {
                stream_id: self.stream_id.clone(),
            }),
            Some(r) if r.state == StreamState::SoftDeleted => Err(Error::StreamDeleted {
                stream_id: self.stream_id.clone(),
            }),
            Some(r) => {
                check_expected(&self.stream_id, Some(r), expected)?;
                Ok(r.last_version())
            }
        }
    }

    /// The `count` versions starting at `from`, if all of them are visible.
    pub fn visible_range(&self, from: StreamVersion, count: usize) -> Option<VersionRange> {
        let record = self.slot.record.read();
        let record = record.as_ref()?;
        let start = from.as_raw();
        let end = start.checked_add(count as u64)?;
        if record.state != StreamState::Active
            || start < record.first_visible
            || count == 0
            || end > record.next_version
        {
            return None;
        }
        Some(VersionRange::forward(from, StreamVersion::from_raw(end - 1)))
    }

    /// Finalizes a reservation once the global log made its events durable.
    pub fn commit(&mut self, reservation: &Reservation) {
        let mut record = self.slot.record.write();
        let record = record.get_or_insert_with(StreamRecord::empty);

        debug_assert_eq!(record.next_version, reservation.first.as_raw());

        if reservation.recreates {
            record.state = StreamState::Active;
            record.first_visible = reservation.first.as_raw();
            record.deleted_at = None;
        }
        record.next_version = reservation.last().as_raw() + 1;
    }

    /// Releases a reservation whose global log append failed.
    pub fn rollback(&mut self, reservation: Reservation) {
        debug!(
            stream_id = %self.stream_id,
            first_version = %reservation.first,
            count = reservation.count,
            "released version reservation"
        );
    }

    /// Marks the stream soft-deleted at the tombstone's position.
    pub fn mark_deleted(&mut self, tombstone_position: GlobalPos) {
        if let Some(record) = self.slot.record.write().as_mut() {
            record.state = StreamState::SoftDeleted;
            record.deleted_at = Some(tombstone_position);
        }
    }
}

impl Drop for StreamLock {
    fn drop(&mut self) {
        // Release the gate first so a waiter is never stuck on a removed slot.
        drop(self.guard.take());

        // The map and this lock hold the only references: nobody is waiting.
        let slot = &self.slot;
        self.streams.remove_if(&self.stream_id, |_, s| {
            Arc::ptr_eq(s, slot) && Arc::strong_count(s) == 2 && s.record.read().is_none()
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
