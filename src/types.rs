//! # Domain Types for Cedar Store
//!
//! This module defines the data model of the store: streams, events, positions,
//! expected versions, and the entries of the global log.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Positions are plain integers underneath, but mixing them up is a classic
//! event-store bug (passing a global position where a stream version was
//! expected reads the wrong event). Each kind of position gets its own type:
//!
//! - [`GlobalPos`]: position in the global log (`$all`), zero-based, dense,
//!   strictly increasing, never reused
//! - [`StreamVersion`]: position within one stream, zero-based, gap-free
//!
//! ```rust
//! use cedar_store::types::{GlobalPos, StreamVersion};
//!
//! let pos = GlobalPos::from_raw(7);
//! let version = StreamVersion::FIRST.next();
//! assert_eq!(pos.as_raw(), 7);
//! assert_eq!(version.as_raw(), 1);
//! ```
//!
//! ## Log Entries
//!
//! The global log holds two kinds of entries. Regular events, and tombstones
//! written when a stream is deleted. Both occupy exactly one global position:
//!
//! ```text
//! pos:   0          1          2          3             4
//!      ┌──────────┬──────────┬──────────┬─────────────┬──────────┐
//!      │ order-1  │ order-2  │ order-1  │ TOMBSTONE   │ order-2  │
//!      │ v0       │ v0       │ v1       │ order-1     │ v1       │
//!      └──────────┴──────────┴──────────┴─────────────┴──────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};

/// The reserved name of the global feed.
pub const ALL_STREAM: &str = "$all";

// =============================================================================
// Stream Identification
// =============================================================================

/// A human-readable identifier for an event stream.
///
/// In event sourcing, a stream is the sequence of events of a single entity:
/// `"order-42"`, `"account-checking-999"`. Any non-empty string other than
/// [`ALL_STREAM`] is a valid stream id.
///
/// # Rust Pattern: impl Into<String>
///
/// `StreamId::new` accepts both `&str` and `String`, so call sites stay short:
///
/// ```rust
/// use cedar_store::types::StreamId;
///
/// let stream = StreamId::new("order-42");
/// assert_eq!(stream.to_string(), "order-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream id. Validity is checked when the id is used for a write.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rejects ids that cannot name a writable stream.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidArgument("stream id must not be empty".into()));
        }
        if self.0 == ALL_STREAM {
            return Err(Error::InvalidArgument(format!(
                "'{ALL_STREAM}' is reserved for the global feed"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Caller-supplied event identifier.
///
/// The store does not enforce uniqueness of event ids. They are only used to
/// recognise a retried append (see [`crate::append`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random (v4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// Positions
// =============================================================================

/// Position of an entry in the global log.
///
/// # Invariants
///
/// - Zero-based and dense: the n-th committed entry has position n
/// - Strictly increasing in commit order
/// - Never reused or shifted, including across stream deletions and restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GlobalPos(u64);

impl GlobalPos {
    /// The position of the first entry ever written.
    pub const FIRST: GlobalPos = GlobalPos(0);

    /// Sentinel for "start at the newest entry" in backward reads.
    pub const END: GlobalPos = GlobalPos(u64::MAX);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GlobalPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of an event within its stream.
///
/// The first event of a stream has version 0, and versions are gap-free. When a
/// deleted stream is recreated, numbering continues after the last version the
/// stream ever had, so a version never names two different events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamVersion(u64);

impl StreamVersion {
    pub const FIRST: StreamVersion = StreamVersion(0);

    /// Sentinel for "start at the newest event" in backward reads.
    pub const END: StreamVersion = StreamVersion(u64::MAX);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Optimistic Concurrency
// =============================================================================

/// What the caller believes about the stream before writing.
///
/// | value          | accepted when                                   |
/// |----------------|-------------------------------------------------|
/// | `Any`          | always                                          |
/// | `NoStream`     | the stream is absent or soft-deleted            |
/// | `StreamExists` | the stream is active (has at least one event)   |
/// | `Exact(n)`     | the stream is active and its last version is n  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    StreamExists,
    Exact(u64),
}

impl From<StreamVersion> for ExpectedVersion {
    fn from(version: StreamVersion) -> Self {
        ExpectedVersion::Exact(version.as_raw())
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::StreamExists => f.write_str("stream exists"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// The actual state a write was validated against, reported on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentVersion {
    NoStream,
    Version(StreamVersion),
}

impl fmt::Display for CurrentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentVersion::NoStream => f.write_str("no stream"),
            CurrentVersion::Version(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event as submitted by a writer, before it has a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub event_id: EventId,
    pub event_type: String,
    /// Hint for consumers. The store never parses payloads.
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

impl EventData {
    /// Creates a binary event with a fresh id.
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            is_json: false,
            data: data.into(),
            metadata: None,
        }
    }

    /// Creates a JSON event with a fresh id.
    pub fn json(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            is_json: true,
            ..Self::new(event_type, data)
        }
    }

    pub fn with_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A committed event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub stream_version: StreamVersion,
    pub global_position: GlobalPos,
    /// Commit timestamp (Unix milliseconds).
    pub created_ms: u64,
}

/// Marker written to the global log when a stream is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTombstone {
    pub stream_id: StreamId,
    /// Last version the stream had when it was deleted.
    pub last_version: StreamVersion,
    pub global_position: GlobalPos,
    pub created_ms: u64,
}

/// One entry of the global log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Event(RecordedEvent),
    Tombstone(StreamTombstone),
}

impl LogEntry {
    pub fn global_position(&self) -> GlobalPos {
        match self {
            LogEntry::Event(e) => e.global_position,
            LogEntry::Tombstone(t) => t.global_position,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        match self {
            LogEntry::Event(e) => &e.stream_id,
            LogEntry::Tombstone(t) => &t.stream_id,
        }
    }

    pub fn created_ms(&self) -> u64 {
        match self {
            LogEntry::Event(e) => e.created_ms,
            LogEntry::Tombstone(t) => t.created_ms,
        }
    }

    pub fn as_event(&self) -> Option<&RecordedEvent> {
        match self {
            LogEntry::Event(e) => Some(e),
            LogEntry::Tombstone(_) => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, LogEntry::Tombstone(_))
    }
}

/// Shared handle to a committed log entry. Readers and subscribers share the
/// same allocation as the log itself.
pub type SharedEntry = Arc<LogEntry>;

// =============================================================================
// Stream Metadata
// =============================================================================

/// Lifecycle state of a stream that has been written at least once.
///
/// A stream that was never written has no state at all: lookups return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    /// Deleted. Metadata is retained, events are no longer readable by stream.
    SoftDeleted,
}

/// Snapshot of a stream's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub state: StreamState,
    /// Last version ever assigned in this stream, including deleted ones.
    pub last_version: StreamVersion,
    /// Oldest version visible on the stream read path.
    pub first_visible: StreamVersion,
    /// Position of the tombstone when the stream is deleted.
    pub deleted_at: Option<GlobalPos>,
}

impl StreamInfo {
    /// The version the next append will receive.
    pub fn next_version(&self) -> StreamVersion {
        self.last_version.next()
    }

    pub fn is_deleted(&self) -> bool {
        self.state == StreamState::SoftDeleted
    }
}

// =============================================================================
// Operation Results
// =============================================================================

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub stream_id: StreamId,
    /// The committed events, in version order.
    pub events: Vec<RecordedEvent>,
    /// Version of the last event in `events`.
    pub current_version: StreamVersion,
    /// True when the append was recognised as a retry of an earlier, already
    /// committed append. `events` are then the originally committed events.
    pub deduplicated: bool,
}

impl AppendResult {
    pub fn first_position(&self) -> Option<GlobalPos> {
        self.events.first().map(|e| e.global_position)
    }

    pub fn last_position(&self) -> Option<GlobalPos> {
        self.events.last().map(|e| e.global_position)
    }
}

/// Outcome of a successful delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub stream_id: StreamId,
    pub last_version: StreamVersion,
    pub tombstone_position: GlobalPos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// A page of events read from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamSlice {
    pub stream_id: StreamId,
    pub direction: ReadDirection,
    pub from_version: StreamVersion,
    pub events: Vec<RecordedEvent>,
    /// Version to continue from, or `None` when the slice reached the end.
    pub next_version: Option<StreamVersion>,
    pub last_version: StreamVersion,
}

impl ReadStreamSlice {
    pub fn is_end_of_stream(&self) -> bool {
        self.next_version.is_none()
    }
}

/// A page of entries read from the global log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAllSlice {
    pub direction: ReadDirection,
    pub from_position: GlobalPos,
    pub entries: Vec<LogEntry>,
    /// Position to continue from, or `None` when the slice reached the end.
    pub next_position: Option<GlobalPos>,
}

impl ReadAllSlice {
    pub fn is_end(&self) -> bool {
        self.next_position.is_none()
    }

    /// Iterates over the regular events, skipping tombstones.
    pub fn events(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.entries.iter().filter_map(LogEntry::as_event)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_validation() {
        assert!(StreamId::new("order-1").validate().is_ok());
        assert!(matches!(
            StreamId::new("").validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            StreamId::new(ALL_STREAM).validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_positions_are_ordered() {
        assert!(GlobalPos::FIRST < GlobalPos::FIRST.next());
        assert!(StreamVersion::from_raw(3) < StreamVersion::END);
        assert_eq!(StreamVersion::FIRST.next().as_raw(), 1);
    }

    #[test]
    fn test_event_data_builders() {
        let id = EventId::new();
        let event = EventData::json("OrderPlaced", br#"{"total":10}"#.to_vec())
            .with_id(id)
            .with_metadata(b"m".to_vec());

        assert!(event.is_json);
        assert_eq!(event.event_id, id);
        assert_eq!(event.metadata.as_deref(), Some(&b"m"[..]));
        assert!(!EventData::new("Blob", vec![1]).is_json);
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
        let id = EventId::new();
        assert_eq!(EventId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_expected_version_display() {
        assert_eq!(ExpectedVersion::Exact(4).to_string(), "4");
        assert_eq!(ExpectedVersion::NoStream.to_string(), "no stream");
        assert_eq!(CurrentVersion::NoStream.to_string(), "no stream");
        assert_eq!(
            ExpectedVersion::from(StreamVersion::from_raw(2)),
            ExpectedVersion::Exact(2)
        );
    }

    #[test]
    fn test_log_entry_accessors() {
        let tombstone = LogEntry::Tombstone(StreamTombstone {
            stream_id: StreamId::new("s"),
            last_version: StreamVersion::FIRST,
            global_position: GlobalPos::from_raw(9),
            created_ms: 1,
        });
        assert!(tombstone.is_tombstone());
        assert!(tombstone.as_event().is_none());
        assert_eq!(tombstone.global_position().as_raw(), 9);
        assert_eq!(tombstone.stream_id().as_str(), "s");
    }
}
