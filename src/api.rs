//! # Async API for Cedar Store
//!
//! [`StreamStore`] is the capability set every embedding of the engine offers:
//! append, read (by stream or `$all`, in either direction), delete, and
//! subscribe. [`EventStore`] is the in-process implementation. A networked
//! client would implement the same trait on top of its transport, so callers
//! never branch on how the engine is hosted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Async Tasks (callers)                     │
//! └───────────────┬─────────────────────┬────────────────────────────┘
//!                 │ append / delete     │ read / subscribe
//!                 ▼                     ▼
//!  ┌─────────────────────────┐   ┌─────────────────────────┐
//!  │ AppendEngine            │   │ StreamIndex snapshot    │
//!  │ DeletionEngine          │   │ LogReader (SQLite pool) │
//!  │  (per-stream gate)      │   │ Notifier channels       │
//!  └───────────┬─────────────┘   └─────────────────────────┘
//!              ▼
//!  ┌─────────────────────────┐     ┌────────────────────────────────┐
//!  │ GlobalLog (sequencer)   │────►│ cedar-storage-writer thread    │
//!  │ position assignment     │     │ group commit, read-write conn  │
//!  └─────────────────────────┘     └────────────────────────────────┘
//! ```
//!
//! ## Cancellation Safety
//!
//! `append_to_stream` and `delete_stream` run their commit on a spawned task.
//! A caller that drops the future (timeout, disconnect) cannot leave a commit
//! half done; the write completes or fails on its own and the outcome is
//! visible to the next reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::append::AppendEngine;
use crate::config::StoreConfig;
use crate::delete::DeletionEngine;
use crate::error::{Error, Result};
use crate::index::StreamIndex;
use crate::log::GlobalLog;
use crate::reader::LogReader;
use crate::schema::Database;
use crate::storage::{recover, spawn_storage_writer, StorageHandle};
use crate::subscription::{Notifier, Subscription, SubscriptionMode, SubscriptionSettings};
use crate::types::{
    AppendResult, DeleteResult, EventData, ExpectedVersion, GlobalPos, ReadAllSlice,
    ReadDirection, ReadStreamSlice, StreamId, StreamInfo, StreamVersion,
};

// =============================================================================
// The StreamStore Trait
// =============================================================================

/// Operations every stream store offers, however it is hosted.
///
/// Unsubscribing is done on the returned [`Subscription`] (`cancel`, a
/// [`CancelHandle`](crate::subscription::CancelHandle), or dropping it).
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Appends events atomically under optimistic concurrency.
    async fn append_to_stream(
        &self,
        stream_id: StreamId,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult>;

    /// Reads a stream from `from` (inclusive) towards its end.
    async fn read_stream_forward(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice>;

    /// Reads a stream from `from` (inclusive, `StreamVersion::END` for the
    /// newest event) towards its start.
    async fn read_stream_backward(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice>;

    /// Reads the global log from `from` (inclusive) towards the head.
    async fn read_all_forward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice>;

    /// Reads the global log from `from` (inclusive, `GlobalPos::END` for the
    /// newest entry) towards the start.
    async fn read_all_backward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice>;

    /// Soft-deletes a stream.
    async fn delete_stream(&self, stream_id: StreamId, expected: ExpectedVersion) -> Result<DeleteResult>;

    async fn subscribe_to_stream(
        &self,
        stream_id: StreamId,
        mode: SubscriptionMode<StreamVersion>,
    ) -> Result<Subscription>;

    async fn subscribe_to_all(&self, mode: SubscriptionMode<GlobalPos>) -> Result<Subscription>;

    /// Metadata of a stream, `None` if it was never created.
    async fn stream_info(&self, stream_id: StreamId) -> Result<Option<StreamInfo>>;

    /// The position the next committed entry will receive.
    async fn head_position(&self) -> Result<GlobalPos>;
}

// =============================================================================
// EventStore - The Embedded Engine
// =============================================================================

/// The embedded stream store.
///
/// # Thread Safety
///
/// `EventStore` is `Clone`, `Send`, and `Sync`. Clones share one engine.
///
/// # Example
///
/// ```rust,no_run
/// use cedar_store::{EventData, EventStore, ExpectedVersion, StoreConfig};
///
/// # async fn example() -> cedar_store::Result<()> {
/// let store = EventStore::open(StoreConfig::at_path("events.db")).await?;
///
/// let result = store
///     .append_to_stream("order-1", ExpectedVersion::NoStream, vec![
///         EventData::json("OrderPlaced", br#"{"total":42}"#.to_vec()),
///     ])
///     .await?;
/// assert_eq!(result.current_version.as_raw(), 0);
///
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<GlobalLog>,
    index: Arc<StreamIndex>,
    appender: AppendEngine,
    deleter: DeletionEngine,
    storage: StorageHandle,
    storage_thread: Mutex<Option<JoinHandle<()>>>,
    config: StoreConfig,
    shut_down: AtomicBool,
}

impl EventStore {
    /// Opens (or creates) a store, recovering any persisted log.
    ///
    /// Recovery streams every entry back, verifies positions and checksums,
    /// and rebuilds stream metadata before the store accepts operations.
    /// Entries are not kept in memory afterwards.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let storage_config = config.storage.clone();
        let (db, index, head) = tokio::task::spawn_blocking(move || -> Result<_> {
            let db = match &storage_config.path {
                Some(path) => Database::open(path, storage_config.durability)?,
                None => Database::open_in_memory()?,
            };
            let index = StreamIndex::new();
            let head = recover(db.connection(), |entry| index.replay(entry))?;
            Ok((db, index, head))
        })
        .await
        .map_err(|e| Error::EngineUnavailable(format!("recovery task failed: {e}")))??;

        Self::start(config, db, index, head)
    }

    /// Opens a store that lives only in memory.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory()).await
    }

    fn start(config: StoreConfig, db: Database, index: StreamIndex, head: GlobalPos) -> Result<Self> {
        let index = Arc::new(index);
        let conn = db.into_shared();

        // An in-memory database exists only on the writer's connection.
        let reader = match &config.storage.path {
            Some(path) => LogReader::open(path, config.storage.reader_connections)?,
            None => LogReader::shared(conn.clone()),
        };
        let (storage, storage_thread) = spawn_storage_writer(conn, config.storage.max_group_size)?;
        let notifier = Arc::new(Notifier::new(config.subscriptions.effective_channel_capacity()));
        let log = Arc::new(GlobalLog::new(head, storage.clone(), Arc::new(reader), notifier));

        info!(
            path = ?config.storage.path,
            entries = head.as_raw(),
            streams = index.stream_count(),
            reader_connections = log.reader().connection_count(),
            channel_capacity = log.notifier().capacity(),
            "event store opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                appender: AppendEngine::new(log.clone(), index.clone()),
                deleter: DeletionEngine::new(log.clone(), index.clone()),
                log,
                index,
                storage,
                storage_thread: Mutex::new(Some(storage_thread)),
                config,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::EngineUnavailable("store has been shut down".into()));
        }
        Ok(())
    }

    fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            catchup_batch_size: self.inner.config.subscriptions.catchup_batch_size,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends events to a stream. See [`StreamStore::append_to_stream`].
    pub async fn append_to_stream(
        &self,
        stream_id: impl Into<StreamId>,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        self.ensure_running()?;
        let inner = self.inner.clone();
        let stream_id = stream_id.into();

        tokio::spawn(async move { inner.appender.append(stream_id, expected, events).await })
            .await
            .map_err(|e| Error::EngineUnavailable(format!("append task failed: {e}")))?
    }

    /// Soft-deletes a stream. See [`StreamStore::delete_stream`].
    pub async fn delete_stream(
        &self,
        stream_id: impl Into<StreamId>,
        expected: ExpectedVersion,
    ) -> Result<DeleteResult> {
        self.ensure_running()?;
        let inner = self.inner.clone();
        let stream_id = stream_id.into();

        tokio::spawn(async move { inner.deleter.delete(stream_id, expected).await })
            .await
            .map_err(|e| Error::EngineUnavailable(format!("delete task failed: {e}")))?
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn read_stream_forward(
        &self,
        stream_id: impl Into<StreamId>,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        self.read_stream(stream_id.into(), from, max_count, ReadDirection::Forward)
            .await
    }

    pub async fn read_stream_backward(
        &self,
        stream_id: impl Into<StreamId>,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        self.read_stream(stream_id.into(), from, max_count, ReadDirection::Backward)
            .await
    }

    pub async fn read_all_forward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice> {
        self.read_all(from, max_count, ReadDirection::Forward).await
    }

    pub async fn read_all_backward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice> {
        self.read_all(from, max_count, ReadDirection::Backward).await
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        max_count: usize,
        direction: ReadDirection,
    ) -> Result<ReadStreamSlice> {
        self.ensure_running()?;
        ensure_positive(max_count)?;
        let (info, range) = self.inner.index.read(&stream_id, from, max_count, direction)?;

        let events = match range {
            Some(range) => self.inner.log.reader().read_stream(&stream_id, range).await?,
            None => Vec::new(),
        };

        let last_read = events.last().map(|e| e.stream_version);
        let next_version = match direction {
            ReadDirection::Forward => last_read
                .filter(|v| *v < info.last_version)
                .map(|v| v.next()),
            ReadDirection::Backward => last_read
                .filter(|v| *v > info.first_visible)
                .map(|v| StreamVersion::from_raw(v.as_raw() - 1)),
        };

        Ok(ReadStreamSlice {
            stream_id,
            direction,
            from_version: from,
            events,
            next_version,
            last_version: info.last_version,
        })
    }

    async fn read_all(&self, from: GlobalPos, max_count: usize, direction: ReadDirection) -> Result<ReadAllSlice> {
        self.ensure_running()?;
        ensure_positive(max_count)?;
        let log = &self.inner.log;

        // One head for both the read bound and the end-of-log check.
        let head = log.head();
        let entries = log.reader().read_all(from, max_count, direction, head).await?;

        let last_read = entries.last().map(|e| e.global_position().as_raw());
        let next_position = match direction {
            ReadDirection::Forward => last_read
                .map(|p| p + 1)
                .filter(|p| *p < head.as_raw())
                .map(GlobalPos::from_raw),
            ReadDirection::Backward => last_read
                .and_then(|p| p.checked_sub(1))
                .map(GlobalPos::from_raw),
        };

        Ok(ReadAllSlice {
            direction,
            from_position: from,
            entries,
            next_position,
        })
    }

    /// Metadata of a stream, `None` if it was never created.
    pub async fn stream_info(&self, stream_id: impl Into<StreamId>) -> Result<Option<StreamInfo>> {
        self.ensure_running()?;
        Ok(self.inner.index.get(&stream_id.into()))
    }

    /// The position the next committed entry will receive.
    pub async fn head_position(&self) -> Result<GlobalPos> {
        self.ensure_running()?;
        Ok(self.inner.log.head())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn subscribe_to_stream(
        &self,
        stream_id: impl Into<StreamId>,
        mode: SubscriptionMode<StreamVersion>,
    ) -> Result<Subscription> {
        self.ensure_running()?;
        Subscription::to_stream(
            stream_id.into(),
            self.inner.log.clone(),
            &self.inner.index,
            mode,
            self.subscription_settings(),
        )
    }

    pub async fn subscribe_to_all(&self, mode: SubscriptionMode<GlobalPos>) -> Result<Subscription> {
        self.ensure_running()?;
        Subscription::to_all(
            self.inner.log.clone(),
            mode,
            self.subscription_settings(),
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Shuts the store down.
    ///
    /// 1. Marks the store closed; new operations fail with `EngineUnavailable`
    /// 2. Terminates every subscription (blocked `next()` calls return `None`)
    /// 3. Lets the storage writer finish queued writes, then joins its thread
    ///
    /// Calling it more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.log.notifier().shutdown();
        self.inner.storage.shutdown().await;

        let storage_thread = self.inner.storage_thread.lock().take();
        if let Some(handle) = storage_thread {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        info!(head = %self.inner.log.head(), "event store shut down");
    }
}

/// A page size of zero could never report progress.
fn ensure_positive(max_count: usize) -> Result<()> {
    if max_count == 0 {
        return Err(Error::InvalidArgument("max_count must be at least 1".into()));
    }
    Ok(())
}

#[async_trait]
impl StreamStore for EventStore {
    async fn append_to_stream(
        &self,
        stream_id: StreamId,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        EventStore::append_to_stream(self, stream_id, expected, events).await
    }

    async fn read_stream_forward(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        EventStore::read_stream_forward(self, stream_id, from, max_count).await
    }

    async fn read_stream_backward(
        &self,
        stream_id: StreamId,
        from: StreamVersion,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        EventStore::read_stream_backward(self, stream_id, from, max_count).await
    }

    async fn read_all_forward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice> {
        EventStore::read_all_forward(self, from, max_count).await
    }

    async fn read_all_backward(&self, from: GlobalPos, max_count: usize) -> Result<ReadAllSlice> {
        EventStore::read_all_backward(self, from, max_count).await
    }

    async fn delete_stream(&self, stream_id: StreamId, expected: ExpectedVersion) -> Result<DeleteResult> {
        EventStore::delete_stream(self, stream_id, expected).await
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: StreamId,
        mode: SubscriptionMode<StreamVersion>,
    ) -> Result<Subscription> {
        EventStore::subscribe_to_stream(self, stream_id, mode).await
    }

    async fn subscribe_to_all(&self, mode: SubscriptionMode<GlobalPos>) -> Result<Subscription> {
        EventStore::subscribe_to_all(self, mode).await
    }

    async fn stream_info(&self, stream_id: StreamId) -> Result<Option<StreamInfo>> {
        EventStore::stream_info(self, stream_id).await
    }

    async fn head_position(&self) -> Result<GlobalPos> {
        EventStore::head_position(self).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogEntry;

    async fn test_store() -> (EventStore, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = EventStore::open(StoreConfig::at_path(temp_dir.path().join("test.db")))
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn events(n: usize) -> Vec<EventData> {
        (0..n)
            .map(|i| EventData::new("Tested", format!("event {i}").into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_open_and_shutdown() {
        let (store, _temp_dir) = test_store().await;
        assert_eq!(store.head_position().await.unwrap(), GlobalPos::FIRST);
        store.shutdown().await;
        store.shutdown().await;
        assert!(store.is_shut_down());
    }

    #[tokio::test]
    async fn test_append_and_read_stream() {
        let (store, _temp_dir) = test_store().await;

        let result = store
            .append_to_stream("s", ExpectedVersion::NoStream, events(3))
            .await
            .unwrap();
        assert_eq!(result.current_version.as_raw(), 2);
        assert_eq!(result.first_position(), Some(GlobalPos::FIRST));

        let slice = store.read_stream_forward("s", StreamVersion::FIRST, 2).await.unwrap();
        assert_eq!(slice.events.len(), 2);
        assert_eq!(slice.next_version, Some(StreamVersion::from_raw(2)));
        assert!(!slice.is_end_of_stream());

        let rest = store.read_stream_forward("s", StreamVersion::from_raw(2), 10).await.unwrap();
        assert_eq!(rest.events.len(), 1);
        assert!(rest.is_end_of_stream());

        let backward = store.read_stream_backward("s", StreamVersion::END, 10).await.unwrap();
        let versions: Vec<u64> = backward.events.iter().map(|e| e.stream_version.as_raw()).collect();
        assert_eq!(versions, vec![2, 1, 0]);
        assert!(backward.is_end_of_stream());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_missing_stream() {
        let (store, _temp_dir) = test_store().await;
        let err = store.read_stream_forward("nope", StreamVersion::FIRST, 1).await.unwrap_err();
        assert!(matches!(err, Error::StreamNotFound { .. }));
        assert!(store.stream_info("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_all_pages() {
        let (store, _temp_dir) = test_store().await;
        store.append_to_stream("a", ExpectedVersion::Any, events(2)).await.unwrap();
        store.append_to_stream("b", ExpectedVersion::Any, events(1)).await.unwrap();
        store.delete_stream("a", ExpectedVersion::Any).await.unwrap();

        let first = store.read_all_forward(GlobalPos::FIRST, 3).await.unwrap();
        assert_eq!(first.entries.len(), 3);
        assert_eq!(first.next_position, Some(GlobalPos::from_raw(3)));

        let second = store.read_all_forward(GlobalPos::from_raw(3), 3).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(matches!(second.entries[0], LogEntry::Tombstone(_)));
        assert!(second.is_end());

        let backward = store.read_all_backward(GlobalPos::END, 2).await.unwrap();
        let positions: Vec<u64> = backward
            .entries
            .iter()
            .map(|e| e.global_position().as_raw())
            .collect();
        assert_eq!(positions, vec![3, 2]);
        assert_eq!(backward.next_position, Some(GlobalPos::from_raw(1)));
    }

    #[tokio::test]
    async fn test_zero_max_count_is_rejected() {
        let (store, _temp_dir) = test_store().await;
        store.append_to_stream("s", ExpectedVersion::NoStream, events(2)).await.unwrap();

        assert!(matches!(
            store.read_stream_forward("s", StreamVersion::FIRST, 0).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_stream_backward("s", StreamVersion::END, 0).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_all_forward(GlobalPos::FIRST, 0).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_all_backward(GlobalPos::END, 0).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_come_from_reader_connections() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = StoreConfig::at_path(temp_dir.path().join("pool.db"));
        config.storage.reader_connections = 2;
        let store = EventStore::open(config).await.unwrap();

        store.append_to_stream("s", ExpectedVersion::NoStream, events(3)).await.unwrap();
        assert_eq!(store.inner.log.reader().connection_count(), 2);

        // Alternate connections must both see the committed rows.
        for _ in 0..2 {
            let slice = store.read_stream_forward("s", StreamVersion::FIRST, 10).await.unwrap();
            assert_eq!(slice.events.len(), 3);
        }
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let (store, _temp_dir) = test_store().await;
        store.shutdown().await;

        assert!(matches!(
            store.append_to_stream("s", ExpectedVersion::Any, events(1)).await,
            Err(Error::EngineUnavailable(_))
        ));
        assert!(matches!(
            store.subscribe_to_all(SubscriptionMode::Live).await,
            Err(Error::EngineUnavailable(_))
        ));
        assert!(matches!(
            store.read_all_forward(GlobalPos::FIRST, 1).await,
            Err(Error::EngineUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let store: Arc<dyn StreamStore> = Arc::new(EventStore::open_in_memory().await.unwrap());
        store
            .append_to_stream(StreamId::new("s"), ExpectedVersion::NoStream, events(1))
            .await
            .unwrap();
        let info = store.stream_info(StreamId::new("s")).await.unwrap().unwrap();
        assert_eq!(info.last_version, StreamVersion::FIRST);
        assert_eq!(store.head_position().await.unwrap(), GlobalPos::from_raw(1));
    }
}
