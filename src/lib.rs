//! # Cedar Store - Embedded Stream Store
//!
//! Cedar Store is an event-sourcing stream store built on SQLite. It provides:
//!
//! - **Streams**: independently versioned, append-only sequences of events
//! - **A global log**: one total order over every committed event and tombstone
//! - **Optimistic concurrency**: appends state the version they expect to extend
//! - **Soft deletion**: tombstones hide a stream without rewriting history
//! - **Subscriptions**: catch-up from any point, then live, per stream or `$all`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │            EventStore / StreamStore (append, read, ...)         │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ writes                          │ reads, subscribe
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐   ┌───────────────────────────────┐
//! │ AppendEngine / DeletionEngine │   │ StreamIndex metadata          │
//! │ per-stream gates (StreamIndex)│   │ LogReader (SQLite read pool)  │
//! └───────────────┬───────────────┘   └───────────────▲───────────────┘
//!                 ▼                                   │ publish
//! ┌───────────────────────────────┐   ┌───────────────┴───────────────┐
//! │ GlobalLog                     │──►│ Notifier (broadcast channels) │
//! │ assigns positions, in order   │   └───────────────────────────────┘
//! └───────────────┬───────────────┘
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              cedar-storage-writer thread → SQLite               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Dense global order**: positions start at 0, increase by one, never repeat
//! 2. **Dense stream versions**: each stream counts 0, 1, 2, ... with no gaps
//! 3. **Atomic appends**: a batch is committed entirely or not at all
//! 4. **Durable before visible**: nothing is read or delivered before SQLite has it
//! 5. **Ordered delivery**: subscribers see entries in position order, once each
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cedar_store::{EventData, EventStore, ExpectedVersion, StoreConfig, SubscriptionMode};
//!
//! # async fn example() -> cedar_store::Result<()> {
//! let store = EventStore::open(StoreConfig::in_memory()).await?;
//!
//! store
//!     .append_to_stream("cart-7", ExpectedVersion::NoStream, vec![
//!         EventData::json("ItemAdded", br#"{"sku":"A-1"}"#.to_vec()),
//!     ])
//!     .await?;
//!
//! let mut subscription = store.subscribe_to_all(SubscriptionMode::from_start()).await?;
//! while let Some(message) = subscription.next().await {
//!     println!("{:?}", message?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`types`]: identifiers, positions, versions, events, results
//! - [`error`]: the single error enum and its retry classification
//! - [`config`]: store configuration and `CEDAR_*` environment overlay
//! - [`schema`]: SQLite DDL and connection setup
//! - [`codec`]: entry checksums
//! - [`storage`]: the dedicated writer thread, group commit and recovery
//! - [`reader`]: stream and `$all` reads from SQLite
//! - [`log`]: the global log
//! - [`index`]: per-stream metadata and writer gates
//! - [`append`] / [`delete`]: the write engines
//! - [`subscription`]: catch-up and live delivery
//! - [`api`]: [`EventStore`] and the [`StreamStore`] trait (main entry point)
//! - [`http`]: options for an HTTP transport

pub mod error;

pub mod types;

pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Entry checksums.
pub mod codec;

/// Durable persistence on a dedicated thread, plus recovery.
///
/// SQLite connections are blocking; all writes go through one thread that
/// owns the read-write connection, and async callers talk to it over channels.
pub mod storage;

pub mod reader;

pub mod log;

pub mod index;

pub mod append;

pub mod delete;

/// Catch-up and live subscriptions.
///
/// A subscription reads history from SQLite in batches, emits a
/// `CaughtUp` marker, then switches to a broadcast channel without gaps or
/// duplicates. Subscribers that fall too far behind fail with `SlowConsumer`.
pub mod subscription;

/// Async API for Cedar Store.
///
/// The main entry point is [`EventStore`](api::EventStore).
pub mod api;

pub mod http;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{EventStore, StreamStore};
pub use config::{Durability, StoreConfig};
pub use error::{Error, Result};
pub use http::MiddlewareOptions;

pub use types::{
    AppendResult, CurrentVersion, DeleteResult, EventData, EventId, ExpectedVersion, GlobalPos,
    LogEntry, ReadAllSlice, ReadDirection, ReadStreamSlice, RecordedEvent, StreamId, StreamInfo,
    StreamState, StreamTombstone, StreamVersion, ALL_STREAM,
};

pub use subscription::{CancelHandle, Subscription, SubscriptionMessage, SubscriptionMode};
