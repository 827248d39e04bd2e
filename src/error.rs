//! # Error Handling for Cedar Store
//!
//! Every fallible operation in the crate returns [`Result`], whose error type is
//! the single [`Error`] enum defined here.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `std::error::Error` and `Display` from the `#[error(...)]`
//! attributes, and `From` conversions from `#[from]` attributes, so `?` turns a
//! `rusqlite::Error` into an [`Error`] without boilerplate.
//!
//! ## Error Categories
//!
//! | Category    | Variants                                   | Typical response            |
//! |-------------|--------------------------------------------|-----------------------------|
//! | Conflict    | `WrongExpectedVersion`                     | Re-read, then retry         |
//! | Stream state| `StreamDeleted`, `StreamNotFound`          | Recreate or abort           |
//! | Delivery    | `SlowConsumer`                             | Resubscribe from the cursor |
//! | Substrate   | `EngineUnavailable`, `Sqlite`, `Schema`, `Corruption` | Retry whole op or investigate |
//! | Caller bug  | `InvalidArgument`                          | Fix the request             |
//!
//! The engine never retries on a caller's behalf. Every error reaches the
//! operation that caused it.

use thiserror::Error;

use crate::types::{CurrentVersion, ExpectedVersion, GlobalPos, StreamId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict.
    ///
    /// The writer's [`ExpectedVersion`] did not match the stream. Nothing was
    /// written. Re-read the stream, re-apply business logic, and retry.
    #[error("wrong expected version on stream '{stream_id}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: CurrentVersion,
    },

    // =========================================================================
    // Stream State Errors
    // =========================================================================

    /// The operation targeted a soft-deleted stream.
    #[error("stream '{stream_id}' has been deleted")]
    StreamDeleted { stream_id: StreamId },

    /// The operation targeted a stream that was never created.
    #[error("stream '{stream_id}' not found")]
    StreamNotFound { stream_id: StreamId },

    // =========================================================================
    // Subscription Errors
    // =========================================================================

    /// A subscriber fell further behind than its buffer allows.
    ///
    /// The subscription is terminated. Events are never dropped silently: the
    /// caller resubscribes in catch-up mode from the last position it handled.
    #[error("subscription to '{target}' fell behind by {missed} notifications")]
    SlowConsumer { target: String, missed: u64 },

    // =========================================================================
    // Substrate Errors (Retry the whole operation)
    // =========================================================================

    /// The durable storage beneath the global log cannot accept writes.
    ///
    /// The in-flight operation did not take effect. Callers retry the whole
    /// operation, never assuming partial success.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// Generates `impl From<rusqlite::Error> for Error` so `?` converts
    /// automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch.
    #[error("schema error: {0}")]
    Schema(String),

    /// Stored data failed verification during recovery.
    #[error("corrupted log entry at position {position}: {reason}")]
    Corruption { position: GlobalPos, reason: String },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// A request was malformed (empty batch, reserved stream id, bad config value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns true if retrying the same operation later may succeed.
    ///
    /// Transport layers use this to pick a status code. A conflict is only
    /// retryable after the caller refreshes its view of the stream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WrongExpectedVersion { .. }
                | Error::EngineUnavailable(_)
                | Error::SlowConsumer { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
