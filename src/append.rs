//! # Append Engine
//!
//! The only entry point for writing events. One append is:
//!
//! ```text
//!  lock stream gate ─► validate expected version ─► reserve versions
//!        │                      │ conflict
//!        │                      └─► retry of an earlier append? ─► return it
//!        ▼
//!  global log append (durable) ─► stream index commit ─► notify subscribers
//!        │ failure
//!        └─► rollback reservation, surface EngineUnavailable
//! ```
//!
//! ## Retried Appends
//!
//! A client that loses the response to a successful append will retry it with
//! the same expected version and the same event ids. By then the stream has
//! moved on, so validation fails. Before reporting the conflict we look at the
//! exact versions the original append would have produced:
//!
//! - `Exact(n)`: versions `n+1 ..`
//! - `NoStream`: the first versions of the current stream incarnation
//!
//! If the event ids there match the batch one-for-one, the earlier events are
//! returned with `deduplicated = true` and nothing new is written. An id that
//! appears elsewhere in the stream does not count; `Any` and `StreamExists`
//! appends are never collapsed.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::index::{StreamIndex, StreamLock};
use crate::log::{GlobalLog, PendingEntry};
use crate::types::{AppendResult, EventData, ExpectedVersion, RecordedEvent, StreamId, StreamVersion};

pub struct AppendEngine {
    log: Arc<GlobalLog>,
    index: Arc<StreamIndex>,
}

impl AppendEngine {
    pub fn new(log: Arc<GlobalLog>, index: Arc<StreamIndex>) -> Self {
        Self { log, index }
    }

    /// Appends `events` atomically to `stream_id`.
    pub async fn append(
        &self,
        stream_id: StreamId,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        stream_id.validate()?;
        if events.is_empty() {
            return Err(Error::InvalidArgument(
                "append requires at least one event".into(),
            ));
        }

        let mut lock = self.index.lock(&stream_id).await;

        let reservation = match lock.reserve_append(expected, events.len()) {
            Ok(reservation) => reservation,
            Err(conflict @ Error::WrongExpectedVersion { .. }) => {
                if let Some(existing) = self.find_retried(&lock, expected, &events).await? {
                    debug!(
                        stream_id = %stream_id,
                        %expected,
                        count = existing.len(),
                        "collapsed retried append"
                    );
                    let current_version = existing
                        .last()
                        .map(|e| e.stream_version)
                        .unwrap_or(StreamVersion::FIRST);
                    return Ok(AppendResult {
                        stream_id,
                        events: existing,
                        current_version,
                        deduplicated: true,
                    });
                }
                debug!(stream_id = %stream_id, error = %conflict, "append rejected");
                return Err(conflict);
            }
            Err(other) => return Err(other),
        };

        let pending = events
            .into_iter()
            .zip(reservation.versions())
            .map(|(data, stream_version)| PendingEntry::Event {
                stream_id: stream_id.clone(),
                stream_version,
                data,
            })
            .collect();

        let outcome = self
            .log
            .append(pending, |_| lock.commit(&reservation))
            .await;

        let committed = match outcome {
            Ok(committed) => committed,
            Err(e) => {
                lock.rollback(reservation);
                return Err(e);
            }
        };

        let events: Vec<RecordedEvent> = committed
            .iter()
            .filter_map(|e| e.as_event().cloned())
            .collect();

        debug!(
            stream_id = %stream_id,
            first_version = %reservation.first(),
            count = events.len(),
            recreated = reservation.recreates(),
            "appended events"
        );

        Ok(AppendResult {
            stream_id,
            events,
            current_version: reservation.last(),
            deduplicated: false,
        })
    }

    /// Finds the events a previous, identical append committed, if any.
    async fn find_retried(
        &self,
        lock: &StreamLock,
        expected: ExpectedVersion,
        events: &[EventData],
    ) -> Result<Option<Vec<RecordedEvent>>> {
        let start = match expected {
            ExpectedVersion::Exact(n) => match n.checked_add(1) {
                Some(next) => StreamVersion::from_raw(next),
                None => return Ok(None),
            },
            ExpectedVersion::NoStream => match lock.info() {
                Some(info) => info.first_visible,
                None => return Ok(None),
            },
            ExpectedVersion::Any | ExpectedVersion::StreamExists => return Ok(None),
        };

        let Some(range) = lock.visible_range(start, events.len()) else {
            return Ok(None);
        };
        // The gate is held, so the range cannot change under the read.
        let existing = self.log.reader().read_stream(lock.stream_id(), range).await?;

        let same_ids = existing.len() == events.len()
            && existing
                .iter()
                .zip(events)
                .all(|(recorded, event)| recorded.event_id == event.event_id);
        Ok(same_ids.then_some(existing))
    }
}

// =============================================================================
// Tests
// =============================================================================
