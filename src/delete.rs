//! # Deletion Engine
//!
//! Soft-deletes streams. A delete validates the expected version under the
//! stream's gate exactly like an append, then writes a tombstone to the
//! global log. The tombstone takes its own global position; the deleted
//! events keep theirs and stay readable through `$all`.
//!
//! Subscribers see the tombstone in position order: `$all` subscribers as a
//! [`SubscriptionMessage::Tombstone`], stream subscribers as a terminating
//! [`Error::StreamDeleted`].
//!
//! [`SubscriptionMessage::Tombstone`]: crate::subscription::SubscriptionMessage::Tombstone

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::index::StreamIndex;
use crate::log::{GlobalLog, PendingEntry};
use crate::types::{DeleteResult, ExpectedVersion, StreamId};

pub struct DeletionEngine {
    log: Arc<GlobalLog>,
    index: Arc<StreamIndex>,
}

impl DeletionEngine {
    pub fn new(log: Arc<GlobalLog>, index: Arc<StreamIndex>) -> Self {
        Self { log, index }
    }

    pub async fn delete(&self, stream_id: StreamId, expected: ExpectedVersion) -> Result<DeleteResult> {
        stream_id.validate()?;

        let mut lock = self.index.lock(&stream_id).await;
        let last_version = lock.reserve_delete(expected)?;

        let tombstone = PendingEntry::Tombstone {
            stream_id: stream_id.clone(),
            last_version,
        };
        let committed = self
            .log
            .append(vec![tombstone], |entries| {
                if let Some(entry) = entries.first() {
                    lock.mark_deleted(entry.global_position());
                }
            })
            .await?;

        let tombstone_position = committed
            .first()
            .map(|e| e.global_position())
            .ok_or_else(|| Error::EngineUnavailable("tombstone was not committed".into()))?;

        info!(
            stream_id = %stream_id,
            %last_version,
            position = %tombstone_position,
            "stream deleted"
        );

        Ok(DeleteResult {
            stream_id,
            last_version,
            tombstone_position,
        })
    }
}
