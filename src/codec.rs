//! # Log Entry Checksums and Timestamps
//!
//! Every row of the `log_entries` table carries a checksum over the entry's
//! content. Recovery recomputes it, so a row modified outside the store (or
//! torn by a faulty disk) is reported as [`Error::Corruption`] instead of being
//! served to readers.
//!
//! ## Checksum Input
//!
//! Fields are fed to the hasher length-prefixed, so moving bytes from one
//! field into its neighbour changes the checksum:
//!
//! ```text
//! [kind u8][pos u64][version u64][created u64]
//! [len][stream_id] [event_id 16B] [len][event_type] [is_json u8]
//! [len][data] [has_meta u8][len][metadata]
//! ```
//!
//! [`Error::Corruption`]: crate::Error::Corruption

use std::time::{SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh3::Xxh3;

use crate::types::LogEntry;

/// Row kind for a regular event.
pub const KIND_EVENT: i64 = 0;

/// Row kind for a stream tombstone.
pub const KIND_TOMBSTONE: i64 = 1;

// =============================================================================
// Checksums
// =============================================================================

/// Computes the XXH3-64 checksum of a byte slice, little-endian encoded.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

/// Computes the checksum stored alongside a log entry.
pub fn entry_checksum(entry: &LogEntry) -> Vec<u8> {
    let mut hasher = Xxh3::new();

    match entry {
        LogEntry::Event(event) => {
            hasher.update(&[KIND_EVENT as u8]);
            hasher.update(&event.global_position.as_raw().to_le_bytes());
            hasher.update(&event.stream_version.as_raw().to_le_bytes());
            hasher.update(&event.created_ms.to_le_bytes());
            update_prefixed(&mut hasher, event.stream_id.as_str().as_bytes());
            hasher.update(event.event_id.as_bytes());
            update_prefixed(&mut hasher, event.event_type.as_bytes());
            hasher.update(&[event.is_json as u8]);
            update_prefixed(&mut hasher, &event.data);
            match &event.metadata {
                Some(metadata) => {
                    hasher.update(&[1]);
                    update_prefixed(&mut hasher, metadata);
                }
                None => hasher.update(&[0]),
            }
        }
        LogEntry::Tombstone(tombstone) => {
            hasher.update(&[KIND_TOMBSTONE as u8]);
            hasher.update(&tombstone.global_position.as_raw().to_le_bytes());
            hasher.update(&tombstone.last_version.as_raw().to_le_bytes());
            hasher.update(&tombstone.created_ms.to_le_bytes());
            update_prefixed(&mut hasher, tombstone.stream_id.as_str().as_bytes());
        }
    }

    hasher.digest().to_le_bytes().to_vec()
}

fn update_prefixed(hasher: &mut Xxh3, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
///
/// A clock set before 1970 yields 0 rather than failing the commit.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
