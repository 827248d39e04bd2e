#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use cedar_store::{
    EventData, EventId, EventStore, Result, StoreConfig, Subscription, SubscriptionMessage,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A temp directory and a database path inside it. Keep the dir alive.
pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub async fn open_temp_store() -> (tempfile::TempDir, PathBuf, EventStore) {
    let (dir, path) = create_temp_db_file("store.db");
    let store = EventStore::open(StoreConfig::at_path(&path))
        .await
        .expect("open store");
    (dir, path, store)
}

pub fn event(event_type: &str) -> EventData {
    EventData::json(event_type, br#"{"ok":true}"#.to_vec())
}

pub fn event_with_id(id: EventId) -> EventData {
    event("Tested").with_id(id)
}

pub fn events(n: usize) -> Vec<EventData> {
    (0..n).map(|i| event(&format!("Event{i}"))).collect()
}

/// Next subscription message, failing the test if none arrives in time.
pub async fn next_message(subscription: &mut Subscription) -> Option<Result<SubscriptionMessage>> {
    tokio::time::timeout(RECV_TIMEOUT, subscription.next())
        .await
        .expect("subscription produced nothing within timeout")
}

/// Next message that is not the `CaughtUp` marker.
pub async fn next_entry(subscription: &mut Subscription) -> SubscriptionMessage {
    loop {
        match next_message(subscription).await {
            Some(Ok(SubscriptionMessage::CaughtUp)) => continue,
            Some(Ok(message)) => return message,
            Some(Err(e)) => panic!("subscription failed: {e}"),
            None => panic!("subscription ended"),
        }
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
