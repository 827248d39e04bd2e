mod common;

use cedar_store::{Error, EventId, EventStore, ExpectedVersion, GlobalPos, StreamVersion};

#[tokio::test]
async fn retried_append_returns_original_events() {
    let store = EventStore::open_in_memory().await.unwrap();
    let ids: Vec<EventId> = (0..3).map(|_| EventId::new()).collect();
    let batch = || ids.iter().map(|id| common::event_with_id(*id)).collect::<Vec<_>>();

    let first = store
        .append_to_stream("payments", ExpectedVersion::NoStream, batch())
        .await
        .unwrap();
    let retry = store
        .append_to_stream("payments", ExpectedVersion::NoStream, batch())
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(retry.deduplicated);
    assert_eq!(first.events, retry.events);
    assert_eq!(first.current_version, retry.current_version);

    // Exactly one set of events was committed.
    assert_eq!(store.head_position().await.unwrap(), GlobalPos::from_raw(3));
    let slice = store
        .read_stream_forward("payments", StreamVersion::FIRST, 10)
        .await
        .unwrap();
    let stored: Vec<EventId> = slice.events.iter().map(|e| e.event_id).collect();
    assert_eq!(stored, ids);
}

#[tokio::test]
async fn retry_with_exact_version_after_other_writes() {
    let store = EventStore::open_in_memory().await.unwrap();
    store
        .append_to_stream("s", ExpectedVersion::NoStream, common::events(2))
        .await
        .unwrap();

    let id = EventId::new();
    let original = store
        .append_to_stream("s", ExpectedVersion::Exact(1), vec![common::event_with_id(id)])
        .await
        .unwrap();

    // Someone else writes in between; the retry still resolves to the original.
    store
        .append_to_stream("s", ExpectedVersion::Any, common::events(1))
        .await
        .unwrap();

    let retry = store
        .append_to_stream("s", ExpectedVersion::Exact(1), vec![common::event_with_id(id)])
        .await
        .unwrap();
    assert!(retry.deduplicated);
    assert_eq!(retry.events, original.events);
    assert_eq!(retry.current_version.as_raw(), 2);

    let info = store.stream_info("s").await.unwrap().unwrap();
    assert_eq!(info.last_version.as_raw(), 3);
}

#[tokio::test]
async fn different_batch_under_same_expectation_conflicts() {
    let store = EventStore::open_in_memory().await.unwrap();
    let (a, b) = (EventId::new(), EventId::new());

    store
        .append_to_stream(
            "s",
            ExpectedVersion::NoStream,
            vec![common::event_with_id(a), common::event_with_id(b)],
        )
        .await
        .unwrap();

    // Reordered ids are not the same append.
    let err = store
        .append_to_stream(
            "s",
            ExpectedVersion::NoStream,
            vec![common::event_with_id(b), common::event_with_id(a)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongExpectedVersion { .. }));

    // The stream never passed through version 5, so this cannot be a retry.
    let err = store
        .append_to_stream("s", ExpectedVersion::Exact(5), vec![common::event_with_id(a)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongExpectedVersion { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_commit_once() {
    let store = EventStore::open_in_memory().await.unwrap();
    let ids: Vec<EventId> = (0..2).map(|_| EventId::new()).collect();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let batch: Vec<_> = ids.iter().map(|id| common::event_with_id(*id)).collect();
        handles.push(tokio::spawn(async move {
            store
                .append_to_stream("retried", ExpectedVersion::NoStream, batch)
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results.iter().filter(|r| !r.deduplicated).count(), 1);
    assert!(results.windows(2).all(|w| w[0].events == w[1].events));
    assert_eq!(store.head_position().await.unwrap(), GlobalPos::from_raw(2));
}
