mod common;

use std::collections::{HashMap, HashSet};

use cedar_store::{
    CurrentVersion, Error, EventId, EventStore, ExpectedVersion, GlobalPos, StreamVersion,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_keep_versions_gap_free() {
    let (_dir, _path, store) = common::open_temp_store().await;

    let mut handles = Vec::new();
    for task in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let stream = format!("stream-{}", (task + i) % 4);
                store
                    .append_to_stream(stream, ExpectedVersion::Any, common::events(1 + i % 3))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for s in 0..4 {
        let slice = store
            .read_stream_forward(format!("stream-{s}"), StreamVersion::FIRST, 10_000)
            .await
            .unwrap();
        let versions: Vec<u64> = slice.events.iter().map(|e| e.stream_version.as_raw()).collect();
        let expected: Vec<u64> = (0..versions.len() as u64).collect();
        assert_eq!(versions, expected, "stream-{s} has gaps or duplicates");
        assert_eq!(slice.last_version.as_raw() + 1, versions.len() as u64);
    }

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_positions_are_dense_and_follow_commit_order() {
    let (_dir, _path, store) = common::open_temp_store().await;

    let mut handles = Vec::new();
    for task in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut positions = Vec::new();
            for _ in 0..20 {
                let result = store
                    .append_to_stream(format!("s-{task}"), ExpectedVersion::Any, common::events(2))
                    .await
                    .unwrap();
                positions.extend(result.events.iter().map(|e| e.global_position.as_raw()));
            }
            positions
        }));
    }

    let mut all_positions = HashSet::new();
    for handle in handles {
        let positions = handle.await.unwrap();
        // Later appends by one task always land after its earlier ones.
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        for p in positions {
            assert!(all_positions.insert(p), "position {p} assigned twice");
        }
    }

    assert_eq!(all_positions.len(), 240);
    assert_eq!(store.head_position().await.unwrap(), GlobalPos::from_raw(240));

    let slice = store.read_all_forward(GlobalPos::FIRST, 1000).await.unwrap();
    let read: Vec<u64> = slice.entries.iter().map(|e| e.global_position().as_raw()).collect();
    assert_eq!(read, (0..240).collect::<Vec<_>>());
}

#[tokio::test]
async fn expected_version_mismatch_is_rejected() {
    let store = EventStore::open_in_memory().await.unwrap();

    store
        .append_to_stream("order-1", ExpectedVersion::NoStream, common::events(3))
        .await
        .unwrap();

    for wrong in [0, 1, 3, 10] {
        let err = store
            .append_to_stream("order-1", ExpectedVersion::Exact(wrong), common::events(1))
            .await
            .unwrap_err();
        match err {
            Error::WrongExpectedVersion { expected, actual, .. } => {
                assert_eq!(expected, ExpectedVersion::Exact(wrong));
                assert_eq!(actual, CurrentVersion::Version(StreamVersion::from_raw(2)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    let err = store
        .append_to_stream("order-1", ExpectedVersion::NoStream, common::events(1))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let err = store
        .append_to_stream("order-2", ExpectedVersion::StreamExists, common::events(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::WrongExpectedVersion { actual: CurrentVersion::NoStream, .. }
    ));

    let ok = store
        .append_to_stream("order-1", ExpectedVersion::Exact(2), common::events(1))
        .await
        .unwrap();
    assert_eq!(ok.current_version.as_raw(), 3);

    // Nothing from the failed attempts reached the log.
    assert_eq!(store.head_position().await.unwrap().as_raw(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_exact_appends_have_one_winner_per_version() {
    let store = EventStore::open_in_memory().await.unwrap();
    store
        .append_to_stream("contended", ExpectedVersion::NoStream, common::events(1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append_to_stream("contended", ExpectedVersion::Exact(0), common::events(1))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                winners += 1;
                assert_eq!(result.current_version.as_raw(), 1);
            }
            Err(Error::WrongExpectedVersion { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);

    let info = store.stream_info("contended").await.unwrap().unwrap();
    assert_eq!(info.last_version.as_raw(), 1);
}

#[tokio::test]
async fn same_event_id_with_advancing_version_is_a_new_event() {
    let store = EventStore::open_in_memory().await.unwrap();
    let id = EventId::new();

    let first = store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, vec![common::event_with_id(id)])
        .await
        .unwrap();
    assert_eq!(first.current_version.as_raw(), 0);

    let second = store
        .append_to_stream("stream-1", ExpectedVersion::Exact(0), vec![common::event_with_id(id)])
        .await
        .unwrap();
    assert!(!second.deduplicated);
    assert_eq!(second.current_version.as_raw(), 1);
    assert_ne!(first.first_position(), second.first_position());

    let slice = store.read_all_forward(GlobalPos::FIRST, 2).await.unwrap();
    assert_eq!(slice.events().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_streams_progress_in_parallel() {
    let store = EventStore::open_in_memory().await.unwrap();

    // Each stream is written by one task with exact expectations; no task can
    // ever see a conflict caused by another stream.
    let mut handles = Vec::new();
    for s in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let stream = format!("account-{s}");
            store
                .append_to_stream(stream.as_str(), ExpectedVersion::NoStream, common::events(1))
                .await?;
            for v in 0..30 {
                store
                    .append_to_stream(stream.as_str(), ExpectedVersion::Exact(v), common::events(1))
                    .await?;
            }
            Ok::<_, Error>(stream)
        }));
    }

    let mut versions = HashMap::new();
    for handle in handles {
        let stream = handle.await.unwrap().unwrap();
        let info = store.stream_info(stream.as_str()).await.unwrap().unwrap();
        versions.insert(stream, info.last_version.as_raw());
    }
    assert_eq!(versions.len(), 16);
    assert!(versions.values().all(|v| *v == 30));
    assert_eq!(store.head_position().await.unwrap().as_raw(), 16 * 31);
}
