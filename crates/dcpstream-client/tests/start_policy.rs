//! Start-policy and open-retry behavior against the scripted transport.

use std::sync::Arc;
use std::time::Duration;

use dcpstream_client::testing::{accept, mutation, snapshot, OpenBehavior, ScriptedTransport};
use dcpstream_client::{
    BackoffPolicy, CheckpointStore, Feed, MemoryCheckpointStore, PartitionState, StartPolicy,
};
use dcpstream_core::{Checkpoint, FailoverEntry};

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
}

#[tokio::test(flavor = "multi_thread")]
async fn from_zero_ignores_persisted_checkpoint() {
    let store = MemoryCheckpointStore::shared();
    store
        .save(0, &Checkpoint::new(0xA, 7, 7, 7).unwrap())
        .await
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(0, accept(&[(0xA, 7)], vec![]));

    let feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(store)
        .start_policy(StartPolicy::FromZero)
        .build()
        .await
        .unwrap();

    let request = transport.open_requests(0)[0];
    assert_eq!(request.start_seqno, 0);
    assert_eq!(request.stream_uuid, 0);

    feed.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn from_checkpoint_resumes_persisted_position() {
    let store = MemoryCheckpointStore::shared();
    store
        .save(0, &Checkpoint::new(0xA, 42, 40, 50).unwrap())
        .await
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(0, accept(&[(0xA, 50)], vec![]));

    let feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(store)
        .start_policy(StartPolicy::FromCheckpoint)
        .build()
        .await
        .unwrap();

    let request = transport.open_requests(0)[0];
    assert_eq!(request.start_seqno, 42);
    assert_eq!(request.stream_uuid, 0xA);
    assert_eq!(request.snapshot_start, 40);
    assert_eq!(request.snapshot_end, 50);

    feed.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn from_now_skips_history() {
    let store = MemoryCheckpointStore::shared();
    store
        .append_failover(0, FailoverEntry::new(0x9, 5000))
        .await
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    transport.set_latest_seqno(0, 4242);
    transport.script_open(0, accept(&[(0x9, 5000)], vec![]));

    let feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(store)
        .start_policy(StartPolicy::FromNow)
        .build()
        .await
        .unwrap();

    let request = transport.open_requests(0)[0];
    assert_eq!(request.start_seqno, 4242);
    assert_eq!(request.stream_uuid, 0x9);

    feed.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn open_timeout_counts_as_attempt_and_retries() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(0, OpenBehavior::Hang);
    transport.script_open(
        0,
        accept(&[(0xA, 1)], vec![snapshot(0, 0, 1), mutation(0, 1, "late")]),
    );

    // Quorum 0 lets the feed start while the partition is still retrying.
    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(MemoryCheckpointStore::shared())
        .start_policy(StartPolicy::FromZero)
        .open_timeout(Duration::from_millis(50))
        .open_quorum(0.0)
        .backoff(fast_backoff())
        .build()
        .await
        .unwrap();

    // The partition recovers in the background on the second attempt.
    let event = feed.next().await.expect("event after retry");
    assert_eq!(event.seq, 1);
    assert_eq!(transport.opens(0), 2);
    let status = feed.status().await;
    assert_eq!(status[&0].state, PartitionState::Running);
    assert_eq!(status[&0].restarts, 1);

    feed.close().await.unwrap();
}
