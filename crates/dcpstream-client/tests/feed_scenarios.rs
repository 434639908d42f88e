//! End-to-end feed scenarios against the scripted transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use dcpstream_client::testing::{
    accept, deletion, failover_log, mutation, snapshot, stream_end, OpenBehavior, ScriptStep,
    ScriptedTransport,
};
use dcpstream_client::{
    BackoffPolicy, CheckpointStore, ClientError, Feed, FeedStatus, MemoryCheckpointStore,
    PartitionState, PrefixFilter, StartPolicy,
};
use dcpstream_core::{Checkpoint, FailoverEntry, FailoverLog, PartitionId, StreamEndReason};

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
}

/// Poll `Feed::status()` until the predicate holds or the deadline passes.
async fn wait_for_status<F>(feed: &Feed, deadline: Duration, predicate: F) -> FeedStatus
where
    F: Fn(&FeedStatus) -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        let status = feed.status().await;
        if predicate(&status) {
            return status;
        }
        if start.elapsed() > deadline {
            panic!("status condition not reached in {:?}: {:?}", deadline, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// -------------------------------------------------------------------
// S1: happy path across four partitions
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s1_four_partitions_from_zero() {
    let transport = Arc::new(ScriptedTransport::new());
    for p in 0..4u16 {
        let uuid = 0x10 + p as u64;
        let mut events = vec![snapshot(p, 0, 10)];
        for seq in 1..=10 {
            events.push(mutation(p, seq, &format!("doc-{}-{}", p, seq)));
        }
        transport.script_open(p, accept(&[(uuid, 10)], events));
    }
    let store = MemoryCheckpointStore::shared();

    let mut feed = Feed::builder()
        .partitions(vec![0, 1, 2, 3])
        .worker_count(2)
        .transport(transport.clone())
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromZero)
        .build()
        .await
        .expect("feed opens");

    let mut delivered: HashMap<PartitionId, Vec<u64>> = HashMap::new();
    for _ in 0..40 {
        let event = feed.next().await.expect("event");
        feed.ack(event.partition, event.seq);
        delivered.entry(event.partition).or_default().push(event.seq);
    }

    for p in 0..4u16 {
        assert_eq!(delivered[&p], (1..=10).collect::<Vec<_>>(), "partition {}", p);
    }

    feed.close().await.unwrap();

    for p in 0..4u16 {
        let ckpt = store.load(p).await.unwrap().expect("final checkpoint");
        assert_eq!(ckpt.last_seqno, 10);
        assert_eq!(ckpt.snapshot_end, 10);
        assert_eq!(ckpt.stream_uuid, 0x10 + p as u64);
    }
}

// -------------------------------------------------------------------
// S2: key filtering
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s2_filtered_keys_never_delivered() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(
        0,
        accept(
            &[(0xA, 3)],
            vec![
                snapshot(0, 0, 3),
                mutation(0, 1, "a"),
                mutation(0, 2, "_sync:x"),
                mutation(0, 3, "b"),
            ],
        ),
    );
    let store = MemoryCheckpointStore::shared();

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport)
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromZero)
        .filter(Arc::new(PrefixFilter::new(["_sync:"])))
        .build()
        .await
        .unwrap();

    let mut keys = Vec::new();
    for _ in 0..2 {
        let event = feed.next().await.unwrap();
        keys.push(String::from_utf8(event.key.to_vec()).unwrap());
        feed.ack(event.partition, event.seq);
    }
    assert_eq!(keys, vec!["a", "b"]);

    feed.close().await.unwrap();
    let ckpt = store.load(0).await.unwrap().unwrap();
    assert_eq!(ckpt.last_seqno, 3);
}

// -------------------------------------------------------------------
// S3: stream end and resume from checkpoint
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s3_disconnect_resumes_from_checkpoint() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(
        0,
        OpenBehavior::Accept {
            failover: failover_log(&[(0xA, 5)]),
            script: vec![
                ScriptStep::Event(snapshot(0, 0, 5)),
                ScriptStep::Event(mutation(0, 1, "k1")),
                ScriptStep::Event(mutation(0, 2, "k2")),
                ScriptStep::Event(mutation(0, 3, "k3")),
                // Window for the consumer to ack and the time cadence to
                // persist seqno 3 before the disconnect lands.
                ScriptStep::Pause(Duration::from_millis(500)),
                ScriptStep::Event(stream_end(0, StreamEndReason::Disconnected)),
            ],
        },
    );
    transport.script_open(
        0,
        accept(
            &[(0xA, 5)],
            vec![snapshot(0, 3, 5), mutation(0, 4, "k4"), mutation(0, 5, "k5")],
        ),
    );
    let store = MemoryCheckpointStore::shared();

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromCheckpoint)
        .checkpoint_interval(Duration::from_millis(30))
        .checkpoint_interval_events(1000)
        .backoff(fast_backoff())
        .build()
        .await
        .unwrap();

    let mut seqs = Vec::new();
    for _ in 0..5 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
        seqs.push(event.seq);
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    assert_eq!(transport.opens(0), 2);
    let requests = transport.open_requests(0);
    assert_eq!(requests[1].start_seqno, 3, "resume from acked checkpoint");
    assert_eq!(requests[1].stream_uuid, 0xA);

    feed.close().await.unwrap();
    let ckpt = store.load(0).await.unwrap().unwrap();
    assert_eq!(ckpt.last_seqno, 5);
}

// -------------------------------------------------------------------
// S4: rollback truncates the checkpoint to the failover ancestor
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s4_rollback_truncates_and_resumes() {
    const U1: u64 = 0x0111;
    const U2: u64 = 0x0222;

    let store = MemoryCheckpointStore::shared();
    store
        .save(0, &Checkpoint::new(U1, 100, 100, 100).unwrap())
        .await
        .unwrap();
    store
        .append_failover(0, FailoverEntry::new(U1, 100))
        .await
        .unwrap();

    let transport = Arc::new(ScriptedTransport::new());
    // The server's history forked at 50: U1 is only valid to 50 there.
    transport.script_open(
        0,
        OpenBehavior::Rollback {
            seqno: 50,
            failover: failover_log(&[(U2, 120), (U1, 50)]),
        },
    );
    transport.script_open(
        0,
        accept(
            &[(U2, 120), (U1, 50)],
            vec![snapshot(0, 50, 120), mutation(0, 51, "k51"), mutation(0, 52, "k52")],
        ),
    );

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport.clone())
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromCheckpoint)
        .backoff(fast_backoff())
        .build()
        .await
        .unwrap();

    // The truncated checkpoint is persisted before the reopen.
    let truncated = store.load(0).await.unwrap().unwrap();
    assert_eq!(truncated.last_seqno, 50);
    assert_eq!(truncated.stream_uuid, U1, "uuid of the matching failover entry");

    let requests = transport.open_requests(0);
    assert_eq!(requests[0].start_seqno, 100);
    assert_eq!(requests[1].start_seqno, 50);
    assert_eq!(requests[1].stream_uuid, U1);

    let mut seqs = Vec::new();
    for _ in 0..2 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
        seqs.push(event.seq);
    }
    assert_eq!(seqs, vec![51, 52]);

    feed.close().await.unwrap();
    let ckpt = store.load(0).await.unwrap().unwrap();
    assert_eq!(ckpt.last_seqno, 52);
    // The new history was adopted on the accepted reopen.
    assert_eq!(ckpt.stream_uuid, U2);
}

// -------------------------------------------------------------------
// S5: abandonment is contained to the failing partition
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s5_abandoned_partition_does_not_stop_the_feed() {
    let transport = Arc::new(ScriptedTransport::new());
    for p in 0..3u16 {
        transport.script_open(
            p,
            accept(
                &[(0x20 + p as u64, 2)],
                vec![snapshot(p, 0, 2), mutation(p, 1, "a"), mutation(p, 2, "b")],
            ),
        );
    }
    // Partition 3 never opens.
    transport.script_open(
        3,
        OpenBehavior::Fail(dcpstream_client::TransportError::Transient(
            "partition offline".into(),
        )),
    );
    let store = MemoryCheckpointStore::shared();

    let mut feed = Feed::builder()
        .partitions(vec![0, 1, 2, 3])
        .transport(transport.clone())
        .checkpoint_store(store)
        .start_policy(StartPolicy::FromZero)
        .open_quorum(0.75)
        .max_restart_attempts(2)
        .backoff(fast_backoff())
        .build()
        .await
        .expect("quorum of 3/4 opens");

    let status = wait_for_status(&feed, Duration::from_secs(5), |s| {
        s[&3].state == PartitionState::Abandoned
    })
    .await;
    assert_eq!(status[&3].state.to_string(), "abandoned");
    assert!(status[&3].restarts >= 2);
    assert!(status[&3].last_error.is_some());

    // The healthy partitions keep delivering.
    let mut delivered: HashMap<PartitionId, Vec<u64>> = HashMap::new();
    for _ in 0..6 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
        delivered.entry(event.partition).or_default().push(event.seq);
    }
    for p in 0..3u16 {
        assert_eq!(delivered[&p], vec![1, 2]);
    }

    let status = feed.status().await;
    for p in 0..3u16 {
        assert_eq!(status[&p].state, PartitionState::Running);
    }

    feed.close().await.unwrap();
}

// -------------------------------------------------------------------
// S6: a stalled consumer backpressures without losing events
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn s6_backpressure_holds_and_catches_up() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut events = vec![snapshot(0, 0, 50)];
    for seq in 1..=50 {
        events.push(mutation(0, seq, &format!("k{}", seq)));
    }
    transport.script_open(0, accept(&[(0xA, 50)], events));
    let store = MemoryCheckpointStore::shared();

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .worker_count(1)
        .queue_depth(2)
        .feed_buffer(2)
        .transport(transport.clone())
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromZero)
        .build()
        .await
        .unwrap();

    // Consume two events, then stall without acking.
    let mut seqs = Vec::new();
    for _ in 0..2 {
        let event = feed.next().await.unwrap();
        seqs.push(event.seq);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Bounded queues held the transport back; most of the script is
    // still undelivered, and nothing was dropped.
    let emitted = transport.emitted(0);
    assert!(emitted < 20, "transport should be backpressured, emitted {}", emitted);

    // Resume consuming; delivery catches up in order.
    while seqs.len() < 50 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
        seqs.push(event.seq);
    }
    feed.ack(0, 50);
    assert_eq!(seqs, (1..=50).collect::<Vec<_>>());

    feed.close().await.unwrap();
    let ckpt = store.load(0).await.unwrap().unwrap();
    assert_eq!(ckpt.last_seqno, 50);
}

// -------------------------------------------------------------------
// Deletions flow through the same ordered path
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn deletions_and_mutations_share_partition_order() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(
        0,
        accept(
            &[(0xA, 4)],
            vec![
                snapshot(0, 0, 4),
                mutation(0, 1, "created"),
                deletion(0, 2, "created"),
                mutation(0, 3, "other"),
                deletion(0, 4, "other"),
            ],
        ),
    );

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport)
        .checkpoint_store(MemoryCheckpointStore::shared())
        .start_policy(StartPolicy::FromZero)
        .build()
        .await
        .unwrap();

    use dcpstream_core::FeedOpcode::{Deletion, Mutation};
    let mut saw = Vec::new();
    for _ in 0..4 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
        saw.push((event.seq, event.opcode));
    }
    assert_eq!(saw, vec![(1, Mutation), (2, Deletion), (3, Mutation), (4, Deletion)]);

    feed.close().await.unwrap();
}

// -------------------------------------------------------------------
// Quorum failure surfaces from build()
// -------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn quorum_not_reached_fails_open() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_open(
        0,
        OpenBehavior::Fail(dcpstream_client::TransportError::Transient("down".into())),
    );

    let err = Feed::builder()
        .partitions(vec![0])
        .transport(transport)
        .checkpoint_store(MemoryCheckpointStore::shared())
        .backoff(fast_backoff())
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::QuorumNotReached { opened: 0, required: 1 }));
}

// -------------------------------------------------------------------
// Checkpoint save failures degrade durability without stopping delivery
// -------------------------------------------------------------------

struct FlakyStore {
    inner: MemoryCheckpointStore,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            fail_saves: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn load(&self, partition: PartitionId) -> dcpstream_client::Result<Option<Checkpoint>> {
        self.inner.load(partition).await
    }

    async fn save(
        &self,
        partition: PartitionId,
        checkpoint: &Checkpoint,
    ) -> dcpstream_client::Result<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(ClientError::CheckpointStore("disk full".into()));
        }
        self.inner.save(partition, checkpoint).await
    }

    async fn truncate(
        &self,
        partition: PartitionId,
        checkpoint: &Checkpoint,
    ) -> dcpstream_client::Result<()> {
        self.inner.truncate(partition, checkpoint).await
    }

    async fn append_failover(
        &self,
        partition: PartitionId,
        entry: FailoverEntry,
    ) -> dcpstream_client::Result<()> {
        self.inner.append_failover(partition, entry).await
    }

    async fn failover_log(&self, partition: PartitionId) -> dcpstream_client::Result<FailoverLog> {
        self.inner.failover_log(partition).await
    }

    async fn replace_failover(
        &self,
        partition: PartitionId,
        log: FailoverLog,
    ) -> dcpstream_client::Result<()> {
        self.inner.replace_failover(partition, log).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_failures_flag_degraded_but_delivery_continues() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut events = vec![snapshot(0, 0, 10)];
    for seq in 1..=10 {
        events.push(mutation(0, seq, &format!("k{}", seq)));
    }
    transport.script_open(0, accept(&[(0xA, 10)], events));

    let store = Arc::new(FlakyStore::new());
    store.fail_saves.store(true, Ordering::Relaxed);

    let mut feed = Feed::builder()
        .partitions(vec![0])
        .transport(transport)
        .checkpoint_store(store.clone())
        .start_policy(StartPolicy::FromZero)
        .checkpoint_interval(Duration::from_millis(20))
        .checkpoint_interval_events(1)
        .build()
        .await
        .unwrap();

    // Consume and ack while saves fail.
    for _ in 0..5 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
    }
    let status = wait_for_status(&feed, Duration::from_secs(5), |s| s[&0].degraded).await;
    assert!(status[&0].degraded);

    // Delivery never stopped.
    for _ in 0..5 {
        let event = feed.next().await.unwrap();
        feed.ack(event.partition, event.seq);
    }

    // Saves recover; the degraded flag clears and progress persists.
    store.fail_saves.store(false, Ordering::Relaxed);
    wait_for_status(&feed, Duration::from_secs(5), |s| {
        !s[&0].degraded && s[&0].last_seqno == 10
    })
    .await;

    feed.close().await.unwrap();
    assert_eq!(store.load(0).await.unwrap().unwrap().last_seqno, 10);
}
