//! Testing utilities: a scripted in-memory transport.
//!
//! [`ScriptedTransport`] plays the role of the upstream cluster in tests.
//! Each partition carries a queue of [`OpenBehavior`]s consumed one per
//! open attempt (the last behavior repeats once the queue is exhausted);
//! an accepted open replays its scripted events through the observer on a
//! spawned task, one at a time, so worker-queue backpressure is exercised
//! exactly as it would be by a real transport.
//!
//! The transport records every open request, close, and emitted event for
//! assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use dcpstream_core::{
    DeletionEvent, FailoverEntry, FailoverLog, MutationEvent, PartitionId, SeqnoAdvancedEvent,
    SnapshotEvent, SnapshotType, StreamEndEvent, StreamEndReason, StreamEvent, StreamOpenEvent,
};

use crate::transport::{
    OpenOutcome, OpenStreamRequest, StreamObserver, StreamTransport, TransportError,
};

/// One step of a partition's replay script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver an event through the observer.
    Event(StreamEvent),
    /// Sleep before the next step.
    Pause(Duration),
}

/// How the transport answers one open attempt for a partition.
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    /// Accept the open and replay the script.
    Accept {
        failover: FailoverLog,
        script: Vec<ScriptStep>,
    },
    /// Demand a rollback to `seqno`.
    Rollback { seqno: u64, failover: FailoverLog },
    /// Fail the open.
    Fail(TransportError),
    /// Never complete; exercises the open timeout.
    Hang,
}

#[derive(Default)]
struct PartitionScript {
    queue: VecDeque<OpenBehavior>,
    last: Option<OpenBehavior>,
}

impl PartitionScript {
    fn next(&mut self) -> OpenBehavior {
        if let Some(behavior) = self.queue.pop_front() {
            self.last = Some(behavior.clone());
            return behavior;
        }
        self.last.clone().unwrap_or(OpenBehavior::Accept {
            failover: FailoverLog::default(),
            script: Vec::new(),
        })
    }
}

/// Scripted upstream for feed tests.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<PartitionId, PartitionScript>>,
    requests: Mutex<HashMap<PartitionId, Vec<OpenStreamRequest>>>,
    latest: Mutex<HashMap<PartitionId, u64>>,
    emitted: Mutex<HashMap<PartitionId, Arc<AtomicU64>>>,
    replays: Mutex<HashMap<PartitionId, JoinHandle<()>>>,
    closes: Mutex<HashMap<PartitionId, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an open behavior for a partition. Behaviors are consumed in
    /// order, one per open attempt; the last queued behavior repeats.
    pub fn script_open(&self, partition: PartitionId, behavior: OpenBehavior) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .queue
            .push_back(behavior);
    }

    /// Set the high seqno reported to the `FromNow` start policy.
    pub fn set_latest_seqno(&self, partition: PartitionId, seqno: u64) {
        self.latest.lock().unwrap().insert(partition, seqno);
    }

    /// All open requests observed for a partition, in order.
    pub fn open_requests(&self, partition: PartitionId) -> Vec<OpenStreamRequest> {
        self.requests
            .lock()
            .unwrap()
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of open attempts observed for a partition.
    pub fn opens(&self, partition: PartitionId) -> usize {
        self.open_requests(partition).len()
    }

    /// Number of close calls observed for a partition.
    pub fn closes(&self, partition: PartitionId) -> usize {
        self.closes
            .lock()
            .unwrap()
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }

    /// Number of scripted events delivered to the observer so far.
    pub fn emitted(&self, partition: PartitionId) -> u64 {
        self.emitted
            .lock()
            .unwrap()
            .get(&partition)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn emitted_counter(&self, partition: PartitionId) -> Arc<AtomicU64> {
        self.emitted
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        request: OpenStreamRequest,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<OpenOutcome, TransportError> {
        let partition = request.partition;
        let behavior = {
            let mut requests = self.requests.lock().unwrap();
            requests.entry(partition).or_default().push(request);
            self.scripts
                .lock()
                .unwrap()
                .entry(partition)
                .or_default()
                .next()
        };

        match behavior {
            OpenBehavior::Fail(error) => Err(error),
            OpenBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            OpenBehavior::Rollback { seqno, failover } => Ok(OpenOutcome::Rollback {
                seqno,
                failover_log: failover,
            }),
            OpenBehavior::Accept { failover, script } => {
                // Open acceptance reaches the worker ahead of any data
                // event, matching the real protocol's callback order.
                observer
                    .stream_open(StreamOpenEvent {
                        partition,
                        stream_id: 0,
                        failover_log: failover.clone(),
                    })
                    .await;
                let counter = self.emitted_counter(partition);
                let handle = tokio::spawn(replay(observer, script, counter));
                if let Some(old) = self.replays.lock().unwrap().insert(partition, handle) {
                    old.abort();
                }
                Ok(OpenOutcome::Accepted {
                    failover_log: failover,
                })
            }
        }
    }

    async fn close_stream(&self, partition: PartitionId) -> Result<(), TransportError> {
        *self.closes.lock().unwrap().entry(partition).or_default() += 1;
        if let Some(handle) = self.replays.lock().unwrap().remove(&partition) {
            handle.abort();
        }
        Ok(())
    }

    async fn latest_seqno(&self, partition: PartitionId) -> Result<u64, TransportError> {
        Ok(self
            .latest
            .lock()
            .unwrap()
            .get(&partition)
            .copied()
            .unwrap_or(0))
    }
}

async fn replay(observer: Arc<dyn StreamObserver>, steps: Vec<ScriptStep>, counter: Arc<AtomicU64>) {
    for step in steps {
        match step {
            ScriptStep::Pause(duration) => tokio::time::sleep(duration).await,
            ScriptStep::Event(event) => {
                dispatch(observer.as_ref(), event).await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn dispatch(observer: &dyn StreamObserver, event: StreamEvent) {
    match event {
        StreamEvent::Opened(e) => observer.stream_open(e).await,
        StreamEvent::Snapshot(e) => observer.snapshot_marker(e).await,
        StreamEvent::Mutation(e) => observer.mutation(e).await,
        StreamEvent::Deletion(e) => observer.deletion(e).await,
        StreamEvent::SeqnoAdvanced(e) => observer.seqno_advanced(e).await,
        StreamEvent::End(e) => observer.stream_end(e).await,
    }
}

// ---------------------------------------------------------------------
// Script construction helpers
// ---------------------------------------------------------------------

/// An `Accept` behavior from `(uuid, seqno)` failover pairs (newest first)
/// and a plain event list.
pub fn accept(failover: &[(u64, u64)], events: Vec<StreamEvent>) -> OpenBehavior {
    OpenBehavior::Accept {
        failover: failover_log(failover),
        script: events.into_iter().map(ScriptStep::Event).collect(),
    }
}

/// A failover log from `(uuid, seqno)` pairs, newest first.
pub fn failover_log(entries: &[(u64, u64)]) -> FailoverLog {
    FailoverLog::new(
        entries
            .iter()
            .map(|&(uuid, seqno)| FailoverEntry::new(uuid, seqno))
            .collect(),
    )
}

pub fn snapshot(partition: PartitionId, start: u64, end: u64) -> StreamEvent {
    StreamEvent::Snapshot(SnapshotEvent {
        partition,
        stream_id: 0,
        start_seq: start,
        end_seq: end,
        snapshot_type: SnapshotType::Memory,
    })
}

pub fn mutation(partition: PartitionId, seq: u64, key: &str) -> StreamEvent {
    StreamEvent::Mutation(MutationEvent {
        partition,
        stream_id: 0,
        seq,
        cas: seq << 8,
        flags: 0,
        expiry: 0,
        datatype: 1,
        collection: 0,
        key: Bytes::copy_from_slice(key.as_bytes()),
        value: Bytes::from(format!("{{\"seq\":{}}}", seq)),
    })
}

pub fn deletion(partition: PartitionId, seq: u64, key: &str) -> StreamEvent {
    StreamEvent::Deletion(DeletionEvent {
        partition,
        stream_id: 0,
        seq,
        cas: seq << 8,
        datatype: 0,
        collection: 0,
        key: Bytes::copy_from_slice(key.as_bytes()),
        value: Bytes::new(),
    })
}

pub fn seqno_advanced(partition: PartitionId, seq: u64) -> StreamEvent {
    StreamEvent::SeqnoAdvanced(SeqnoAdvancedEvent {
        partition,
        stream_id: 0,
        seq,
    })
}

pub fn stream_end(partition: PartitionId, reason: StreamEndReason) -> StreamEvent {
    StreamEvent::End(StreamEndEvent {
        partition,
        stream_id: 0,
        reason,
    })
}
