//! Request bundling.
//!
//! A bundler exists per (connection, direction) and coalesces many
//! per-partition requests into one broker RPC:
//!
//! ```text
//! queue ready ──┐
//! queue ready ──┼──> ready list ──> collect (min-count / max-wait) ──> 1 RPC
//! queue ready ──┘
//! ```
//!
//! The collect loop waits in two phases: first for any ready partition, then
//! - when fewer than `min_requests` are ready - up to `max_wait` for more.
//! That amortizes per-RPC overhead under load without adding unbounded
//! latency when traffic is light.
//!
//! Partitions are indexed topic-first in ordered maps, so every bundle
//! serializes in the same (topic, partition) order it will carry on the wire.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use skein_wire::request::FetchTarget;

use crate::buffer::QueueBuffer;
use crate::queue::{BufferKind, PartitionQueue};

/// Which direction this bundler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BundleDirection {
    /// Consumer side: partitions with free buffers are ready to fetch into.
    Fetch,
    /// Producer side: partitions with filled buffers are ready to produce.
    Produce,
}

impl BundleDirection {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Produce => "produce",
        }
    }

    const fn ready_kind(self) -> BufferKind {
        match self {
            Self::Fetch => BufferKind::Free,
            Self::Produce => BufferKind::Filled,
        }
    }
}

/// One partition of a produce bundle: the queue to ack into and the filled
/// buffer moved out of it. Travels into the connection's in-flight entry.
pub(crate) struct ProduceBundleEntry {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) queue: Arc<PartitionQueue>,
    pub(crate) buffer: QueueBuffer,
}

struct PartitionEntry {
    queue: Arc<PartitionQueue>,
    ready: bool,
}

struct BundlerState {
    topics: BTreeMap<String, BTreeMap<i32, PartitionEntry>>,
    /// Ready partitions in arrival order; its length is the collected count.
    ready: Vec<(String, i32)>,
}

/// Per-connection, per-direction aggregator of partition queues.
pub(crate) struct RequestBundler {
    direction: BundleDirection,
    state: Mutex<BundlerState>,
    ready_notify: Notify,
}

impl RequestBundler {
    pub(crate) fn new(direction: BundleDirection) -> Arc<Self> {
        Arc::new(Self {
            direction,
            state: Mutex::new(BundlerState {
                topics: BTreeMap::new(),
                ready: Vec::new(),
            }),
            ready_notify: Notify::new(),
        })
    }

    /// Inserts a queue, marking it ready if it already has a buffer of this
    /// direction's kind. Signals the collector when the ready list goes from
    /// empty to non-empty.
    pub(crate) fn add_queue(self: &Arc<Self>, queue: Arc<PartitionQueue>) {
        queue.set_bundler(Arc::downgrade(self));

        let topic = queue.topic().to_string();
        let partition = queue.partition();
        let ready = queue.has_buffer(self.direction.ready_kind()) && !queue.request_pending();

        let mut state = self.state.lock();
        let partitions = state.topics.entry(topic.clone()).or_default();
        debug_assert!(
            !partitions.contains_key(&partition),
            "queue added twice: {topic}/{partition}"
        );
        partitions.insert(partition, PartitionEntry { queue, ready });

        if ready {
            let was_empty = state.ready.is_empty();
            state.ready.push((topic, partition));
            if was_empty {
                self.ready_notify.notify_one();
            }
        }
    }

    /// Unlinks a queue and detaches its bundler back-reference.
    pub(crate) fn remove_queue(
        &self,
        topic: &str,
        partition: i32,
    ) -> Option<Arc<PartitionQueue>> {
        let mut state = self.state.lock();
        let partitions = state.topics.get_mut(topic)?;
        let entry = partitions.remove(&partition)?;
        if partitions.is_empty() {
            state.topics.remove(topic);
        }
        state.ready.retain(|(t, p)| !(t == topic && *p == partition));
        entry.queue.clear_bundler();
        Some(entry.queue)
    }

    /// Marks a partition ready if its queue has an available buffer and no
    /// request in flight. Called by the receiver and the façades after buffer
    /// movements; always wakes the collector.
    pub(crate) fn queue_has_ready_buffers(&self, topic: &str, partition: i32) {
        let mut state = self.state.lock();
        let Some(entry) = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(&partition))
        else {
            return;
        };
        if entry.ready
            || entry.queue.request_pending()
            || !entry.queue.has_buffer(self.direction.ready_kind())
        {
            return;
        }
        entry.ready = true;
        state.ready.push((topic.to_string(), partition));
        self.ready_notify.notify_one();
    }

    /// Looks up the queue for a response partition.
    pub(crate) fn find_queue(&self, topic: &str, partition: i32) -> Option<Arc<PartitionQueue>> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .map(|entry| Arc::clone(&entry.queue))
    }

    /// Removes every queue, detaching each back-reference and clearing its
    /// pending flag. Used on connection loss.
    pub(crate) fn drain(&self) -> Vec<Arc<PartitionQueue>> {
        let mut state = self.state.lock();
        state.ready.clear();
        let topics = std::mem::take(&mut state.topics);
        topics
            .into_values()
            .flat_map(BTreeMap::into_values)
            .map(|entry| {
                entry.queue.clear_bundler();
                entry.queue
            })
            .collect()
    }

    /// Two-phase wait of the batching policy: first for any ready partition,
    /// then - below `min_requests` - up to `max_wait` for more.
    async fn wait_ready(&self, min_requests: usize, max_wait: Duration) {
        // Phase 1: wait for the first ready partition.
        loop {
            {
                let state = self.state.lock();
                if !state.ready.is_empty() {
                    if state.ready.len() >= min_requests {
                        return;
                    }
                    break;
                }
            }
            self.ready_notify.notified().await;
        }

        // Phase 2: bounded wait for the rest of the bundle.
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let state = self.state.lock();
                if state.ready.len() >= min_requests {
                    return;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            if tokio::time::timeout(remaining, self.ready_notify.notified())
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Collects one fetch bundle: waits per the batching policy, then
    /// snapshots every ready partition in (topic, partition) order, marking
    /// each queue request-pending and clearing the ready list.
    pub(crate) async fn collect_fetch(
        &self,
        min_requests: usize,
        max_wait: Duration,
        max_bytes: i32,
    ) -> Vec<FetchTarget> {
        self.wait_ready(min_requests, max_wait).await;

        let mut state = self.state.lock();
        let mut targets = Vec::with_capacity(state.ready.len());
        for (topic, partitions) in &mut state.topics {
            for (partition, entry) in partitions.iter_mut() {
                if !entry.ready {
                    continue;
                }
                entry.ready = false;
                entry.queue.set_request_pending(true);
                targets.push(FetchTarget {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: entry.queue.next_offset(),
                    max_bytes,
                });
            }
        }
        state.ready.clear();

        debug!(
            direction = self.direction.as_str(),
            bundle_size = targets.len(),
            "Bundle collected"
        );
        targets
    }

    /// Collects one produce bundle, moving each ready queue's front filled
    /// buffer into the bundle.
    pub(crate) async fn collect_produce(
        &self,
        min_requests: usize,
        max_wait: Duration,
    ) -> Vec<ProduceBundleEntry> {
        self.wait_ready(min_requests, max_wait).await;

        let mut state = self.state.lock();
        let mut entries = Vec::with_capacity(state.ready.len());
        for (topic, partitions) in &mut state.topics {
            for (partition, entry) in partitions.iter_mut() {
                if !entry.ready {
                    continue;
                }
                entry.ready = false;
                if let Some(buffer) = entry.queue.take_filled_front() {
                    entry.queue.set_request_pending(true);
                    entries.push(ProduceBundleEntry {
                        topic: topic.clone(),
                        partition: *partition,
                        queue: Arc::clone(&entry.queue),
                        buffer,
                    });
                }
            }
        }
        state.ready.clear();

        debug!(
            direction = self.direction.as_str(),
            bundle_size = entries.len(),
            "Bundle collected"
        );
        entries
    }

    #[cfg(test)]
    fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl std::fmt::Debug for RequestBundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestBundler")
            .field("direction", &self.direction)
            .field("topics", &state.topics.len())
            .field("ready", &state.ready.len())
            .finish_non_exhaustive()
    }
}
