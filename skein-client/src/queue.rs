//! Per-partition buffer queues.
//!
//! A `PartitionQueue` owns a fixed ring of buffers split across a `free` and
//! a `filled` list, plus an `outstanding` count for buffers temporarily held
//! by the façade or by an in-flight produce entry. Every owned buffer is in
//! exactly one of those three places at all times.
//!
//! The queue is the synchronization point between three parties:
//! - the **façade** (consumer or producer) exchanging buffers, possibly
//!   blocking on the notify;
//! - the **receiver** publishing fetched sets and recycling produce acks;
//! - the **bundler** observing readiness through `has_buffer` +
//!   `request_pending`.
//!
//! Queue methods never call into the bundler while holding the queue lock:
//! mutations return the bundler to signal (if any) and the caller signals
//! after the lock is released. The system-wide lock order is
//! topology → bundler → queue.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use skein_core::{ClientError, Result};

use crate::buffer::QueueBuffer;
use crate::bundler::RequestBundler;

/// The two buffer lists a bundler can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    /// Empty buffers, ready to receive a fetch.
    Free,
    /// Full buffers, ready to be produced.
    Filled,
}

struct QueueState {
    free: VecDeque<QueueBuffer>,
    filled: VecDeque<QueueBuffer>,
    /// Buffers held by the façade or an in-flight produce entry.
    outstanding: usize,
    /// Next offset to fetch; negative values are the latest/earliest
    /// sentinels until the connection manager resolves them.
    next_offset: i64,
    /// True while an RPC covering this partition is in flight.
    request_pending: bool,
    bundler: Option<Weak<RequestBundler>>,
    failed: Option<ClientError>,
    detached: bool,
}

impl QueueState {
    fn bundler_arc(&self) -> Option<Arc<RequestBundler>> {
        self.bundler.as_ref().and_then(Weak::upgrade)
    }
}

/// Buffer ring for one (topic, partition).
pub(crate) struct PartitionQueue {
    topic: String,
    partition: i32,
    nbufs: usize,
    state: Mutex<QueueState>,
    /// Wakes the façade: filled arrival (consumer), free arrival (producer),
    /// or error injection.
    buffer_notify: Notify,
}

impl PartitionQueue {
    /// Builds a queue with `nbufs` preallocated buffers of `capacity` bytes.
    pub(crate) fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        nbufs: usize,
        capacity: usize,
    ) -> Arc<Self> {
        let free = (0..nbufs).map(|_| QueueBuffer::new(capacity)).collect();
        Arc::new(Self {
            topic: topic.into(),
            partition,
            nbufs,
            state: Mutex::new(QueueState {
                free,
                filled: VecDeque::new(),
                outstanding: 0,
                next_offset: initial_offset,
                request_pending: false,
                bundler: None,
                failed: None,
                detached: false,
            }),
            buffer_notify: Notify::new(),
        })
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn partition(&self) -> i32 {
        self.partition
    }

    pub(crate) fn next_offset(&self) -> i64 {
        self.state.lock().next_offset
    }

    pub(crate) fn set_next_offset(&self, offset: i64) {
        self.state.lock().next_offset = offset;
    }

    pub(crate) fn request_pending(&self) -> bool {
        self.state.lock().request_pending
    }

    pub(crate) fn set_request_pending(&self, pending: bool) {
        self.state.lock().request_pending = pending;
    }

    pub(crate) fn has_buffer(&self, kind: BufferKind) -> bool {
        let state = self.state.lock();
        match kind {
            BufferKind::Free => !state.free.is_empty(),
            BufferKind::Filled => !state.filled.is_empty(),
        }
    }

    pub(crate) fn set_bundler(&self, bundler: Weak<RequestBundler>) {
        self.state.lock().bundler = Some(bundler);
    }

    /// Detaches the queue from its bundler. Clears `request_pending`: a
    /// response for any outstanding RPC will no longer find this queue.
    pub(crate) fn clear_bundler(&self) {
        let mut state = self.state.lock();
        state.bundler = None;
        state.request_pending = false;
    }

    pub(crate) fn bundler(&self) -> Option<Arc<RequestBundler>> {
        self.state.lock().bundler_arc()
    }

    /// Marks the queue failed and wakes the façade. Already-filled buffers
    /// still drain on the consume side before the error surfaces.
    pub(crate) fn inject_error(&self, error: ClientError) {
        {
            let mut state = self.state.lock();
            if state.failed.is_none() {
                state.failed = Some(error);
            }
        }
        self.buffer_notify.notify_one();
    }

    pub(crate) fn failed(&self) -> Option<ClientError> {
        self.state.lock().failed.clone()
    }

    pub(crate) fn mark_detached(&self) {
        self.state.lock().detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    fn assert_conserved(&self, state: &QueueState) {
        debug_assert_eq!(
            state.free.len() + state.filled.len() + state.outstanding,
            self.nbufs,
            "buffer conservation violated on {}/{}",
            self.topic,
            self.partition,
        );
    }

    /// Consumer side: returns `prev` to the free list, signals the bundler
    /// when no request is pending, then waits for a filled buffer.
    ///
    /// An injected error surfaces only once `filled` is empty, so a consumer
    /// drains what already arrived before seeing the failure.
    pub(crate) async fn exchange_filled(
        &self,
        prev: Option<QueueBuffer>,
    ) -> Result<QueueBuffer> {
        if let Some(mut buf) = prev {
            let signal = {
                let mut state = self.state.lock();
                buf.reset();
                state.free.push_back(buf);
                state.outstanding -= 1;
                self.assert_conserved(&state);
                if state.request_pending {
                    None
                } else {
                    state.bundler_arc()
                }
            };
            if let Some(bundler) = signal {
                bundler.queue_has_ready_buffers(&self.topic, self.partition);
            }
        }

        loop {
            {
                let mut state = self.state.lock();
                if let Some(buf) = state.filled.pop_front() {
                    state.outstanding += 1;
                    self.assert_conserved(&state);
                    return Ok(buf);
                }
                if let Some(err) = &state.failed {
                    return Err(err.clone());
                }
            }
            self.buffer_notify.notified().await;
        }
    }

    /// Producer side: publishes `prev` as filled, signals the bundler when no
    /// request is pending, then waits for a free buffer (back-pressure).
    pub(crate) async fn exchange_free(&self, prev: Option<QueueBuffer>) -> Result<QueueBuffer> {
        if let Some(buf) = prev {
            if let Some(bundler) = self.publish_filled(buf) {
                bundler.queue_has_ready_buffers(&self.topic, self.partition);
            }
        }

        loop {
            {
                let mut state = self.state.lock();
                if let Some(err) = &state.failed {
                    return Err(err.clone());
                }
                if let Some(buf) = state.free.pop_front() {
                    state.outstanding += 1;
                    self.assert_conserved(&state);
                    return Ok(buf);
                }
            }
            self.buffer_notify.notified().await;
        }
    }

    /// Publishes a façade-held buffer to the filled list. Returns the
    /// bundler to signal, if the partition just became ready.
    pub(crate) fn publish_filled(&self, buf: QueueBuffer) -> Option<Arc<RequestBundler>> {
        let mut state = self.state.lock();
        state.filled.push_back(buf);
        state.outstanding -= 1;
        self.assert_conserved(&state);
        if state.request_pending {
            None
        } else {
            state.bundler_arc()
        }
    }

    /// Returns a façade-held buffer to the free list without any signaling.
    /// Used when a façade is dropped with a buffer in hand.
    pub(crate) fn abandon(&self, mut buf: QueueBuffer) {
        let mut state = self.state.lock();
        buf.reset();
        state.free.push_back(buf);
        state.outstanding -= 1;
        self.assert_conserved(&state);
    }

    /// Receiver side: a fetch round produced no data. Clears
    /// `request_pending`; returns the bundler to signal if a free buffer is
    /// still available (the broker-side long poll paces the refetch).
    pub(crate) fn complete_fetch_empty(&self) -> Option<Arc<RequestBundler>> {
        let mut state = self.state.lock();
        state.request_pending = false;
        if state.free.is_empty() {
            None
        } else {
            state.bundler_arc()
        }
    }

    /// Receiver side: publishes a fetched message set into a free buffer and
    /// advances the fetch offset. Returns the bundler to signal if another
    /// free buffer remains.
    pub(crate) fn complete_fetch(
        &self,
        set: &[u8],
        next_offset: i64,
    ) -> Option<Arc<RequestBundler>> {
        let signal = {
            let mut state = self.state.lock();
            state.request_pending = false;
            let Some(mut buf) = state.free.pop_front() else {
                // Readiness implied a free buffer when the fetch was bundled.
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    "fetch response with no free buffer; dropping set"
                );
                return None;
            };
            buf.fill_from(set);
            state.filled.push_back(buf);
            debug_assert!(next_offset >= state.next_offset, "fetch offset went backwards");
            state.next_offset = next_offset;
            self.assert_conserved(&state);
            if state.free.is_empty() {
                None
            } else {
                state.bundler_arc()
            }
        };
        self.buffer_notify.notify_one();
        signal
    }

    /// Pusher side: moves the front filled buffer out, into an in-flight
    /// produce entry.
    pub(crate) fn take_filled_front(&self) -> Option<QueueBuffer> {
        let mut state = self.state.lock();
        let buf = state.filled.pop_front()?;
        state.outstanding += 1;
        self.assert_conserved(&state);
        Some(buf)
    }

    /// Puts an un-sent produce buffer back at the front of the filled list,
    /// preserving order, after a write failure or connection loss.
    pub(crate) fn restore_filled_front(&self, buf: QueueBuffer) {
        let mut state = self.state.lock();
        state.filled.push_front(buf);
        state.outstanding -= 1;
        self.assert_conserved(&state);
    }

    /// Receiver side: a produce ack arrived. Recycles the buffer to the free
    /// list and wakes a blocked producer. Returns the bundler to signal if
    /// more filled buffers are queued.
    pub(crate) fn complete_produced(&self, mut buf: QueueBuffer) -> Option<Arc<RequestBundler>> {
        let signal = {
            let mut state = self.state.lock();
            buf.reset();
            state.free.push_back(buf);
            state.outstanding -= 1;
            state.request_pending = false;
            self.assert_conserved(&state);
            if state.filled.is_empty() {
                None
            } else {
                state.bundler_arc()
            }
        };
        self.buffer_notify.notify_one();
        signal
    }
}

impl std::fmt::Debug for PartitionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PartitionQueue")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("free", &state.free.len())
            .field("filled", &state.filled.len())
            .field("outstanding", &state.outstanding)
            .field("next_offset", &state.next_offset)
            .field("request_pending", &state.request_pending)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(queue: &PartitionQueue) -> (usize, usize, usize) {
        let state = queue.state.lock();
        (state.free.len(), state.filled.len(), state.outstanding)
    }

    #[tokio::test]
    async fn test_exchange_filled_blocks_until_publish() {
        let queue = PartitionQueue::new("t", 0, 0, 2, 64);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.exchange_filled(None).await })
        };
        tokio::task::yield_now().await;

        assert!(queue.complete_fetch(b"data", 1).is_none());
        let buf = waiter.await.unwrap().unwrap();
        assert_eq!(buf.bytes(), b"data");
        assert_eq!(counts(&queue), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_conservation_through_consume_cycle() {
        let queue = PartitionQueue::new("t", 0, 0, 3, 64);
        assert_eq!(counts(&queue), (3, 0, 0));

        queue.complete_fetch(b"one", 1);
        queue.complete_fetch(b"two", 2);
        assert_eq!(counts(&queue), (1, 2, 0));

        let first = queue.exchange_filled(None).await.unwrap();
        assert_eq!(counts(&queue), (1, 1, 1));

        let second = queue.exchange_filled(Some(first)).await.unwrap();
        assert_eq!(second.bytes(), b"two");
        assert_eq!(counts(&queue), (2, 0, 1));

        queue.abandon(second);
        assert_eq!(counts(&queue), (3, 0, 0));
    }

    #[tokio::test]
    async fn test_filled_drains_before_injected_error() {
        let queue = PartitionQueue::new("t", 0, 0, 2, 64);
        queue.complete_fetch(b"last words", 1);
        queue.inject_error(ClientError::Shutdown);

        let buf = queue.exchange_filled(None).await.unwrap();
        assert_eq!(buf.bytes(), b"last words");

        let err = queue.exchange_filled(Some(buf)).await.unwrap_err();
        assert_eq!(err, ClientError::Shutdown);
    }

    #[tokio::test]
    async fn test_producer_error_surfaces_before_free_wait() {
        let queue = PartitionQueue::new("t", 0, 0, 2, 64);
        queue.inject_error(ClientError::Shutdown);
        assert!(queue.exchange_free(None).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_cycle_recycles_buffer() {
        let queue = PartitionQueue::new("t", 0, 0, 2, 64);

        let mut buf = queue.exchange_free(None).await.unwrap();
        buf.extend(b"payload");
        assert!(queue.publish_filled(buf).is_none());
        assert_eq!(counts(&queue), (1, 1, 0));

        let in_flight = queue.take_filled_front().unwrap();
        assert_eq!(counts(&queue), (1, 0, 1));

        queue.complete_produced(in_flight);
        assert_eq!(counts(&queue), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_restore_filled_front_preserves_order() {
        let queue = PartitionQueue::new("t", 0, 0, 3, 64);

        let mut a = queue.exchange_free(None).await.unwrap();
        a.extend(b"first");
        queue.publish_filled(a);
        let mut b = queue.exchange_free(None).await.unwrap();
        b.extend(b"second");
        queue.publish_filled(b);

        let taken = queue.take_filled_front().unwrap();
        assert_eq!(taken.bytes(), b"first");
        queue.restore_filled_front(taken);

        let again = queue.take_filled_front().unwrap();
        assert_eq!(again.bytes(), b"first");
    }

    #[test]
    fn test_empty_fetch_keeps_buffers() {
        let queue = PartitionQueue::new("t", 0, 5, 2, 64);
        queue.set_request_pending(true);
        queue.complete_fetch_empty();
        assert!(!queue.request_pending());
        assert_eq!(counts(&queue), (2, 0, 0));
        assert_eq!(queue.next_offset(), 5);
    }
}
