//! Consumer façade.
//!
//! A consumer owns one partition queue and turns filled buffers into
//! messages. Parsing is zero-copy: `Message` borrows its key and value from
//! the consumer's current buffer (or its decompression side buffer), and the
//! borrow checker pins the message's lifetime to the next `next_message`
//! call - exactly the window before the buffer can be retired.

use std::sync::Arc;

use skein_core::{ClientError, Compression, Result, WorkerRole};
use skein_wire::message_set::{self, EntrySpans};

use crate::buffer::QueueBuffer;
use crate::client::{Client, ClientInner};
use crate::queue::PartitionQueue;

/// One consumed message. Key and value borrow from the consumer's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    /// The message's offset within its partition.
    pub offset: i64,
    /// Message key, if present.
    pub key: Option<&'a [u8]>,
    /// Message value, if present.
    pub value: Option<&'a [u8]>,
}

/// An inflated compressed message set, parsed before the buffer continues.
struct InflatedSet {
    data: Vec<u8>,
    cursor: usize,
}

/// Where the parsed entry lives, decided before any borrow is handed out.
enum ParseSource {
    Buffer { start: usize, spans: EntrySpans },
    Inflated { start: usize, spans: EntrySpans },
}

/// Reads messages from one partition, in offset order.
pub struct Consumer {
    client: Arc<ClientInner>,
    topic: String,
    partition: i32,
    queue: Arc<PartitionQueue>,
    current: Option<QueueBuffer>,
    inflated: Option<InflatedSet>,
    position: i64,
}

impl Consumer {
    /// Registers a consumer for `(topic, partition)` starting at `offset`.
    ///
    /// `offset` may be an absolute offset or a sentinel
    /// ([`skein_core::OFFSET_LATEST`] / [`skein_core::OFFSET_EARLIEST`]);
    /// sentinels are resolved against the broker before the first fetch.
    ///
    /// # Errors
    /// `WorkerExists` if a consumer for this partition is already registered,
    /// `Shutdown` if the client is closed.
    pub fn new(
        client: &Client,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Result<Self> {
        let topic = topic.into();
        let queue =
            client
                .inner()
                .spawn_worker(&topic, partition, WorkerRole::Consumer, offset)?;
        Ok(Self {
            client: Arc::clone(client.inner()),
            topic,
            partition,
            queue,
            current: None,
            inflated: None,
            position: offset,
        })
    }

    /// The topic this consumer reads.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The partition this consumer reads.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The offset after the last returned message (or the starting offset
    /// before the first message).
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Returns the next message, blocking until one is available.
    ///
    /// Already-fetched buffers drain even while the partition is being
    /// re-homed after a broker failure; the call blocks across the gap and
    /// resumes with the next offset.
    ///
    /// # Errors
    /// `Crc` on a corrupt message (the cursor does not advance; calling again
    /// re-reads the same entry), otherwise the error injected into this
    /// worker (offset out of range, metadata loss, shutdown, ...).
    pub async fn next_message(&mut self) -> Result<Message<'_>> {
        let source = loop {
            // Drain the decompression side buffer first.
            if let Some(set) = self.inflated.as_mut() {
                match message_set::read_entry_spans(&set.data[set.cursor..])? {
                    Some((spans, consumed)) => {
                        if spans.compression_code() != 0 {
                            return Err(ClientError::protocol(
                                "nested compressed message sets are not supported",
                            ));
                        }
                        let start = set.cursor;
                        set.cursor += consumed;
                        break ParseSource::Inflated { start, spans };
                    }
                    None => self.inflated = None,
                }
                continue;
            }

            if let Some(buf) = self.current.as_mut() {
                match message_set::read_entry_spans(buf.unread())? {
                    Some((spans, consumed)) => {
                        if spans.compression_code() == 0 {
                            let start = buf.cursor();
                            buf.advance(consumed);
                            break ParseSource::Buffer { start, spans };
                        }
                        self.begin_inflate(spans, consumed)?;
                        continue;
                    }
                    None => {} // Exhausted (or a partial tail): next buffer.
                }
            }

            let prev = self.current.take();
            self.current = Some(self.queue.exchange_filled(prev).await?);
        };

        let message = match source {
            ParseSource::Buffer { start, spans } => {
                let buf = self.current.as_ref().expect("parsed from current buffer");
                build_message(&buf.bytes()[start..], spans)
            }
            ParseSource::Inflated { start, spans } => {
                let set = self.inflated.as_ref().expect("parsed from side buffer");
                build_message(&set.data[start..], spans)
            }
        };
        self.position = message.offset + 1;
        Ok(message)
    }

    /// Inflates a compressed wrapper entry into the side buffer.
    fn begin_inflate(&mut self, spans: EntrySpans, consumed: usize) -> Result<()> {
        let buf = self.current.as_mut().expect("wrapper parsed from current buffer");

        // A compressed record must be the sole entry of its message set.
        if buf.cursor() != 0 || consumed != buf.len() {
            return Err(ClientError::protocol(
                "compressed message must be the sole entry of its set",
            ));
        }

        match Compression::from_code(spans.compression_code()) {
            Some(Compression::Gzip) => {
                let Some((start, len)) = spans.value else {
                    return Err(ClientError::protocol("compressed message with null value"));
                };
                let inner = {
                    let unread = buf.unread();
                    message_set::inflate_gzip(
                        &unread[start..start + len],
                        self.client.config.consumer_max_bytes,
                    )?
                };
                buf.advance(consumed);
                self.inflated = Some(InflatedSet {
                    data: inner,
                    cursor: 0,
                });
                Ok(())
            }
            _ => Err(ClientError::protocol(format!(
                "unsupported compression codec {}",
                spans.compression_code()
            ))),
        }
    }
}

fn build_message(data: &[u8], spans: EntrySpans) -> Message<'_> {
    Message {
        offset: spans.offset,
        key: spans.key.map(|(start, len)| &data[start..start + len]),
        value: spans.value.map(|(start, len)| &data[start..start + len]),
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.mark_detached();
        if let Some(buf) = self.current.take() {
            self.queue.abandon(buf);
        }
        if let Some(bundler) = self.queue.bundler() {
            bundler.remove_queue(&self.topic, self.partition);
        }
        self.client
            .unregister_worker(&self.topic, self.partition, WorkerRole::Consumer);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::ClientConfig;
    use skein_wire::message_set::write_entry;

    /// A consumer wired to a queue with no live client behind it.
    fn test_consumer() -> Consumer {
        let inner = ClientInner::new_for_tests(ClientConfig::default());
        let queue = inner
            .spawn_worker("t", 0, WorkerRole::Consumer, 0)
            .unwrap();
        Consumer {
            client: inner,
            topic: "t".into(),
            partition: 0,
            queue,
            current: None,
            inflated: None,
            position: 0,
        }
    }

    /// Builds a message set with broker-style sequential offsets.
    fn set_with_offsets(first_offset: i64, values: &[&[u8]]) -> Vec<u8> {
        let mut set = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let mut entry = Vec::new();
            write_entry(&mut entry, 0, None, Some(value));
            entry[0..8].copy_from_slice(&(first_offset + i as i64).to_be_bytes());
            set.extend_from_slice(&entry);
        }
        set
    }

    #[tokio::test]
    async fn test_messages_surface_in_offset_order() {
        let mut consumer = test_consumer();
        let set = set_with_offsets(17, &[b"a", b"b", b"c"]);
        consumer.queue.complete_fetch(&set, 20);

        for expected in 17..20i64 {
            let message = consumer.next_message().await.unwrap();
            assert_eq!(message.offset, expected);
            assert_eq!(consumer.position(), expected + 1);
        }
    }

    #[tokio::test]
    async fn test_spans_continue_across_buffers() {
        let mut consumer = test_consumer();
        consumer
            .queue
            .complete_fetch(&set_with_offsets(0, &[b"first"]), 1);
        consumer
            .queue
            .complete_fetch(&set_with_offsets(1, &[b"second"]), 2);

        assert_eq!(consumer.next_message().await.unwrap().value, Some(&b"first"[..]));
        assert_eq!(consumer.next_message().await.unwrap().value, Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_crc_error_does_not_advance_cursor() {
        let mut consumer = test_consumer();
        let mut set = set_with_offsets(5, &[b"payload"]);
        let last = set.len() - 1;
        set[last] ^= 0xff;
        consumer.queue.complete_fetch(&set, 6);

        // The same corrupt entry surfaces on every retry.
        for _ in 0..2 {
            let err = consumer.next_message().await.unwrap_err();
            assert!(matches!(err, ClientError::Crc { offset: 5, .. }));
        }
    }

    #[tokio::test]
    async fn test_gzip_wrapper_is_inflated_and_parsed() {
        let mut consumer = test_consumer();
        let inner = set_with_offsets(3, &[b"one", b"two"]);
        let wrapper = message_set::wrap_gzip(&inner).unwrap();
        consumer.queue.complete_fetch(&wrapper, 5);

        assert_eq!(consumer.next_message().await.unwrap().value, Some(&b"one"[..]));
        assert_eq!(consumer.next_message().await.unwrap().value, Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn test_compressed_wrapper_must_be_sole_entry() {
        let mut consumer = test_consumer();
        let inner = set_with_offsets(0, &[b"x"]);
        let mut set = message_set::wrap_gzip(&inner).unwrap();
        let second = message_set::wrap_gzip(&inner).unwrap();
        set.extend_from_slice(&second);
        consumer.queue.complete_fetch(&set, 1);

        let err = consumer.next_message().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_injected_error_surfaces_after_drain() {
        let mut consumer = test_consumer();
        consumer
            .queue
            .complete_fetch(&set_with_offsets(0, &[b"last"]), 1);
        consumer.queue.inject_error(ClientError::Shutdown);

        assert_eq!(consumer.next_message().await.unwrap().offset, 0);
        let err = consumer.next_message().await.unwrap_err();
        assert_eq!(err, ClientError::Shutdown);
    }
}
