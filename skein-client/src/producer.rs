//! Producer façade.
//!
//! A producer accumulates records into its current free buffer as one v0
//! message set and publishes the buffer to the queue's filled list - on
//! `flush()`, or automatically when the next record would not fit. With no
//! free buffer available, `send` blocks until an ack recycles one: that is
//! the back-pressure path.

use std::sync::Arc;

use skein_core::{ClientError, Compression, Result, WorkerRole};
use skein_wire::message_set;

use crate::buffer::QueueBuffer;
use crate::client::{Client, ClientInner};
use crate::queue::PartitionQueue;

/// Writes messages to one partition, in order.
pub struct Producer {
    client: Arc<ClientInner>,
    topic: String,
    partition: i32,
    queue: Arc<PartitionQueue>,
    current: Option<QueueBuffer>,
    scratch: Vec<u8>,
}

impl Producer {
    /// Registers a producer for `(topic, partition)`.
    ///
    /// # Errors
    /// `WorkerExists` if a producer for this partition is already registered,
    /// `Config` if the configured compression codec is unsupported,
    /// `Shutdown` if the client is closed.
    pub fn new(client: &Client, topic: impl Into<String>, partition: i32) -> Result<Self> {
        if client.config().compression == Compression::Snappy {
            return Err(ClientError::Config {
                name: "compression",
                reason: "snappy is recognized on the wire but not supported",
            });
        }

        let topic = topic.into();
        let queue = client
            .inner()
            .spawn_worker(&topic, partition, WorkerRole::Producer, 0)?;
        Ok(Self {
            client: Arc::clone(client.inner()),
            topic,
            partition,
            queue,
            current: None,
            scratch: Vec::new(),
        })
    }

    /// The topic this producer writes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The partition this producer writes.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Appends one record to the current message set, publishing the set
    /// first when the record would not fit. Blocks when every buffer is in
    /// flight (back-pressure).
    ///
    /// # Errors
    /// `MessageTooLarge` if the record alone exceeds a buffer, otherwise the
    /// error injected into this worker.
    pub async fn send(&mut self, key: Option<&[u8]>, value: Option<&[u8]>) -> Result<()> {
        if let Some(err) = self.queue.failed() {
            return Err(err);
        }

        let encoded = message_set::encoded_len(
            key.map_or(0, <[u8]>::len),
            value.map_or(0, <[u8]>::len),
        );
        let capacity = self.client.config.consumer_max_bytes;
        if encoded > capacity {
            return Err(ClientError::MessageTooLarge {
                size: encoded,
                max: capacity,
            });
        }

        if self.current.as_ref().is_some_and(|buf| !buf.fits(encoded)) {
            self.flush().await?;
        }
        if self.current.is_none() {
            self.current = Some(self.queue.exchange_free(None).await?);
        }

        let buf = self.current.as_mut().expect("buffer acquired above");
        self.scratch.clear();
        message_set::write_entry(&mut self.scratch, 0, key, value);
        buf.extend(&self.scratch);
        Ok(())
    }

    /// Publishes the current message set, making it eligible for the next
    /// produce bundle. A no-op with nothing buffered.
    ///
    /// # Errors
    /// `MessageTooLarge` if gzip wrapping grew the set past the buffer (the
    /// uncompressed set stays buffered), otherwise the error injected into
    /// this worker.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(err) = self.queue.failed() {
            return Err(err);
        }
        let Some(mut buf) = self.current.take() else {
            return Ok(());
        };
        if buf.is_empty() {
            self.current = Some(buf);
            return Ok(());
        }

        if self.client.config.compression == Compression::Gzip {
            let wrapper = message_set::wrap_gzip(buf.bytes())?;
            if wrapper.len() > buf.capacity() {
                let size = wrapper.len();
                let max = buf.capacity();
                self.current = Some(buf);
                return Err(ClientError::MessageTooLarge { size, max });
            }
            buf.fill_from(&wrapper);
        }

        if let Some(bundler) = self.queue.publish_filled(buf) {
            bundler.queue_has_ready_buffers(&self.topic, self.partition);
        }
        Ok(())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.queue.mark_detached();
        if let Some(buf) = self.current.take() {
            self.queue.abandon(buf);
        }
        if let Some(bundler) = self.queue.bundler() {
            bundler.remove_queue(&self.topic, self.partition);
        }
        self.client
            .unregister_worker(&self.topic, self.partition, WorkerRole::Producer);
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}
