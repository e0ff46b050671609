//! Client configuration.
//!
//! Every knob the runtime consults lives here, with a `validate()` that
//! rejects inconsistent settings up front instead of letting them surface as
//! stalls or protocol errors at run time.

use std::time::Duration;

use crate::error::{ClientError, Result};

/// Message-set compression codec, as carried in the v0 attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// Gzip wrapper message (attribute code 1).
    Gzip,
    /// Snappy wrapper message (attribute code 2). Recognized on the wire but
    /// not supported by this client.
    Snappy,
}

impl Compression {
    /// Returns the wire attribute code for this codec.
    #[must_use]
    pub const fn code(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Snappy => 2,
        }
    }

    /// Maps a wire attribute code back to a codec.
    #[must_use]
    pub const fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Snappy),
            _ => None,
        }
    }
}

/// Configuration for a skein client.
///
/// Retry counts of `0` mean "retry forever". Defaults favor low latency:
/// bundles flush on the first ready partition, and the broker-side long poll
/// paces idle partitions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Buffer engine.
    /// Capacity of each queue buffer, and the fetch size requested per
    /// partition. A message set larger than this is a protocol error.
    pub consumer_max_bytes: usize,
    /// Buffers preallocated per partition queue. Minimum 2, so one buffer can
    /// be parsed while another is being filled.
    pub consumer_queue_buffers: usize,

    // Producer.
    /// Compression applied to published message sets.
    pub compression: Compression,
    /// Server-side timeout carried in each produce request.
    pub produce_timeout: Duration,

    // Bundling policy.
    /// Ready partitions required before a fetch bundle flushes early.
    pub fetcher_bundle_min_requests: usize,
    /// Longest a fetch bundle waits for more ready partitions.
    pub fetcher_bundle_max_wait: Duration,
    /// Ready partitions required before a produce bundle flushes early.
    pub pusher_bundle_min_requests: usize,
    /// Longest a produce bundle waits for more ready partitions.
    pub pusher_bundle_max_wait: Duration,

    // Broker-side long poll.
    /// Longest the broker may hold a fetch waiting for `fetch_min_bytes`.
    pub fetch_max_wait: Duration,
    /// Fewest bytes the broker should answer a fetch with.
    pub fetch_min_bytes: i32,

    // Recovery.
    /// Metadata refresh sweeps over the bootstrap list before giving up.
    /// `0` retries forever.
    pub metadata_refresh_retry_count: u32,
    /// Pause between metadata refresh sweeps.
    pub metadata_refresh_retry_timeout: Duration,
    /// Refresh attempts waiting for a partition to elect a leader.
    /// `0` retries forever.
    pub leader_election_retry_count: u32,
    /// Pause between leader-election checks.
    pub leader_election_retry_timeout: Duration,
    /// TCP connect deadline per dial.
    pub connect_timeout: Duration,

    // Codec buffers.
    /// Initial capacity of each connection's request-encoding buffer.
    pub serializer_chunk_size: usize,
    /// Initial capacity of each connection's response-read buffer.
    pub deserializer_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            consumer_max_bytes: 1024 * 1024,
            consumer_queue_buffers: 4,

            compression: Compression::None,
            produce_timeout: Duration::from_secs(5),

            // Flush on the first ready partition; coalescing kicks in only
            // when min_requests is raised.
            fetcher_bundle_min_requests: 1,
            fetcher_bundle_max_wait: Duration::from_millis(5),
            pusher_bundle_min_requests: 1,
            pusher_bundle_max_wait: Duration::from_millis(5),

            fetch_max_wait: Duration::from_millis(500),
            fetch_min_bytes: 1,

            metadata_refresh_retry_count: 3,
            metadata_refresh_retry_timeout: Duration::from_millis(500),
            leader_election_retry_count: 10,
            leader_election_retry_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),

            serializer_chunk_size: 64 * 1024,
            deserializer_chunk_size: 256 * 1024,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-buffer capacity.
    #[must_use]
    pub const fn with_consumer_max_bytes(mut self, bytes: usize) -> Self {
        self.consumer_max_bytes = bytes;
        self
    }

    /// Sets the number of buffers per partition queue.
    #[must_use]
    pub const fn with_queue_buffers(mut self, buffers: usize) -> Self {
        self.consumer_queue_buffers = buffers;
        self
    }

    /// Sets the producer compression codec.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the fetch bundling policy.
    #[must_use]
    pub const fn with_fetcher_bundle(mut self, min_requests: usize, max_wait: Duration) -> Self {
        self.fetcher_bundle_min_requests = min_requests;
        self.fetcher_bundle_max_wait = max_wait;
        self
    }

    /// Sets the produce bundling policy.
    #[must_use]
    pub const fn with_pusher_bundle(mut self, min_requests: usize, max_wait: Duration) -> Self {
        self.pusher_bundle_min_requests = min_requests;
        self.pusher_bundle_max_wait = max_wait;
        self
    }

    /// Validates that the configuration is internally consistent.
    ///
    /// # Errors
    /// Returns `ClientError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_max_bytes == 0 {
            return Err(ClientError::Config {
                name: "consumer_max_bytes",
                reason: "must be positive",
            });
        }

        // One buffer to parse from while another is in flight.
        if self.consumer_queue_buffers < 2 {
            return Err(ClientError::Config {
                name: "consumer_queue_buffers",
                reason: "must be at least 2",
            });
        }

        if self.fetcher_bundle_min_requests == 0 {
            return Err(ClientError::Config {
                name: "fetcher_bundle_min_requests",
                reason: "must be at least 1",
            });
        }

        if self.pusher_bundle_min_requests == 0 {
            return Err(ClientError::Config {
                name: "pusher_bundle_min_requests",
                reason: "must be at least 1",
            });
        }

        if self.fetch_min_bytes < 0 {
            return Err(ClientError::Config {
                name: "fetch_min_bytes",
                reason: "must be non-negative",
            });
        }

        if self.serializer_chunk_size == 0 {
            return Err(ClientError::Config {
                name: "serializer_chunk_size",
                reason: "must be positive",
            });
        }

        if self.deserializer_chunk_size == 0 {
            return Err(ClientError::Config {
                name: "deserializer_chunk_size",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}
