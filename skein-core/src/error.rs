//! Error types for skein client operations.
//!
//! Every error is plain, clonable data: a connection failure is injected into
//! each worker that was homed on that connection, and each of them surfaces
//! its own copy at the next user-visible call.

use thiserror::Error;

/// The result type for skein operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Kinds of network failures, in the order a connection goes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Hostname resolution failed.
    Dns,
    /// TCP connect failed or timed out.
    Connect,
    /// A read from the broker failed.
    Read,
    /// A write to the broker failed.
    Write,
    /// The broker closed the connection.
    Closed,
}

/// The two directions a worker can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Fetches messages from a partition.
    Consumer,
    /// Appends messages to a partition.
    Producer,
}

/// Errors surfaced by skein clients, consumers, and producers.
///
/// Leader-change errors (`NotLeaderForPartition` and friends) never appear
/// here - they are absorbed by the re-homing path. What remains is fatal to
/// the operation, the worker, or the connection that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// A TCP-level failure talking to a broker. Workers homed on the
    /// connection are re-homed transparently; this variant surfaces only
    /// from calls that needed the connection directly.
    #[error("connection to broker {broker} failed: {kind:?}")]
    Connection {
        /// Broker address or id the failure occurred on.
        broker: String,
        /// What stage of the connection failed.
        kind: NetworkErrorKind,
    },

    /// The refreshed metadata has no entry for the worker's partition.
    #[error("no metadata for {topic}/{partition}")]
    Metadata {
        /// Topic name.
        topic: String,
        /// Partition id.
        partition: i32,
    },

    /// A malformed frame, an unexpected error code, or an oversized
    /// message set. Fatal to the connection that produced it.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },

    /// Per-message checksum mismatch. The parse cursor is not advanced past
    /// the bad message, so the caller may retry the same entry.
    #[error("crc mismatch at offset {offset}: wire {wire:#010x}, computed {computed:#010x}")]
    Crc {
        /// Offset of the corrupt message.
        offset: i64,
        /// Checksum carried on the wire.
        wire: u32,
        /// Checksum computed over the received bytes.
        computed: u32,
    },

    /// The partition had no leader after the configured number of
    /// metadata-refresh attempts.
    #[error("leader election timed out for {topic}/{partition}")]
    LeaderElectionTimeout {
        /// Topic name.
        topic: String,
        /// Partition id.
        partition: i32,
    },

    /// The broker rejected the requested offset. The consumer must be
    /// reopened with a valid offset.
    #[error("offset {offset} out of range for {topic}/{partition}")]
    OffsetOutOfRange {
        /// Topic name.
        topic: String,
        /// Partition id.
        partition: i32,
        /// The rejected offset.
        offset: i64,
    },

    /// A configuration field failed validation.
    #[error("invalid configuration '{name}': {reason}")]
    Config {
        /// The field name.
        name: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A worker with the same (topic, partition, role) is already
    /// registered on this client.
    #[error("a {role:?} is already registered for {topic}/{partition}")]
    WorkerExists {
        /// Topic name.
        topic: String,
        /// Partition id.
        partition: i32,
        /// The duplicated role.
        role: WorkerRole,
    },

    /// A single record would not fit in one queue buffer.
    #[error("message of {size} bytes exceeds the {max}-byte buffer")]
    MessageTooLarge {
        /// Encoded record size.
        size: usize,
        /// Buffer capacity.
        max: usize,
    },

    /// The client has been closed.
    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Builds a `Connection` error.
    pub fn connection(broker: impl Into<String>, kind: NetworkErrorKind) -> Self {
        Self::Connection {
            broker: broker.into(),
            kind,
        }
    }

    /// Builds a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Builds a `Metadata` error.
    pub fn metadata(topic: impl Into<String>, partition: i32) -> Self {
        Self::Metadata {
            topic: topic.into(),
            partition,
        }
    }
}
