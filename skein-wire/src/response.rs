//! Response decoders.
//!
//! Decoders consume a response payload (after the correlation id) and build
//! owned structures, except fetch message sets, which stay as zero-copy
//! `Bytes` slices of the frame until the receiver copies them into a queue
//! buffer.

use bytes::Bytes;

use crate::error::WireResult;
use crate::primitives::{get_array_len, get_i16, get_i32, get_i64, get_string, take_bytes};

/// Kafka error codes this client reacts to.
///
/// Codes without a dedicated reaction decode as `Unknown` and are fatal to
/// the connection that received them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error.
    None,
    /// The requested offset is outside the partition's log.
    OffsetOutOfRange,
    /// The broker saw a corrupt message.
    CorruptMessage,
    /// The broker does not know the topic or partition.
    UnknownTopicOrPartition,
    /// The partition is between leaders.
    LeaderNotAvailable,
    /// This broker is not the partition's leader.
    NotLeaderForPartition,
    /// The broker timed out the request internally.
    RequestTimedOut,
    /// The message set exceeds the broker's size limit.
    MessageTooLarge,
    /// Any other code.
    Unknown(i16),
}

impl ErrorCode {
    /// Maps a wire error code to a variant.
    #[must_use]
    pub const fn from_i16(code: i16) -> Self {
        match code {
            0 => Self::None,
            1 => Self::OffsetOutOfRange,
            2 => Self::CorruptMessage,
            3 => Self::UnknownTopicOrPartition,
            5 => Self::LeaderNotAvailable,
            6 => Self::NotLeaderForPartition,
            7 => Self::RequestTimedOut,
            10 => Self::MessageTooLarge,
            other => Self::Unknown(other),
        }
    }

    /// True for the codes that signal a leader change and trigger re-homing
    /// instead of surfacing to the worker.
    #[must_use]
    pub const fn is_leader_change(self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition | Self::LeaderNotAvailable | Self::NotLeaderForPartition
        )
    }
}

/// One broker from a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMeta {
    /// Stable broker id.
    pub node_id: i32,
    /// Advertised hostname.
    pub host: String,
    /// Advertised port.
    pub port: i32,
}

/// One partition from a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    /// Partition-level error code.
    pub error: ErrorCode,
    /// Partition id.
    pub id: i32,
    /// Current leader's broker id; negative while an election is running.
    pub leader: i32,
    /// Replica broker ids.
    pub replicas: Vec<i32>,
    /// In-sync replica broker ids.
    pub isr: Vec<i32>,
}

/// One topic from a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMeta {
    /// Topic-level error code.
    pub error: ErrorCode,
    /// Topic name.
    pub name: String,
    /// Partition entries.
    pub partitions: Vec<PartitionMeta>,
}

/// A decoded v0 metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    /// Live brokers.
    pub brokers: Vec<BrokerMeta>,
    /// Topics and their partitions.
    pub topics: Vec<TopicMeta>,
}

/// Decodes a v0 metadata response body.
///
/// # Errors
/// `InsufficientData` or `Malformed` on a truncated or invalid frame.
pub fn decode_metadata_response(payload: &mut Bytes) -> WireResult<MetadataResponse> {
    let broker_count = get_array_len(payload)?;
    let mut brokers = Vec::with_capacity(broker_count);
    for _ in 0..broker_count {
        brokers.push(BrokerMeta {
            node_id: get_i32(payload)?,
            host: get_string(payload)?,
            port: get_i32(payload)?,
        });
    }

    let topic_count = get_array_len(payload)?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        let error = ErrorCode::from_i16(get_i16(payload)?);
        let name = get_string(payload)?;
        let partition_count = get_array_len(payload)?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let p_error = ErrorCode::from_i16(get_i16(payload)?);
            let id = get_i32(payload)?;
            let leader = get_i32(payload)?;

            let replica_count = get_array_len(payload)?;
            let mut replicas = Vec::with_capacity(replica_count);
            for _ in 0..replica_count {
                replicas.push(get_i32(payload)?);
            }

            let isr_count = get_array_len(payload)?;
            let mut isr = Vec::with_capacity(isr_count);
            for _ in 0..isr_count {
                isr.push(get_i32(payload)?);
            }

            partitions.push(PartitionMeta {
                error: p_error,
                id,
                leader,
                replicas,
                isr,
            });
        }
        topics.push(TopicMeta {
            error,
            name,
            partitions,
        });
    }

    Ok(MetadataResponse { brokers, topics })
}

/// One partition of a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    /// Partition id.
    pub partition: i32,
    /// Partition-level error code.
    pub error: ErrorCode,
    /// The partition's high watermark at serve time.
    pub high_watermark: i64,
    /// Raw message-set bytes (possibly empty, possibly a partial tail).
    pub message_set: Bytes,
}

/// Decodes a v0 fetch response body into (topic, partitions) groups, in wire
/// order.
///
/// # Errors
/// `InsufficientData` or `Malformed` on a truncated or invalid frame.
pub fn decode_fetch_response(payload: &mut Bytes) -> WireResult<Vec<(String, Vec<FetchPartition>)>> {
    let topic_count = get_array_len(payload)?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        let name = get_string(payload)?;
        let partition_count = get_array_len(payload)?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let partition = get_i32(payload)?;
            let error = ErrorCode::from_i16(get_i16(payload)?);
            let high_watermark = get_i64(payload)?;
            let set_size = get_i32(payload)?;
            if set_size < 0 {
                return Err(crate::error::WireError::Malformed {
                    what: "message set size",
                    reason: "negative",
                });
            }
            #[allow(clippy::cast_sign_loss)]
            let message_set = take_bytes(payload, set_size as usize)?;
            partitions.push(FetchPartition {
                partition,
                error,
                high_watermark,
                message_set,
            });
        }
        topics.push((name, partitions));
    }
    Ok(topics)
}

/// One partition of a produce response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducePartition {
    /// Partition id.
    pub partition: i32,
    /// Partition-level error code.
    pub error: ErrorCode,
    /// Offset assigned to the first appended message.
    pub base_offset: i64,
}

/// Decodes a v0 produce response body into (topic, partitions) groups.
///
/// # Errors
/// `InsufficientData` or `Malformed` on a truncated or invalid frame.
pub fn decode_produce_response(
    payload: &mut Bytes,
) -> WireResult<Vec<(String, Vec<ProducePartition>)>> {
    let topic_count = get_array_len(payload)?;
    let mut topics = Vec::with_capacity(topic_count);
    for _ in 0..topic_count {
        let name = get_string(payload)?;
        let partition_count = get_array_len(payload)?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            partitions.push(ProducePartition {
                partition: get_i32(payload)?,
                error: ErrorCode::from_i16(get_i16(payload)?),
                base_offset: get_i64(payload)?,
            });
        }
        topics.push((name, partitions));
    }
    Ok(topics)
}

/// Decodes a v0 list-offsets response for the single partition this client
/// requests, returning (error, offsets).
///
/// # Errors
/// `InsufficientData` or `Malformed` on a truncated or invalid frame, or if
/// the response carries no partition entry at all.
pub fn decode_list_offsets_response(payload: &mut Bytes) -> WireResult<(ErrorCode, Vec<i64>)> {
    let topic_count = get_array_len(payload)?;
    let mut result = None;
    for _ in 0..topic_count {
        let _name = get_string(payload)?;
        let partition_count = get_array_len(payload)?;
        for _ in 0..partition_count {
            let _partition = get_i32(payload)?;
            let error = ErrorCode::from_i16(get_i16(payload)?);
            let offset_count = get_array_len(payload)?;
            let mut offsets = Vec::with_capacity(offset_count);
            for _ in 0..offset_count {
                offsets.push(get_i64(payload)?);
            }
            // Requests carry exactly one partition; keep the first entry.
            if result.is_none() {
                result = Some((error, offsets));
            }
        }
    }
    result.ok_or(crate::error::WireError::Malformed {
        what: "list offsets response",
        reason: "no partition entry",
    })
}
