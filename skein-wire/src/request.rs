//! Request serializers.
//!
//! Each serializer writes one complete framed RPC into the connection's
//! encode buffer. Fetch and produce serializers take bundle snapshots that
//! are already sorted by (topic, partition); runs of equal topic collapse
//! into one topic block, which is exactly the v0 nesting.

use bytes::{BufMut, BytesMut};

use crate::error::WireResult;
use crate::frame::{begin_request, finish_request, ApiKey};
use crate::primitives::put_string;

/// One partition of a fetch bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    /// Topic name.
    pub topic: String,
    /// Partition id.
    pub partition: i32,
    /// First offset to fetch.
    pub offset: i64,
    /// Byte budget for this partition's message set.
    pub max_bytes: i32,
}

/// One partition of a produce bundle.
#[derive(Debug)]
pub struct ProduceTarget<'a> {
    /// Topic name.
    pub topic: &'a str,
    /// Partition id.
    pub partition: i32,
    /// Finished message set to append.
    pub message_set: &'a [u8],
}

/// Counts the topic runs in a (topic, partition)-sorted slice.
fn count_topic_runs<T>(items: &[T], topic_of: impl Fn(&T) -> &str) -> i32 {
    let mut runs = 0;
    let mut prev: Option<&str> = None;
    for item in items {
        let topic = topic_of(item);
        if prev != Some(topic) {
            runs += 1;
            prev = Some(topic);
        }
    }
    runs
}

/// Serializes a v0 metadata request. An empty topic list asks for the full
/// cluster view.
///
/// # Errors
/// `FrameTooLarge` if the request exceeds the frame limit.
pub fn encode_metadata_request(
    buf: &mut BytesMut,
    correlation_id: i32,
    client_id: &str,
    topics: &[String],
) -> WireResult<()> {
    let start = buf.len();
    begin_request(buf, ApiKey::Metadata, correlation_id, client_id);
    // Safe cast: topic counts are far below i32::MAX.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    buf.put_i32(topics.len() as i32);
    for topic in topics {
        put_string(buf, topic);
    }
    finish_request(buf, start)
}

/// Serializes a v0 fetch request covering every target in the bundle.
///
/// `targets` must be sorted by (topic, partition); the serializer debug-asserts
/// this, since it is the bundler's ordering invariant.
///
/// # Errors
/// `FrameTooLarge` if the request exceeds the frame limit.
pub fn encode_fetch_request(
    buf: &mut BytesMut,
    correlation_id: i32,
    client_id: &str,
    max_wait_ms: i32,
    min_bytes: i32,
    targets: &[FetchTarget],
) -> WireResult<()> {
    debug_assert!(
        targets
            .windows(2)
            .all(|w| (&w[0].topic, w[0].partition) < (&w[1].topic, w[1].partition)),
        "fetch targets must arrive in bundler sort order"
    );

    let start = buf.len();
    begin_request(buf, ApiKey::Fetch, correlation_id, client_id);
    buf.put_i32(-1); // replica_id: ordinary client
    buf.put_i32(max_wait_ms);
    buf.put_i32(min_bytes);

    buf.put_i32(count_topic_runs(targets, |t| &t.topic));
    let mut i = 0;
    while i < targets.len() {
        let topic = &targets[i].topic;
        let run_end = targets[i..]
            .iter()
            .position(|t| &t.topic != topic)
            .map_or(targets.len(), |n| i + n);

        put_string(buf, topic);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        buf.put_i32((run_end - i) as i32);
        for target in &targets[i..run_end] {
            buf.put_i32(target.partition);
            buf.put_i64(target.offset);
            buf.put_i32(target.max_bytes);
        }
        i = run_end;
    }

    finish_request(buf, start)
}

/// Serializes a v0 produce request covering every target in the bundle.
///
/// # Errors
/// `FrameTooLarge` if the request exceeds the frame limit.
pub fn encode_produce_request(
    buf: &mut BytesMut,
    correlation_id: i32,
    client_id: &str,
    required_acks: i16,
    timeout_ms: i32,
    targets: &[ProduceTarget<'_>],
) -> WireResult<()> {
    debug_assert!(
        targets
            .windows(2)
            .all(|w| (w[0].topic, w[0].partition) < (w[1].topic, w[1].partition)),
        "produce targets must arrive in bundler sort order"
    );

    let start = buf.len();
    begin_request(buf, ApiKey::Produce, correlation_id, client_id);
    buf.put_i16(required_acks);
    buf.put_i32(timeout_ms);

    buf.put_i32(count_topic_runs(targets, |t| t.topic));
    let mut i = 0;
    while i < targets.len() {
        let topic = targets[i].topic;
        let run_end = targets[i..]
            .iter()
            .position(|t| t.topic != topic)
            .map_or(targets.len(), |n| i + n);

        put_string(buf, topic);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        buf.put_i32((run_end - i) as i32);
        for target in &targets[i..run_end] {
            buf.put_i32(target.partition);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            buf.put_i32(target.message_set.len() as i32);
            buf.put_slice(target.message_set);
        }
        i = run_end;
    }

    finish_request(buf, start)
}

/// Serializes a v0 list-offsets request for one partition.
///
/// `time` takes the offset sentinels: `-1` latest, `-2` earliest.
///
/// # Errors
/// `FrameTooLarge` if the request exceeds the frame limit.
pub fn encode_list_offsets_request(
    buf: &mut BytesMut,
    correlation_id: i32,
    client_id: &str,
    topic: &str,
    partition: i32,
    time: i64,
    max_offsets: i32,
) -> WireResult<()> {
    let start = buf.len();
    begin_request(buf, ApiKey::ListOffsets, correlation_id, client_id);
    buf.put_i32(-1); // replica_id
    buf.put_i32(1); // one topic
    put_string(buf, topic);
    buf.put_i32(1); // one partition
    buf.put_i32(partition);
    buf.put_i64(time);
    buf.put_i32(max_offsets);
    finish_request(buf, start)
}
