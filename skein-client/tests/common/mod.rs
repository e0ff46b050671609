//! In-process mock brokers for integration tests.
//!
//! A `Cluster` holds the shared view - broker addresses, partition leaders,
//! and partition logs - and any number of `MockBroker`s serve it over real
//! TCP sockets. Leadership is enforced the way a broker would: a fetch or
//! produce for a partition this broker does not lead answers
//! `NotLeaderForPartition`, and flipping a leader in the view is all a
//! migration test needs to do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use skein_wire::message_set;
use skein_wire::primitives::{get_array_len, get_i16, get_i32, get_i64, get_string, take_bytes};

pub type Record = (Option<Vec<u8>>, Option<Vec<u8>>);

// =============================================================================
// Request parsing
// =============================================================================

#[derive(Debug, Clone)]
pub struct FetchReq {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
}

#[derive(Debug, Clone)]
pub struct ProduceReq {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct OffsetReq {
    pub topic: String,
    pub partition: i32,
    pub time: i64,
    pub max_offsets: i32,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Metadata { topics: Vec<String> },
    Fetch {
        max_wait_ms: i32,
        min_bytes: i32,
        partitions: Vec<FetchReq>,
    },
    Produce {
        acks: i16,
        timeout_ms: i32,
        partitions: Vec<ProduceReq>,
    },
    ListOffsets { partitions: Vec<OffsetReq> },
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: RequestBody,
}

/// Decodes one framed request payload (after the size prefix).
pub fn parse_request(payload: Bytes) -> ParsedRequest {
    let mut buf = payload;
    let api_key = get_i16(&mut buf).unwrap();
    let api_version = get_i16(&mut buf).unwrap();
    let correlation_id = get_i32(&mut buf).unwrap();
    let client_id = get_string(&mut buf).unwrap();

    let body = match api_key {
        0 => {
            let acks = get_i16(&mut buf).unwrap();
            let timeout_ms = get_i32(&mut buf).unwrap();
            let mut partitions = Vec::new();
            let topic_count = get_array_len(&mut buf).unwrap();
            for _ in 0..topic_count {
                let topic = get_string(&mut buf).unwrap();
                let partition_count = get_array_len(&mut buf).unwrap();
                for _ in 0..partition_count {
                    let partition = get_i32(&mut buf).unwrap();
                    let set_size = get_i32(&mut buf).unwrap();
                    let set = take_bytes(&mut buf, set_size as usize).unwrap();
                    partitions.push(ProduceReq {
                        topic: topic.clone(),
                        partition,
                        records: parse_message_set(&set),
                    });
                }
            }
            RequestBody::Produce {
                acks,
                timeout_ms,
                partitions,
            }
        }
        1 => {
            let _replica_id = get_i32(&mut buf).unwrap();
            let max_wait_ms = get_i32(&mut buf).unwrap();
            let min_bytes = get_i32(&mut buf).unwrap();
            let mut partitions = Vec::new();
            let topic_count = get_array_len(&mut buf).unwrap();
            for _ in 0..topic_count {
                let topic = get_string(&mut buf).unwrap();
                let partition_count = get_array_len(&mut buf).unwrap();
                for _ in 0..partition_count {
                    partitions.push(FetchReq {
                        topic: topic.clone(),
                        partition: get_i32(&mut buf).unwrap(),
                        offset: get_i64(&mut buf).unwrap(),
                        max_bytes: get_i32(&mut buf).unwrap(),
                    });
                }
            }
            RequestBody::Fetch {
                max_wait_ms,
                min_bytes,
                partitions,
            }
        }
        2 => {
            let _replica_id = get_i32(&mut buf).unwrap();
            let mut partitions = Vec::new();
            let topic_count = get_array_len(&mut buf).unwrap();
            for _ in 0..topic_count {
                let topic = get_string(&mut buf).unwrap();
                let partition_count = get_array_len(&mut buf).unwrap();
                for _ in 0..partition_count {
                    partitions.push(OffsetReq {
                        topic: topic.clone(),
                        partition: get_i32(&mut buf).unwrap(),
                        time: get_i64(&mut buf).unwrap(),
                        max_offsets: get_i32(&mut buf).unwrap(),
                    });
                }
            }
            RequestBody::ListOffsets { partitions }
        }
        3 => {
            let mut topics = Vec::new();
            let topic_count = get_array_len(&mut buf).unwrap();
            for _ in 0..topic_count {
                topics.push(get_string(&mut buf).unwrap());
            }
            RequestBody::Metadata { topics }
        }
        other => panic!("mock broker got unsupported api key {other}"),
    };

    ParsedRequest {
        api_key,
        api_version,
        correlation_id,
        client_id,
        body,
    }
}

/// Parses a v0 message set into records, inflating gzip wrappers.
fn parse_message_set(set: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut pos = 0;
    while let Some((message, consumed)) = message_set::read_entry(&set[pos..]).unwrap() {
        if message.compression_code() == 1 {
            let inner =
                message_set::inflate_gzip(message.value.unwrap(), 64 * 1024 * 1024).unwrap();
            records.extend(parse_message_set(&inner));
        } else {
            records.push((
                message.key.map(<[u8]>::to_vec),
                message.value.map(<[u8]>::to_vec),
            ));
        }
        pos += consumed;
    }
    records
}

// =============================================================================
// Response encoding
// =============================================================================

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_i16(i16::try_from(value.len()).unwrap());
    buf.put_slice(value.as_bytes());
}

/// Wraps a response body in `{size, correlation_id}` framing.
fn frame_response(correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.put_i32(i32::try_from(body.len() + 4).unwrap());
    frame.put_i32(correlation_id);
    frame.extend_from_slice(body);
    frame
}

/// Encodes one message-set entry carrying a broker-assigned offset.
pub fn entry_with_offset(offset: i64, key: Option<&[u8]>, value: Option<&[u8]>) -> Vec<u8> {
    let mut entry = Vec::new();
    message_set::write_entry(&mut entry, 0, key, value);
    entry[0..8].copy_from_slice(&offset.to_be_bytes());
    entry
}

// =============================================================================
// Cluster view
// =============================================================================

#[derive(Debug, Default, Clone)]
pub struct PartitionLog {
    pub base_offset: i64,
    pub records: Vec<Record>,
}

impl PartitionLog {
    fn end_offset(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }
}

#[derive(Default)]
struct ClusterView {
    brokers: HashMap<i32, SocketAddr>,
    leaders: HashMap<(String, i32), i32>,
    logs: HashMap<(String, i32), PartitionLog>,
}

/// The shared state every mock broker in a test serves.
#[derive(Clone, Default)]
pub struct Cluster {
    view: Arc<parking_lot::Mutex<ClusterView>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a partition led by `leader`, logging from `base_offset`.
    pub fn add_partition(&self, topic: &str, partition: i32, leader: i32, base_offset: i64) {
        let mut view = self.view.lock();
        view.leaders.insert((topic.to_string(), partition), leader);
        view.logs.insert(
            (topic.to_string(), partition),
            PartitionLog {
                base_offset,
                records: Vec::new(),
            },
        );
    }

    /// Appends records to a partition log.
    pub fn seed(&self, topic: &str, partition: i32, values: &[&[u8]]) {
        let mut view = self.view.lock();
        let log = view
            .logs
            .get_mut(&(topic.to_string(), partition))
            .expect("partition exists");
        for value in values {
            log.records.push((None, Some(value.to_vec())));
        }
    }

    /// Reassigns a partition's leader.
    pub fn set_leader(&self, topic: &str, partition: i32, leader: i32) {
        self.view
            .lock()
            .leaders
            .insert((topic.to_string(), partition), leader);
    }

    /// Everything appended to a partition so far.
    pub fn log(&self, topic: &str, partition: i32) -> PartitionLog {
        self.view
            .lock()
            .logs
            .get(&(topic.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Starts a broker serving this cluster's view.
    pub async fn start_broker(&self, node_id: i32, options: BrokerOptions) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        self.view.lock().brokers.insert(node_id, addr);

        let stats = Arc::new(BrokerStats::default());
        let fetches_until_drop = Arc::new(AtomicI64::new(
            options.drop_after_fetches.map_or(-1, |n| i64::try_from(n).unwrap()),
        ));

        let view = Arc::clone(&self.view);
        let accept_stats = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let view = Arc::clone(&view);
                let stats = Arc::clone(&accept_stats);
                let drop_counter = Arc::clone(&fetches_until_drop);
                let options = options.clone();
                tokio::spawn(async move {
                    let _ =
                        handle_connection(stream, node_id, view, stats, drop_counter, options)
                            .await;
                });
            }
        });

        MockBroker {
            node_id,
            addr,
            stats,
            handle,
        }
    }
}

/// Per-broker behavior knobs.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Cap on messages served per fetch response partition.
    pub max_messages_per_fetch: usize,
    /// Close the connection after serving this many fetch responses (once).
    pub drop_after_fetches: Option<usize>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_messages_per_fetch: usize::MAX,
            drop_after_fetches: None,
        }
    }
}

#[derive(Default)]
pub struct BrokerStats {
    /// Arrival time and partition count of each fetch request.
    pub fetches: parking_lot::Mutex<Vec<(Instant, usize)>>,
    pub produce_requests: AtomicUsize,
}

pub struct MockBroker {
    pub node_id: i32,
    pub addr: SocketAddr,
    pub stats: Arc<BrokerStats>,
    handle: JoinHandle<()>,
}

impl MockBroker {
    pub fn addr_string(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn fetch_log(&self) -> Vec<(Instant, usize)> {
        self.stats.fetches.lock().clone()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_connection(
    mut stream: TcpStream,
    node_id: i32,
    view: Arc<parking_lot::Mutex<ClusterView>>,
    stats: Arc<BrokerStats>,
    fetches_until_drop: Arc<AtomicI64>,
    options: BrokerOptions,
) -> std::io::Result<()> {
    loop {
        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await?;
        let size = i32::from_be_bytes(size_buf) as usize;
        let mut payload = vec![0u8; size];
        stream.read_exact(&mut payload).await?;

        let request = parse_request(Bytes::from(payload));
        let correlation_id = request.correlation_id;
        let mut close_after_reply = false;

        let body = match request.body {
            RequestBody::Metadata { .. } => encode_metadata(&view.lock()),
            RequestBody::ListOffsets { partitions } => {
                encode_list_offsets(&view.lock(), &partitions)
            }
            RequestBody::Fetch {
                max_wait_ms,
                partitions,
                ..
            } => {
                stats.fetches.lock().push((Instant::now(), partitions.len()));

                let mut body = build_fetch(&view.lock(), node_id, &partitions, &options);
                if body.all_empty && max_wait_ms > 0 {
                    // Broker-side long poll: wait for data once, then answer.
                    let wait = Duration::from_millis(u64::try_from(max_wait_ms.min(500)).unwrap());
                    tokio::time::sleep(wait).await;
                    body = build_fetch(&view.lock(), node_id, &partitions, &options);
                }

                if fetches_until_drop.load(Ordering::SeqCst) > 0
                    && fetches_until_drop.fetch_sub(1, Ordering::SeqCst) == 1
                {
                    close_after_reply = true;
                }
                body.encoded
            }
            RequestBody::Produce { partitions, .. } => {
                stats.produce_requests.fetch_add(1, Ordering::SeqCst);
                encode_produce(&mut view.lock(), node_id, partitions)
            }
        };

        stream
            .write_all(&frame_response(correlation_id, &body))
            .await?;
        stream.flush().await?;

        if close_after_reply {
            return Ok(());
        }
    }
}

fn encode_metadata(view: &ClusterView) -> Vec<u8> {
    let mut buf = BytesMut::new();

    let mut broker_ids: Vec<_> = view.brokers.keys().copied().collect();
    broker_ids.sort_unstable();
    buf.put_i32(i32::try_from(broker_ids.len()).unwrap());
    for id in broker_ids {
        let addr = view.brokers[&id];
        buf.put_i32(id);
        put_str(&mut buf, "127.0.0.1");
        buf.put_i32(i32::from(addr.port()));
    }

    let mut topics: HashMap<&str, Vec<i32>> = HashMap::new();
    for (topic, partition) in view.leaders.keys() {
        topics.entry(topic).or_default().push(*partition);
    }
    let mut names: Vec<_> = topics.keys().copied().collect();
    names.sort_unstable();

    buf.put_i32(i32::try_from(names.len()).unwrap());
    for name in names {
        buf.put_i16(0);
        put_str(&mut buf, name);
        let mut partitions = topics[name].clone();
        partitions.sort_unstable();
        buf.put_i32(i32::try_from(partitions.len()).unwrap());
        for partition in partitions {
            let leader = view.leaders[&(name.to_string(), partition)];
            buf.put_i16(0);
            buf.put_i32(partition);
            buf.put_i32(leader);
            buf.put_i32(1);
            buf.put_i32(leader);
            buf.put_i32(1);
            buf.put_i32(leader);
        }
    }
    buf.to_vec()
}

fn encode_list_offsets(view: &ClusterView, requests: &[OffsetReq]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i32(i32::try_from(requests.len()).unwrap());
    for request in requests {
        put_str(&mut buf, &request.topic);
        buf.put_i32(1);
        buf.put_i32(request.partition);
        match view.logs.get(&(request.topic.clone(), request.partition)) {
            Some(log) => {
                let offset = if request.time == -2 {
                    log.base_offset
                } else {
                    log.end_offset()
                };
                buf.put_i16(0);
                buf.put_i32(1);
                buf.put_i64(offset);
            }
            None => {
                buf.put_i16(3); // UnknownTopicOrPartition
                buf.put_i32(0);
            }
        }
    }
    buf.to_vec()
}

struct FetchBody {
    encoded: Vec<u8>,
    all_empty: bool,
}

fn build_fetch(
    view: &ClusterView,
    node_id: i32,
    requests: &[FetchReq],
    options: &BrokerOptions,
) -> FetchBody {
    let mut buf = BytesMut::new();
    let mut all_empty = true;

    buf.put_i32(i32::try_from(requests.len()).unwrap());
    for request in requests {
        let key = (request.topic.clone(), request.partition);
        put_str(&mut buf, &request.topic);
        buf.put_i32(1);
        buf.put_i32(request.partition);

        let leader = view.leaders.get(&key).copied();
        if leader != Some(node_id) {
            all_empty = false;
            buf.put_i16(6); // NotLeaderForPartition
            buf.put_i64(-1);
            buf.put_i32(0);
            continue;
        }

        let log = &view.logs[&key];
        if request.offset < log.base_offset || request.offset > log.end_offset() {
            all_empty = false;
            buf.put_i16(1); // OffsetOutOfRange
            buf.put_i64(log.end_offset());
            buf.put_i32(0);
            continue;
        }

        let mut set = Vec::new();
        let start = usize::try_from(request.offset - log.base_offset).unwrap();
        let mut served = 0usize;
        for (i, (key, value)) in log.records.iter().enumerate().skip(start) {
            if served >= options.max_messages_per_fetch {
                break;
            }
            let entry = entry_with_offset(
                log.base_offset + i64::try_from(i).unwrap(),
                key.as_deref(),
                value.as_deref(),
            );
            if set.len() + entry.len() > usize::try_from(request.max_bytes).unwrap() {
                break;
            }
            set.extend_from_slice(&entry);
            served += 1;
        }
        if served > 0 {
            all_empty = false;
        }

        buf.put_i16(0);
        buf.put_i64(log.end_offset());
        buf.put_i32(i32::try_from(set.len()).unwrap());
        buf.put_slice(&set);
    }

    FetchBody {
        encoded: buf.to_vec(),
        all_empty,
    }
}

fn encode_produce(
    view: &mut ClusterView,
    node_id: i32,
    requests: Vec<ProduceReq>,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i32(i32::try_from(requests.len()).unwrap());
    for request in requests {
        let key = (request.topic.clone(), request.partition);
        put_str(&mut buf, &request.topic);
        buf.put_i32(1);
        buf.put_i32(request.partition);

        if view.leaders.get(&key).copied() != Some(node_id) {
            buf.put_i16(6); // NotLeaderForPartition
            buf.put_i64(-1);
            continue;
        }

        let log = view.logs.get_mut(&key).expect("partition exists");
        let base_offset = log.end_offset();
        log.records.extend(request.records);
        buf.put_i16(0);
        buf.put_i64(base_offset);
    }
    buf.to_vec()
}
