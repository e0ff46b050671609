//! Broker connections.
//!
//! One `BrokerConnection` owns one TCP pipe and three cooperative tasks:
//!
//! - **Fetcher**: collects consumer-side bundles and writes fetch requests.
//! - **Pusher**: collects producer-side bundles and writes produce requests.
//! - **Receiver**: reads response frames and dispatches them by the kind of
//!   the front in-flight entry.
//!
//! Writers hold the connection write mutex across
//! {assign correlation id, serialize, write, flush, append in-flight}, so the
//! in-flight FIFO matches the wire order exactly; the receiver takes the same
//! mutex only to pop the front entry. Responses therefore identify themselves
//! by position, with the correlation id checked as a sanity invariant.
//!
//! Any stream failure funnels into the client's `connection_lost`, spawned as
//! its own task so a failing fetcher/pusher/receiver never tears itself down
//! mid-cleanup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skein_core::{ClientConfig, ClientError, NetworkErrorKind, Result, WorkerRole};
use skein_wire::message_set;
use skein_wire::request::{self, FetchTarget, ProduceTarget};
use skein_wire::response::{
    self, ErrorCode, FetchPartition, MetadataResponse, ProducePartition,
};
use skein_wire::{decode_response_header, MAX_FRAME_BYTES};

use crate::bundler::{BundleDirection, ProduceBundleEntry, RequestBundler};
use crate::client::{ClientInner, Worker};
use crate::queue::PartitionQueue;

/// Acks required on produce requests: leader acknowledgment.
const REQUIRED_ACKS: i16 = 1;

/// Sentinel broker id for bootstrap connections not yet matched to a node.
pub(crate) const BROKER_ID_UNKNOWN: i32 = -1;

enum InFlightKind {
    Metadata {
        reply: oneshot::Sender<Result<MetadataResponse>>,
    },
    Offsets {
        reply: oneshot::Sender<Result<(ErrorCode, Vec<i64>)>>,
    },
    Fetch,
    Produce {
        entries: Vec<ProduceBundleEntry>,
    },
}

struct InFlightRequest {
    correlation_id: i32,
    kind: InFlightKind,
}

struct ConnectionWriter {
    stream: tokio::net::tcp::OwnedWriteHalf,
    encode_buf: BytesMut,
    in_flight: VecDeque<InFlightRequest>,
    next_correlation_id: i32,
}

impl ConnectionWriter {
    fn next_correlation(&mut self) -> i32 {
        let id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
        id
    }
}

/// A single TCP pipe to one broker, with its bundlers and in-flight log.
pub(crate) struct BrokerConnection {
    broker_id: AtomicI32,
    addr: String,
    client_id: String,
    config: ClientConfig,
    client: Weak<ClientInner>,
    consumer_bundler: Arc<RequestBundler>,
    producer_bundler: Arc<RequestBundler>,
    writer: Mutex<ConnectionWriter>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    lost: AtomicBool,
}

impl BrokerConnection {
    /// Dials `addr` and starts the three connection tasks.
    pub(crate) async fn connect(
        client: Weak<ClientInner>,
        broker_id: i32,
        addr: String,
        client_id: String,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let stream = Self::dial(&addr, config.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let encode_buf = BytesMut::with_capacity(config.serializer_chunk_size);
        let conn = Arc::new(Self {
            broker_id: AtomicI32::new(broker_id),
            addr,
            client_id,
            config,
            client,
            consumer_bundler: RequestBundler::new(BundleDirection::Fetch),
            producer_bundler: RequestBundler::new(BundleDirection::Produce),
            writer: Mutex::new(ConnectionWriter {
                stream: write_half,
                encode_buf,
                in_flight: VecDeque::new(),
                next_correlation_id: 0,
            }),
            tasks: parking_lot::Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
        });

        conn.spawn_tasks(read_half);
        info!(broker_id, addr = %conn.addr, "Connected to broker");
        Ok(conn)
    }

    /// Resolves and connects with the configured deadline; Nagle disabled.
    async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
        let connect = async {
            let mut resolved = tokio::net::lookup_host(addr)
                .await
                .map_err(|_| ClientError::connection(addr, NetworkErrorKind::Dns))?;
            let target = resolved
                .next()
                .ok_or_else(|| ClientError::connection(addr, NetworkErrorKind::Dns))?;
            TcpStream::connect(target)
                .await
                .map_err(|_| ClientError::connection(addr, NetworkErrorKind::Connect))
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                stream
                    .set_nodelay(true)
                    .map_err(|_| ClientError::connection(addr, NetworkErrorKind::Connect))?;
                Ok(stream)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ClientError::connection(addr, NetworkErrorKind::Connect)),
        }
    }

    fn spawn_tasks(self: &Arc<Self>, read_half: OwnedReadHalf) {
        let fetcher = tokio::spawn(fetcher_loop(
            Arc::downgrade(self),
            Arc::clone(&self.consumer_bundler),
            self.config.clone(),
        ));
        let pusher = tokio::spawn(pusher_loop(
            Arc::downgrade(self),
            Arc::clone(&self.producer_bundler),
            self.config.clone(),
        ));
        let receiver = tokio::spawn(receiver_loop(
            Arc::downgrade(self),
            read_half,
            self.config.deserializer_chunk_size,
        ));
        self.tasks.lock().extend([fetcher, pusher, receiver]);
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn broker_id(&self) -> i32 {
        self.broker_id.load(Ordering::Relaxed)
    }

    /// Assigns the node id once a metadata response identifies this broker.
    pub(crate) fn set_broker_id(&self, broker_id: i32) {
        self.broker_id.store(broker_id, Ordering::Relaxed);
    }

    pub(crate) fn consumer_bundler(&self) -> &Arc<RequestBundler> {
        &self.consumer_bundler
    }

    pub(crate) fn producer_bundler(&self) -> &Arc<RequestBundler> {
        &self.producer_bundler
    }

    /// Marks the connection lost; returns true on the first call.
    pub(crate) fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Aborts the fetcher, pusher, and receiver tasks.
    pub(crate) fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Fails every pending in-flight request: sync RPC waiters receive
    /// `error`, produce buffers go back to the front of their queues.
    pub(crate) async fn fail_in_flight(&self, error: &ClientError) {
        let drained: Vec<_> = {
            let mut writer = self.writer.lock().await;
            writer.in_flight.drain(..).collect()
        };
        for request in drained {
            match request.kind {
                InFlightKind::Metadata { reply } => {
                    let _ = reply.send(Err(error.clone()));
                }
                InFlightKind::Offsets { reply } => {
                    let _ = reply.send(Err(error.clone()));
                }
                InFlightKind::Fetch => {}
                InFlightKind::Produce { entries } => {
                    for entry in entries {
                        entry.queue.restore_filled_front(entry.buffer);
                    }
                }
            }
        }
    }

    /// Hands a connection failure to the client's recovery path on a fresh
    /// task, so the calling connection task can exit immediately.
    pub(crate) fn trigger_lost(self: &Arc<Self>) {
        if self.is_lost() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                client.connection_lost(&conn).await;
            });
        }
    }

    /// Pushes a worker back onto the client's brokerless list for re-homing.
    fn rehome(&self, topic: &str, partition: i32, role: WorkerRole, queue: Arc<PartitionQueue>) {
        if queue.is_detached() {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.enqueue_brokerless(Worker {
                topic: topic.to_string(),
                partition,
                role,
                queue,
            });
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn send_fetch(&self, targets: &[FetchTarget]) -> Result<()> {
        // Safe casts: both knobs are validated well below i32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let max_wait_ms = self.config.fetch_max_wait.as_millis() as i32;
        let min_bytes = self.config.fetch_min_bytes;

        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;
        let correlation_id = writer.next_correlation();
        writer.encode_buf.clear();
        request::encode_fetch_request(
            &mut writer.encode_buf,
            correlation_id,
            &self.client_id,
            max_wait_ms,
            min_bytes,
            targets,
        )?;
        writer
            .stream
            .write_all(&writer.encode_buf[..])
            .await
            .map_err(|_| ClientError::connection(self.addr.as_str(), NetworkErrorKind::Write))?;
        writer
            .stream
            .flush()
            .await
            .map_err(|_| ClientError::connection(self.addr.as_str(), NetworkErrorKind::Write))?;
        writer.in_flight.push_back(InFlightRequest {
            correlation_id,
            kind: InFlightKind::Fetch,
        });

        debug!(
            correlation_id,
            partitions = targets.len(),
            addr = %self.addr,
            "Fetch dispatched"
        );
        Ok(())
    }

    /// Writes one produce request. On failure the un-sent entries come back
    /// to the caller so their buffers can be restored.
    async fn send_produce(
        &self,
        entries: Vec<ProduceBundleEntry>,
    ) -> std::result::Result<(), (Vec<ProduceBundleEntry>, ClientError)> {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.config.produce_timeout.as_millis() as i32;

        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;
        let correlation_id = writer.next_correlation();
        writer.encode_buf.clear();

        let targets: Vec<ProduceTarget<'_>> = entries
            .iter()
            .map(|entry| ProduceTarget {
                topic: &entry.topic,
                partition: entry.partition,
                message_set: entry.buffer.bytes(),
            })
            .collect();
        if let Err(err) = request::encode_produce_request(
            &mut writer.encode_buf,
            correlation_id,
            &self.client_id,
            REQUIRED_ACKS,
            timeout_ms,
            &targets,
        ) {
            return Err((entries, err.into()));
        }

        if writer.stream.write_all(&writer.encode_buf[..]).await.is_err()
            || writer.stream.flush().await.is_err()
        {
            return Err((
                entries,
                ClientError::connection(self.addr.as_str(), NetworkErrorKind::Write),
            ));
        }

        debug!(
            correlation_id,
            partitions = entries.len(),
            addr = %self.addr,
            "Produce dispatched"
        );
        writer.in_flight.push_back(InFlightRequest {
            correlation_id,
            kind: InFlightKind::Produce { entries },
        });
        Ok(())
    }

    /// Synchronous metadata RPC.
    pub(crate) async fn metadata(self: &Arc<Self>, topics: &[String]) -> Result<MetadataResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            let writer = &mut *writer;
            let correlation_id = writer.next_correlation();
            writer.encode_buf.clear();
            request::encode_metadata_request(
                &mut writer.encode_buf,
                correlation_id,
                &self.client_id,
                topics,
            )?;
            if writer.stream.write_all(&writer.encode_buf[..]).await.is_err()
                || writer.stream.flush().await.is_err()
            {
                self.trigger_lost();
                return Err(ClientError::connection(self.addr.as_str(), NetworkErrorKind::Write));
            }
            writer.in_flight.push_back(InFlightRequest {
                correlation_id,
                kind: InFlightKind::Metadata { reply: tx },
            });
        }

        rx.await
            .map_err(|_| ClientError::connection(self.addr.as_str(), NetworkErrorKind::Closed))?
    }

    /// Resolves an offset sentinel (`-1` latest, `-2` earliest) via a
    /// list-offsets RPC.
    pub(crate) async fn resolve_offset(
        self: &Arc<Self>,
        topic: &str,
        partition: i32,
        time: i64,
    ) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            let writer = &mut *writer;
            let correlation_id = writer.next_correlation();
            writer.encode_buf.clear();
            request::encode_list_offsets_request(
                &mut writer.encode_buf,
                correlation_id,
                &self.client_id,
                topic,
                partition,
                time,
                1,
            )?;
            if writer.stream.write_all(&writer.encode_buf[..]).await.is_err()
                || writer.stream.flush().await.is_err()
            {
                self.trigger_lost();
                return Err(ClientError::connection(self.addr.as_str(), NetworkErrorKind::Write));
            }
            writer.in_flight.push_back(InFlightRequest {
                correlation_id,
                kind: InFlightKind::Offsets { reply: tx },
            });
        }

        let (error, offsets) = rx
            .await
            .map_err(|_| ClientError::connection(self.addr.as_str(), NetworkErrorKind::Closed))??;
        match error {
            ErrorCode::None => offsets.first().copied().ok_or_else(|| {
                ClientError::protocol("list offsets response carried no offsets")
            }),
            ErrorCode::OffsetOutOfRange => Err(ClientError::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
                offset: time,
            }),
            other => Err(ClientError::protocol(format!(
                "list offsets failed with {other:?}"
            ))),
        }
    }

    // =========================================================================
    // Receiver dispatch
    // =========================================================================

    async fn dispatch(self: &Arc<Self>, mut payload: Bytes) -> Result<()> {
        let correlation_id = decode_response_header(&mut payload)?;

        let entry = {
            let mut writer = self.writer.lock().await;
            writer.in_flight.pop_front()
        };
        let Some(entry) = entry else {
            return Err(ClientError::protocol(
                "response arrived with no request in flight",
            ));
        };
        if entry.correlation_id != correlation_id {
            return Err(ClientError::protocol(format!(
                "correlation id {correlation_id} does not match in-flight {}",
                entry.correlation_id
            )));
        }

        match entry.kind {
            InFlightKind::Metadata { reply } => {
                match response::decode_metadata_response(&mut payload) {
                    Ok(md) => {
                        let _ = reply.send(Ok(md));
                        Ok(())
                    }
                    Err(err) => {
                        let err = ClientError::from(err);
                        let _ = reply.send(Err(err.clone()));
                        Err(err)
                    }
                }
            }
            InFlightKind::Offsets { reply } => {
                match response::decode_list_offsets_response(&mut payload) {
                    Ok(decoded) => {
                        let _ = reply.send(Ok(decoded));
                        Ok(())
                    }
                    Err(err) => {
                        let err = ClientError::from(err);
                        let _ = reply.send(Err(err.clone()));
                        Err(err)
                    }
                }
            }
            InFlightKind::Fetch => self.handle_fetch(&mut payload),
            InFlightKind::Produce { entries } => self.handle_produce(&mut payload, entries),
        }
    }

    fn handle_fetch(self: &Arc<Self>, payload: &mut Bytes) -> Result<()> {
        let topics = response::decode_fetch_response(payload)?;
        for (topic, partitions) in topics {
            for part in partitions {
                self.dispatch_fetch_partition(&topic, part)?;
            }
        }
        Ok(())
    }

    fn dispatch_fetch_partition(self: &Arc<Self>, topic: &str, part: FetchPartition) -> Result<()> {
        let Some(queue) = self.consumer_bundler.find_queue(topic, part.partition) else {
            // The worker detached while this fetch was in flight.
            debug!(
                topic,
                partition = part.partition,
                "Fetch response for unknown partition; skipping"
            );
            return Ok(());
        };

        match part.error {
            ErrorCode::None => {
                if part.message_set.len() > self.config.consumer_max_bytes {
                    self.consumer_bundler.remove_queue(topic, part.partition);
                    queue.inject_error(ClientError::protocol(format!(
                        "message set of {} bytes exceeds the {}-byte buffer",
                        part.message_set.len(),
                        self.config.consumer_max_bytes
                    )));
                    return Ok(());
                }
                match message_set::next_offset_after(&part.message_set) {
                    Some(next_offset) => {
                        debug!(
                            topic,
                            partition = part.partition,
                            next_offset,
                            set_bytes = part.message_set.len(),
                            "Fetched message set"
                        );
                        if let Some(bundler) = queue.complete_fetch(&part.message_set, next_offset)
                        {
                            bundler.queue_has_ready_buffers(topic, part.partition);
                        }
                    }
                    None if part.message_set.is_empty() => {
                        if let Some(bundler) = queue.complete_fetch_empty() {
                            bundler.queue_has_ready_buffers(topic, part.partition);
                        }
                    }
                    None => {
                        // A lone message bigger than our fetch budget: no
                        // amount of refetching makes progress.
                        self.consumer_bundler.remove_queue(topic, part.partition);
                        queue.inject_error(ClientError::protocol(
                            "message larger than the per-partition fetch budget",
                        ));
                    }
                }
                Ok(())
            }
            code if code.is_leader_change() => {
                debug!(
                    topic,
                    partition = part.partition,
                    code = ?code,
                    "Leader changed; re-homing consumer"
                );
                self.consumer_bundler.remove_queue(topic, part.partition);
                self.rehome(topic, part.partition, WorkerRole::Consumer, queue);
                Ok(())
            }
            ErrorCode::OffsetOutOfRange => {
                let offset = queue.next_offset();
                warn!(topic, partition = part.partition, offset, "Offset out of range");
                self.consumer_bundler.remove_queue(topic, part.partition);
                queue.inject_error(ClientError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition: part.partition,
                    offset,
                });
                Ok(())
            }
            other => Err(ClientError::protocol(format!(
                "unexpected fetch error code {other:?} for {topic}/{}",
                part.partition
            ))),
        }
    }

    fn handle_produce(
        self: &Arc<Self>,
        payload: &mut Bytes,
        entries: Vec<ProduceBundleEntry>,
    ) -> Result<()> {
        let acks = match response::decode_produce_response(payload) {
            Ok(topics) => {
                let mut map: HashMap<(String, i32), ProducePartition> = HashMap::new();
                for (topic, partitions) in topics {
                    for part in partitions {
                        map.insert((topic.clone(), part.partition), part);
                    }
                }
                map
            }
            Err(err) => {
                for entry in entries {
                    entry.queue.restore_filled_front(entry.buffer);
                }
                return Err(err.into());
            }
        };

        // Validate before acting: a missing ack or an unknown code means the
        // stream is not trustworthy, and every buffer must survive teardown.
        let desync = entries.iter().any(|entry| {
            match acks.get(&(entry.topic.clone(), entry.partition)) {
                None => true,
                Some(ack) => matches!(ack.error, ErrorCode::Unknown(_)),
            }
        });
        if desync {
            for entry in entries {
                entry.queue.restore_filled_front(entry.buffer);
            }
            return Err(ClientError::protocol(
                "produce response did not cover the request",
            ));
        }

        for entry in entries {
            let ack = &acks[&(entry.topic.clone(), entry.partition)];
            match ack.error {
                ErrorCode::None => {
                    debug!(
                        topic = %entry.topic,
                        partition = entry.partition,
                        base_offset = ack.base_offset,
                        "Produce acknowledged"
                    );
                    if let Some(bundler) = entry.queue.complete_produced(entry.buffer) {
                        bundler.queue_has_ready_buffers(&entry.topic, entry.partition);
                    }
                }
                code if code.is_leader_change() => {
                    debug!(
                        topic = %entry.topic,
                        partition = entry.partition,
                        code = ?code,
                        "Leader changed; re-homing producer"
                    );
                    self.producer_bundler.remove_queue(&entry.topic, entry.partition);
                    entry.queue.restore_filled_front(entry.buffer);
                    self.rehome(
                        &entry.topic,
                        entry.partition,
                        WorkerRole::Producer,
                        Arc::clone(&entry.queue),
                    );
                }
                code => {
                    // Broker-side per-partition rejection: fatal to the
                    // worker, not to the connection.
                    warn!(
                        topic = %entry.topic,
                        partition = entry.partition,
                        code = ?code,
                        "Produce rejected"
                    );
                    self.producer_bundler.remove_queue(&entry.topic, entry.partition);
                    entry.queue.complete_produced(entry.buffer);
                    entry.queue.inject_error(ClientError::protocol(format!(
                        "produce rejected with {code:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("broker_id", &self.broker_id())
            .field("addr", &self.addr)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Connection tasks
// =============================================================================

async fn fetcher_loop(
    conn: Weak<BrokerConnection>,
    bundler: Arc<RequestBundler>,
    config: ClientConfig,
) {
    // Safe cast: buffer capacity is the per-partition fetch budget.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let max_bytes = config.consumer_max_bytes.min(i32::MAX as usize) as i32;

    loop {
        let targets = bundler
            .collect_fetch(
                config.fetcher_bundle_min_requests,
                config.fetcher_bundle_max_wait,
                max_bytes,
            )
            .await;
        if targets.is_empty() {
            continue;
        }
        let Some(conn) = conn.upgrade() else { break };
        if let Err(err) = conn.send_fetch(&targets).await {
            warn!(error = %err, addr = %conn.addr, "Fetch write failed");
            conn.trigger_lost();
            break;
        }
    }
}

async fn pusher_loop(
    conn: Weak<BrokerConnection>,
    bundler: Arc<RequestBundler>,
    config: ClientConfig,
) {
    loop {
        let entries = bundler
            .collect_produce(
                config.pusher_bundle_min_requests,
                config.pusher_bundle_max_wait,
            )
            .await;
        if entries.is_empty() {
            continue;
        }
        let Some(conn) = conn.upgrade() else { break };
        if let Err((entries, err)) = conn.send_produce(entries).await {
            warn!(error = %err, addr = %conn.addr, "Produce write failed");
            for entry in entries {
                entry.queue.restore_filled_front(entry.buffer);
            }
            conn.trigger_lost();
            break;
        }
    }
}

async fn receiver_loop(conn: Weak<BrokerConnection>, mut read_half: OwnedReadHalf, chunk: usize) {
    loop {
        let mut size_buf = [0u8; 4];
        if let Err(err) = read_half.read_exact(&mut size_buf).await {
            if let Some(conn) = conn.upgrade() {
                debug!(error = %err, addr = %conn.addr, "Broker stream closed");
                conn.trigger_lost();
            }
            return;
        }
        let size = i32::from_be_bytes(size_buf);
        #[allow(clippy::cast_sign_loss)]
        let len = size as usize;
        if size < 0 || len > MAX_FRAME_BYTES {
            if let Some(conn) = conn.upgrade() {
                error!(size, addr = %conn.addr, "Invalid response frame size");
                conn.trigger_lost();
            }
            return;
        }

        // The deserializer reads the payload in bounded chunks.
        let mut payload = vec![0u8; len];
        let mut pos = 0;
        while pos < len {
            let end = (pos + chunk).min(len);
            if let Err(err) = read_half.read_exact(&mut payload[pos..end]).await {
                if let Some(conn) = conn.upgrade() {
                    debug!(error = %err, addr = %conn.addr, "Broker stream closed mid-frame");
                    conn.trigger_lost();
                }
                return;
            }
            pos = end;
        }

        let Some(conn) = conn.upgrade() else { return };
        if conn.is_lost() {
            return;
        }
        if let Err(err) = conn.dispatch(Bytes::from(payload)).await {
            error!(error = %err, addr = %conn.addr, "Response dispatch failed");
            conn.trigger_lost();
            return;
        }
    }
}
