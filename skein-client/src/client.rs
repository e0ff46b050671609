//! The client: metadata cache, broker connection map, worker registry, and
//! the connection-manager task.
//!
//! Consumers and producers register as *workers*. A worker not attached to
//! any connection's bundler sits on the brokerless list; the connection
//! manager drains that list forever: resolve the partition's leader (with
//! bounded metadata retries), open or reuse the leader's connection, resolve
//! offset sentinels, attach. Leader-change errors and TCP failures put
//! workers back on the list, which is the whole recovery story.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skein_core::{ClientConfig, ClientError, NetworkErrorKind, Result, WorkerRole};

use crate::connection::{BrokerConnection, BROKER_ID_UNKNOWN};
use crate::metadata::{MetadataCache, PartitionInfo};
use crate::queue::PartitionQueue;

/// A consumer or producer registered with the client.
pub(crate) struct Worker {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) role: WorkerRole,
    pub(crate) queue: Arc<PartitionQueue>,
}

struct WorkerRegistry {
    /// Every live worker, for duplicate detection.
    all: Vec<(String, i32, WorkerRole)>,
    /// Workers awaiting leader resolution; the manager's work queue.
    brokerless: VecDeque<Worker>,
}

struct Topology {
    metadata: MetadataCache,
    connections: HashMap<i32, Arc<BrokerConnection>>,
}

/// Shared client state. Public handles (`Client`, `Consumer`, `Producer`)
/// each hold an `Arc` of this.
pub(crate) struct ClientInner {
    pub(crate) client_id: String,
    pub(crate) config: ClientConfig,
    bootstrap: Vec<String>,
    topology: tokio::sync::Mutex<Topology>,
    registry: parking_lot::Mutex<WorkerRegistry>,
    brokerless_notify: Notify,
    closed: AtomicBool,
}

impl ClientInner {
    fn new(bootstrap: Vec<String>, client_id: String, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            config,
            bootstrap,
            topology: tokio::sync::Mutex::new(Topology {
                metadata: MetadataCache::new(),
                connections: HashMap::new(),
            }),
            registry: parking_lot::Mutex::new(WorkerRegistry {
                all: Vec::new(),
                brokerless: VecDeque::new(),
            }),
            brokerless_notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// An inner client with no network behind it, for façade tests.
    #[cfg(test)]
    pub(crate) fn new_for_tests(config: ClientConfig) -> Arc<Self> {
        Self::new(vec!["localhost:9092".into()], "test".into(), config)
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    /// Builds a queue and registers a new worker, which starts brokerless.
    pub(crate) fn spawn_worker(
        &self,
        topic: &str,
        partition: i32,
        role: WorkerRole,
        initial_offset: i64,
    ) -> Result<Arc<PartitionQueue>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }

        let queue = PartitionQueue::new(
            topic,
            partition,
            initial_offset,
            self.config.consumer_queue_buffers,
            self.config.consumer_max_bytes,
        );

        {
            let mut registry = self.registry.lock();
            let duplicate = registry
                .all
                .iter()
                .any(|(t, p, r)| t == topic && *p == partition && *r == role);
            if duplicate {
                return Err(ClientError::WorkerExists {
                    topic: topic.to_string(),
                    partition,
                    role,
                });
            }
            registry.all.push((topic.to_string(), partition, role));
            registry.brokerless.push_back(Worker {
                topic: topic.to_string(),
                partition,
                role,
                queue: Arc::clone(&queue),
            });
        }
        self.brokerless_notify.notify_one();
        Ok(queue)
    }

    /// Removes a dropped worker from the registry.
    pub(crate) fn unregister_worker(&self, topic: &str, partition: i32, role: WorkerRole) {
        let mut registry = self.registry.lock();
        registry
            .all
            .retain(|(t, p, r)| !(t == topic && *p == partition && *r == role));
        registry
            .brokerless
            .retain(|w| !(w.topic == topic && w.partition == partition && w.role == role));
    }

    /// Queues a worker for re-homing. Idempotent: a worker already on the
    /// list is not queued twice.
    pub(crate) fn enqueue_brokerless(&self, worker: Worker) {
        if self.closed.load(Ordering::SeqCst) || worker.queue.is_detached() {
            return;
        }
        {
            let mut registry = self.registry.lock();
            let present = registry.brokerless.iter().any(|w| {
                w.topic == worker.topic && w.partition == worker.partition && w.role == worker.role
            });
            if present {
                return;
            }
            registry.brokerless.push_back(worker);
        }
        self.brokerless_notify.notify_one();
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Refreshes the metadata cache, sweeping the bootstrap list up to the
    /// configured number of times. The last sweep's error surfaces.
    pub(crate) async fn refresh_metadata(self: &Arc<Self>) -> Result<()> {
        let sweeps = self.config.metadata_refresh_retry_count;
        let mut attempt = 0u32;
        loop {
            match self.try_refresh_once().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if sweeps != 0 && attempt >= sweeps {
                        return Err(err);
                    }
                    warn!(error = %err, attempt, "Metadata refresh failed; retrying");
                    tokio::time::sleep(self.config.metadata_refresh_retry_timeout).await;
                }
            }
        }
    }

    /// One sweep over the bootstrap brokers. A responding transient
    /// connection is adopted into the broker map when the returned broker
    /// list advertises its address.
    async fn try_refresh_once(self: &Arc<Self>) -> Result<()> {
        let mut last_err = ClientError::protocol("no bootstrap brokers configured");

        for addr in &self.bootstrap {
            let existing = {
                let topology = self.topology.lock().await;
                topology
                    .connections
                    .values()
                    .find(|c| c.addr() == addr && !c.is_lost())
                    .cloned()
            };
            let (conn, transient) = match existing {
                Some(conn) => (conn, false),
                None => {
                    match BrokerConnection::connect(
                        Arc::downgrade(self),
                        BROKER_ID_UNKNOWN,
                        addr.clone(),
                        self.client_id.clone(),
                        self.config.clone(),
                    )
                    .await
                    {
                        Ok(conn) => (conn, true),
                        Err(err) => {
                            warn!(addr = %addr, error = %err, "Bootstrap broker unreachable");
                            last_err = err;
                            continue;
                        }
                    }
                }
            };

            match conn.metadata(&[]).await {
                Ok(md) if md.brokers.is_empty() => {
                    last_err = ClientError::protocol("metadata response with no brokers");
                    if transient {
                        self.discard_connection(&conn).await;
                    }
                }
                Ok(md) => {
                    let adopted = {
                        let mut topology = self.topology.lock().await;
                        topology.metadata.rebuild(&md);
                        if transient {
                            match topology.metadata.broker_id_for_addr(addr) {
                                Some(node_id)
                                    if !topology.connections.contains_key(&node_id) =>
                                {
                                    conn.set_broker_id(node_id);
                                    topology.connections.insert(node_id, Arc::clone(&conn));
                                    true
                                }
                                _ => false,
                            }
                        } else {
                            true
                        }
                    };
                    if !adopted {
                        self.discard_connection(&conn).await;
                    }
                    info!(
                        brokers = md.brokers.len(),
                        topics = md.topics.len(),
                        "Metadata refreshed"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "Metadata request failed");
                    last_err = err;
                    if transient {
                        self.discard_connection(&conn).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Quietly tears down a connection that never carried workers.
    async fn discard_connection(&self, conn: &Arc<BrokerConnection>) {
        conn.mark_lost();
        conn.abort_tasks();
        conn.fail_in_flight(&ClientError::connection(
            conn.addr(),
            NetworkErrorKind::Closed,
        ))
        .await;
    }

    /// Resolves the current leader of a partition, refreshing metadata and
    /// waiting out elections per the configured retry policy.
    async fn resolve_leader(self: &Arc<Self>, topic: &str, partition: i32) -> Result<PartitionInfo> {
        let retries = self.config.leader_election_retry_count;
        let mut attempt = 0u32;
        loop {
            self.refresh_metadata().await?;

            let info = {
                let topology = self.topology.lock().await;
                topology.metadata.partition(topic, partition).cloned()
            };
            let Some(info) = info else {
                return Err(ClientError::metadata(topic, partition));
            };
            if info.leader >= 0 {
                return Ok(info);
            }

            attempt += 1;
            if retries != 0 && attempt >= retries {
                return Err(ClientError::LeaderElectionTimeout {
                    topic: topic.to_string(),
                    partition,
                });
            }
            debug!(topic, partition, attempt, "No leader elected yet; waiting");
            tokio::time::sleep(self.config.leader_election_retry_timeout).await;
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Returns the live connection to `broker_id`, dialing one if needed.
    async fn get_or_open_connection(
        self: &Arc<Self>,
        broker_id: i32,
    ) -> Result<Arc<BrokerConnection>> {
        let mut topology = self.topology.lock().await;
        if let Some(conn) = topology.connections.get(&broker_id) {
            if !conn.is_lost() {
                return Ok(Arc::clone(conn));
            }
        }

        let addr = topology
            .metadata
            .broker_addr(broker_id)
            .ok_or_else(|| ClientError::protocol(format!("no address for broker {broker_id}")))?;
        let conn = BrokerConnection::connect(
            Arc::downgrade(self),
            broker_id,
            addr,
            self.client_id.clone(),
            self.config.clone(),
        )
        .await?;
        topology.connections.insert(broker_id, Arc::clone(&conn));
        Ok(conn)
    }

    /// Tears down a failed connection and moves every worker it carried back
    /// onto the brokerless list. Idempotent.
    pub(crate) async fn connection_lost(self: &Arc<Self>, conn: &Arc<BrokerConnection>) {
        if !conn.mark_lost() {
            return;
        }
        warn!(
            broker_id = conn.broker_id(),
            addr = %conn.addr(),
            "Connection lost; re-homing workers"
        );

        {
            let mut topology = self.topology.lock().await;
            topology.connections.retain(|_, c| !Arc::ptr_eq(c, conn));
        }
        conn.abort_tasks();

        let error = ClientError::connection(conn.addr(), NetworkErrorKind::Closed);
        conn.fail_in_flight(&error).await;

        for queue in conn.consumer_bundler().drain() {
            let worker = Worker {
                topic: queue.topic().to_string(),
                partition: queue.partition(),
                role: WorkerRole::Consumer,
                queue,
            };
            self.enqueue_brokerless(worker);
        }
        for queue in conn.producer_bundler().drain() {
            let worker = Worker {
                topic: queue.topic().to_string(),
                partition: queue.partition(),
                role: WorkerRole::Producer,
                queue,
            };
            self.enqueue_brokerless(worker);
        }
    }

    // =========================================================================
    // Worker attachment
    // =========================================================================

    /// Attaches one brokerless worker to its partition's current leader.
    /// Failures are injected into the worker, never surfaced here.
    async fn attach_worker(self: &Arc<Self>, worker: Worker) {
        let Worker {
            topic,
            partition,
            role,
            queue,
        } = worker;

        let info = match self.resolve_leader(&topic, partition).await {
            Ok(info) => info,
            Err(err) => {
                warn!(topic = %topic, partition, error = %err, "Leader resolution failed");
                queue.inject_error(err);
                return;
            }
        };

        let conn = match self.get_or_open_connection(info.leader).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    topic = %topic,
                    partition,
                    broker_id = info.leader,
                    error = %err,
                    "Could not reach partition leader"
                );
                queue.inject_error(err);
                return;
            }
        };

        if role == WorkerRole::Consumer {
            let offset = queue.next_offset();
            if offset < 0 {
                match conn.resolve_offset(&topic, partition, offset).await {
                    Ok(resolved) => {
                        debug!(topic = %topic, partition, sentinel = offset, resolved, "Offset resolved");
                        queue.set_next_offset(resolved);
                    }
                    Err(err) => {
                        queue.inject_error(err);
                        return;
                    }
                }
            }
            conn.consumer_bundler().add_queue(Arc::clone(&queue));
        } else {
            conn.producer_bundler().add_queue(Arc::clone(&queue));
        }

        info!(
            topic = %topic,
            partition,
            role = ?role,
            broker_id = info.leader,
            "Worker attached"
        );

        // The connection may have died while we were attaching; its teardown
        // could have drained the bundler before our insert landed.
        if conn.is_lost() {
            let bundler = match role {
                WorkerRole::Consumer => conn.consumer_bundler(),
                WorkerRole::Producer => conn.producer_bundler(),
            };
            if bundler.remove_queue(&topic, partition).is_some() {
                self.enqueue_brokerless(Worker {
                    topic,
                    partition,
                    role,
                    queue,
                });
            }
        }
    }

    // =========================================================================
    // Introspection and shutdown
    // =========================================================================

    pub(crate) async fn topic_names(&self) -> Vec<String> {
        self.topology.lock().await.metadata.topic_names()
    }

    pub(crate) async fn partition_ids(&self, topic: &str) -> Option<Vec<i32>> {
        self.topology.lock().await.metadata.partition_ids(topic)
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.brokerless_notify.notify_one();

        let connections: Vec<_> = {
            let mut topology = self.topology.lock().await;
            topology.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.mark_lost();
            conn.abort_tasks();
            conn.fail_in_flight(&ClientError::Shutdown).await;
            for queue in conn.consumer_bundler().drain() {
                queue.inject_error(ClientError::Shutdown);
            }
            for queue in conn.producer_bundler().drain() {
                queue.inject_error(ClientError::Shutdown);
            }
        }

        let brokerless: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.brokerless.drain(..).collect()
        };
        for worker in brokerless {
            worker.queue.inject_error(ClientError::Shutdown);
        }
        info!("Client closed");
    }
}

/// The connection manager: drains the brokerless list forever.
async fn manager_loop(inner: Arc<ClientInner>) {
    loop {
        let worker = loop {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let next = inner.registry.lock().brokerless.pop_front();
            if let Some(worker) = next {
                break worker;
            }
            inner.brokerless_notify.notified().await;
        };
        if worker.queue.is_detached() {
            continue;
        }
        inner.attach_worker(worker).await;
    }
}

/// A skein client: one per cluster, shared by any number of consumers and
/// producers.
///
/// ```no_run
/// # async fn example() -> skein_core::Result<()> {
/// use skein_client::{Client, Consumer};
/// use skein_core::{ClientConfig, OFFSET_EARLIEST};
///
/// let client = Client::connect(
///     vec!["localhost:9092".into()],
///     "example",
///     ClientConfig::default(),
/// )
/// .await?;
/// let mut consumer = Consumer::new(&client, "events", 0, OFFSET_EARLIEST)?;
/// let message = consumer.next_message().await?;
/// println!("offset {}", message.offset);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
    manager: JoinHandle<()>,
}

impl Client {
    /// Connects to a cluster: validates the configuration, performs the
    /// initial metadata refresh against the bootstrap brokers, and starts
    /// the connection-manager task.
    ///
    /// # Errors
    /// Returns a configuration error, or the last refresh error if no
    /// bootstrap broker answered.
    pub async fn connect(
        bootstrap: Vec<String>,
        client_id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        if bootstrap.is_empty() {
            return Err(ClientError::Config {
                name: "bootstrap",
                reason: "at least one broker address is required",
            });
        }

        let inner = ClientInner::new(bootstrap, client_id.into(), config);
        inner.refresh_metadata().await?;

        let manager = tokio::spawn(manager_loop(Arc::clone(&inner)));
        Ok(Self { inner, manager })
    }

    /// Forces a metadata refresh.
    ///
    /// # Errors
    /// Surfaces the last sweep's error when every bootstrap broker failed.
    pub async fn refresh_metadata(&self) -> Result<()> {
        self.inner.refresh_metadata().await
    }

    /// Topic names from the cached metadata, sorted.
    pub async fn topics(&self) -> Vec<String> {
        self.inner.topic_names().await
    }

    /// Partition ids of a topic from the cached metadata, sorted.
    pub async fn partitions(&self, topic: &str) -> Option<Vec<i32>> {
        self.inner.partition_ids(topic).await
    }

    /// The configuration this client runs with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Shuts the client down: stops the manager, tears down every
    /// connection, and fails pending workers with `Shutdown`.
    pub async fn close(self) {
        self.manager.abort();
        self.inner.close().await;
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.manager.abort();
        // Best-effort teardown when dropped inside a runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.close().await });
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}
