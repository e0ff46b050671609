//! Cluster metadata cache.
//!
//! Rebuilt wholesale from each metadata response; never patched
//! incrementally. A stale entry costs one failed request and a re-home, so
//! freshness is driven by the recovery path, not by TTLs.

use std::collections::HashMap;

use skein_wire::response::MetadataResponse;

/// A broker's advertised address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BrokerAddr {
    pub(crate) host: String,
    pub(crate) port: i32,
}

impl BrokerAddr {
    /// The `host:port` dial string.
    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the cluster last reported about one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionInfo {
    /// Leader broker id; negative while an election is in progress.
    pub(crate) leader: i32,
    pub(crate) replicas: Vec<i32>,
    pub(crate) isr: Vec<i32>,
}

/// Broker and partition-leader view of the cluster.
#[derive(Debug, Default)]
pub(crate) struct MetadataCache {
    brokers: HashMap<i32, BrokerAddr>,
    topics: HashMap<String, HashMap<i32, PartitionInfo>>,
}

impl MetadataCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replaces the entire cache with the contents of one response.
    pub(crate) fn rebuild(&mut self, response: &MetadataResponse) {
        self.brokers = response
            .brokers
            .iter()
            .map(|b| {
                (
                    b.node_id,
                    BrokerAddr {
                        host: b.host.clone(),
                        port: b.port,
                    },
                )
            })
            .collect();

        self.topics = response
            .topics
            .iter()
            .map(|t| {
                let partitions = t
                    .partitions
                    .iter()
                    .map(|p| {
                        (
                            p.id,
                            PartitionInfo {
                                leader: p.leader,
                                replicas: p.replicas.clone(),
                                isr: p.isr.clone(),
                            },
                        )
                    })
                    .collect();
                (t.name.clone(), partitions)
            })
            .collect();
    }

    pub(crate) fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionInfo> {
        self.topics.get(topic)?.get(&partition)
    }

    pub(crate) fn broker_addr(&self, broker_id: i32) -> Option<String> {
        self.brokers.get(&broker_id).map(BrokerAddr::to_addr)
    }

    /// Finds the broker id advertising `addr` (a `host:port` string).
    pub(crate) fn broker_id_for_addr(&self, addr: &str) -> Option<i32> {
        self.brokers
            .iter()
            .find(|(_, broker)| broker.to_addr() == addr)
            .map(|(id, _)| *id)
    }

    pub(crate) fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn partition_ids(&self, topic: &str) -> Option<Vec<i32>> {
        self.topics.get(topic).map(|partitions| {
            let mut ids: Vec<_> = partitions.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::response::{BrokerMeta, ErrorCode, PartitionMeta, TopicMeta};

    fn response() -> MetadataResponse {
        MetadataResponse {
            brokers: vec![
                BrokerMeta {
                    node_id: 0,
                    host: "a.example".into(),
                    port: 9092,
                },
                BrokerMeta {
                    node_id: 1,
                    host: "b.example".into(),
                    port: 9092,
                },
            ],
            topics: vec![TopicMeta {
                error: ErrorCode::None,
                name: "events".into(),
                partitions: vec![
                    PartitionMeta {
                        error: ErrorCode::None,
                        id: 0,
                        leader: 1,
                        replicas: vec![0, 1],
                        isr: vec![1],
                    },
                    PartitionMeta {
                        error: ErrorCode::LeaderNotAvailable,
                        id: 1,
                        leader: -1,
                        replicas: vec![0, 1],
                        isr: vec![],
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_rebuild_and_lookup() {
        let mut cache = MetadataCache::new();
        cache.rebuild(&response());

        assert_eq!(cache.broker_addr(0), Some("a.example:9092".into()));
        assert_eq!(cache.partition("events", 0).unwrap().leader, 1);
        assert_eq!(cache.partition("events", 1).unwrap().leader, -1);
        assert!(cache.partition("missing", 0).is_none());
    }

    #[test]
    fn test_rebuild_replaces_wholesale() {
        let mut cache = MetadataCache::new();
        cache.rebuild(&response());

        let empty = MetadataResponse {
            brokers: vec![BrokerMeta {
                node_id: 7,
                host: "c.example".into(),
                port: 9092,
            }],
            topics: vec![],
        };
        cache.rebuild(&empty);

        assert!(cache.broker_addr(0).is_none());
        assert_eq!(cache.broker_addr(7), Some("c.example:9092".into()));
        assert!(cache.partition("events", 0).is_none());
    }

    #[test]
    fn test_broker_id_for_addr() {
        let mut cache = MetadataCache::new();
        cache.rebuild(&response());
        assert_eq!(cache.broker_id_for_addr("b.example:9092"), Some(1));
        assert_eq!(cache.broker_id_for_addr("c.example:9092"), None);
    }

    #[test]
    fn test_topic_and_partition_listings() {
        let mut cache = MetadataCache::new();
        cache.rebuild(&response());
        assert_eq!(cache.topic_names(), vec!["events".to_string()]);
        assert_eq!(cache.partition_ids("events"), Some(vec![0, 1]));
        assert_eq!(cache.partition_ids("missing"), None);
    }
}
