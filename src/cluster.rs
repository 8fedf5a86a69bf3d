//! Broker directory: cluster topology derived from metadata responses.
//!
//! The directory keeps two maps, replaced wholesale on every successful
//! metadata sync: broker id to address, and topic to partition-leader ids.
//! Change is detected by value comparison so the state machines can
//! invalidate dependent state (assignments, partition routing) only when
//! the topology actually moved.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::FranzError;
use crate::protocol::messages::MetadataResponse;
use crate::transport::{BrokerConnection, ConnectionPool};

#[derive(Debug, Default)]
struct Topology {
    /// broker id -> `host:port`
    brokers: HashMap<i32, String>,
    /// topic -> partition -> leader broker id
    topics: HashMap<String, HashMap<i32, i32>>,
}

#[derive(Debug)]
pub struct BrokerDirectory {
    bootstrap: Vec<String>,
    topology: RwLock<Topology>,
    pool: Arc<ConnectionPool>,
}

impl BrokerDirectory {
    pub fn new(bootstrap: Vec<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            bootstrap,
            topology: RwLock::new(Topology::default()),
            pool,
        }
    }

    /// Rebuild the topology from a metadata response. Topics that came back
    /// with an error are skipped, not fatal. Returns whether either map
    /// changed by value.
    pub fn apply_metadata(&self, response: &MetadataResponse) -> bool {
        let mut brokers = HashMap::new();
        for broker in &response.brokers {
            brokers.insert(broker.node_id, format!("{}:{}", broker.host, broker.port));
        }

        let mut topics: HashMap<String, HashMap<i32, i32>> = HashMap::new();
        for topic in &response.topics {
            if topic.error_code != 0 {
                warn!(
                    topic = %topic.topic,
                    code = topic.error_code,
                    "skipping topic with metadata error"
                );
                continue;
            }
            let partitions = topic
                .partitions
                .iter()
                .map(|p| (p.partition, p.leader))
                .collect();
            topics.insert(topic.topic.clone(), partitions);
        }

        let mut topology = self.topology.write();
        let changed = topology.brokers != brokers || topology.topics != topics;
        if changed {
            debug!(
                brokers = brokers.len(),
                topics = topics.len(),
                "cluster topology changed"
            );
        }
        topology.brokers = brokers;
        topology.topics = topics;
        changed
    }

    pub fn broker_addr(&self, broker_id: i32) -> Option<String> {
        self.topology.read().brokers.get(&broker_id).cloned()
    }

    pub fn broker_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.topology.read().brokers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Sorted partition ids of a topic, if known.
    pub fn partitions(&self, topic: &str) -> Option<Vec<i32>> {
        let topology = self.topology.read();
        let partitions = topology.topics.get(topic)?;
        let mut ids: Vec<i32> = partitions.keys().copied().collect();
        ids.sort_unstable();
        Some(ids)
    }

    pub fn leader(&self, topic: &str, partition: i32) -> Option<i32> {
        self.topology
            .read()
            .topics
            .get(topic)?
            .get(&partition)
            .copied()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topology.read().topics.keys().cloned().collect()
    }

    /// Group `(topic, partition)` pairs by the partition leader's broker id.
    /// Pairs whose leader is unknown are dropped.
    pub fn group_by_leader(
        &self,
        pairs: impl IntoIterator<Item = (String, i32)>,
    ) -> HashMap<i32, Vec<(String, i32)>> {
        let mut grouped: HashMap<i32, Vec<(String, i32)>> = HashMap::new();
        for (topic, partition) in pairs {
            match self.leader(&topic, partition) {
                Some(leader) => grouped.entry(leader).or_default().push((topic, partition)),
                None => {
                    warn!(%topic, partition, "no leader known, dropping");
                }
            }
        }
        grouped
    }

    /// A connection to any reachable broker, preferring discovered brokers
    /// over the bootstrap list. Failure here is fatal to the caller's step:
    /// with no reachable broker, no progress is possible.
    pub async fn any_connection(&self) -> Result<Arc<BrokerConnection>, FranzError> {
        let known: Vec<String> = {
            let topology = self.topology.read();
            topology.brokers.values().cloned().collect()
        };
        let candidates = if known.is_empty() {
            self.bootstrap.clone()
        } else {
            known
        };
        self.pool.any(&candidates).await
    }

    /// A connection to the broker leading data we care about. Connection
    /// failure is a sentinel `None`: the calling step skips this iteration
    /// and retries on its next tick.
    pub async fn data_connection(&self, broker_id: i32) -> Option<Arc<BrokerConnection>> {
        let addr = self.broker_addr(broker_id)?;
        match self.pool.get(&addr).await {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(broker_id, %addr, %err, "data connection unavailable");
                None
            }
        }
    }

    /// A connection to an explicit address (used for the group coordinator).
    pub async fn addr_connection(&self, addr: &str) -> Option<Arc<BrokerConnection>> {
        match self.pool.get(addr).await {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(%addr, %err, "connection unavailable");
                None
            }
        }
    }

    pub fn shutdown(&self) {
        self.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{BrokerMetadata, PartitionMetadata, TopicMetadata};
    use std::time::Duration;

    fn directory() -> BrokerDirectory {
        let pool = Arc::new(ConnectionPool::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            None,
        ));
        BrokerDirectory::new(vec!["localhost:9092".into()], pool)
    }

    fn metadata(leader_of_p1: i32) -> MetadataResponse {
        MetadataResponse {
            brokers: vec![
                BrokerMetadata {
                    node_id: 0,
                    host: "a".into(),
                    port: 9092,
                },
                BrokerMetadata {
                    node_id: 1,
                    host: "b".into(),
                    port: 9092,
                },
            ],
            topics: vec![TopicMetadata {
                error_code: 0,
                topic: "test".into(),
                partitions: vec![
                    PartitionMetadata {
                        error_code: 0,
                        partition: 0,
                        leader: 0,
                        replicas: vec![0, 1],
                        isr: vec![0, 1],
                    },
                    PartitionMetadata {
                        error_code: 0,
                        partition: 1,
                        leader: leader_of_p1,
                        replicas: vec![0, 1],
                        isr: vec![0, 1],
                    },
                ],
            }],
        }
    }

    #[test]
    fn identical_metadata_is_not_a_change() {
        let dir = directory();
        assert!(dir.apply_metadata(&metadata(1)), "first sync populates");
        assert!(!dir.apply_metadata(&metadata(1)), "same data, no change");
    }

    #[test]
    fn leader_move_is_a_change() {
        let dir = directory();
        dir.apply_metadata(&metadata(1));
        assert!(dir.apply_metadata(&metadata(0)));
        assert_eq!(dir.leader("test", 1), Some(0));
    }

    #[test]
    fn topic_errors_are_skipped_not_fatal() {
        let dir = directory();
        let mut response = metadata(1);
        response.topics.push(TopicMetadata {
            error_code: 5,
            topic: "broken".into(),
            partitions: vec![],
        });
        dir.apply_metadata(&response);
        assert!(dir.partitions("broken").is_none());
        assert_eq!(dir.partitions("test"), Some(vec![0, 1]));
    }

    #[test]
    fn accessors_reflect_topology() {
        let dir = directory();
        dir.apply_metadata(&metadata(1));
        assert_eq!(dir.broker_addr(0), Some("a:9092".into()));
        assert_eq!(dir.broker_addr(9), None);
        assert_eq!(dir.broker_ids(), vec![0, 1]);
        assert_eq!(dir.leader("test", 0), Some(0));
        assert_eq!(dir.leader("missing", 0), None);
    }

    #[test]
    fn grouping_by_leader_drops_unknown() {
        let dir = directory();
        dir.apply_metadata(&metadata(1));
        let grouped = dir.group_by_leader(vec![
            ("test".to_string(), 0),
            ("test".to_string(), 1),
            ("missing".to_string(), 0),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&0], vec![("test".to_string(), 0)]);
        assert_eq!(grouped[&1], vec![("test".to_string(), 1)]);
    }
}
