//! Multi-node cluster harness for protocol tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::ClusterConfiguration;
use crate::EwmaFailureDetector;
use crate::InMemoryConfigurationStore;
use crate::MemberEntry;
use crate::NodeConfig;
use crate::RaftCluster;
use crate::TypeConfig;
use crate::test_utils::InMemoryLog;
use crate::test_utils::LoopbackHub;
use crate::test_utils::LoopbackTransport;

/// Adapter bundle for loopback clusters.
#[derive(Clone, Debug)]
pub struct LoopbackTypes;

impl TypeConfig for LoopbackTypes {
    type Log = InMemoryLog;
    type Transport = LoopbackTransport;
    type ConfigStorage = InMemoryConfigurationStore;
    type Detector = EwmaFailureDetector;
}

/// A set of loopback nodes wired through one hub.
pub struct TestCluster {
    pub hub: Arc<LoopbackHub>,
    nodes: BTreeMap<u32, RaftCluster<LoopbackTypes>>,
    logs: BTreeMap<u32, Arc<InMemoryLog>>,
}

fn member_address(id: u32) -> String {
    format!("127.0.0.1:{}", 9000 + id)
}

/// Timing used by most protocol tests: fast elections, fast rounds.
pub fn test_node_config(
    node_id: u32,
    member_ids: &[u32],
) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.cluster.node_id = node_id;
    config.cluster.address = member_address(node_id);
    config.cluster.initial_members = member_ids
        .iter()
        .map(|&id| MemberEntry {
            id,
            address: member_address(id),
        })
        .collect();
    config.raft.election.election_timeout_min = 150;
    config.raft.election.election_timeout_max = 300;
    config.raft.heartbeat_threshold = 0.3;
    config.raft.clock_drift_bound = 2.0;
    config
}

impl TestCluster {
    pub async fn launch(member_ids: &[u32]) -> Self {
        Self::launch_with(member_ids, |_| {}).await
    }

    pub async fn launch_with(
        member_ids: &[u32],
        tweak: impl Fn(&mut NodeConfig),
    ) -> Self {
        let hub = LoopbackHub::new();
        let mut nodes = BTreeMap::new();
        let mut logs = BTreeMap::new();

        for &id in member_ids {
            let mut config = test_node_config(id, member_ids);
            tweak(&mut config);

            let log = Arc::new(InMemoryLog::new());
            let store = Arc::new(InMemoryConfigurationStore::new(ClusterConfiguration::new()));
            let transport = Arc::new(hub.transport_for(id));
            let cluster =
                RaftCluster::<LoopbackTypes>::new(log.clone(), transport, store, Arc::new(config))
                    .expect("valid test node config");
            hub.register(cluster.clone());
            logs.insert(id, log);
            nodes.insert(id, cluster);
        }

        for node in nodes.values() {
            node.start().await.expect("node start");
        }

        Self { hub, nodes, logs }
    }

    pub fn node(
        &self,
        id: u32,
    ) -> &RaftCluster<LoopbackTypes> {
        self.nodes.get(&id).expect("known node id")
    }

    pub fn log(
        &self,
        id: u32,
    ) -> &Arc<InMemoryLog> {
        self.logs.get(&id).expect("known node id")
    }

    pub fn nodes(&self) -> impl Iterator<Item = (u32, &RaftCluster<LoopbackTypes>)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Polls until exactly one live node claims leadership.
    pub async fn await_leader(
        &self,
        timeout: Duration,
    ) -> u32 {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders: Vec<u32> = self
                .nodes
                .iter()
                .filter(|(id, node)| node.is_leader() && !self.hub.is_down(**id))
                .map(|(id, _)| *id)
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            assert!(
                Instant::now() < deadline,
                "no single leader within {timeout:?}, saw {leaders:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Live nodes currently claiming leadership.
    pub fn leader_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(id, node)| node.is_leader() && !self.hub.is_down(**id))
            .count()
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.stop().await;
        }
    }
}
