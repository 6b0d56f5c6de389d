//! In-process transport routing RPCs between registered clusters.
//!
//! The hub models a tiny network: nodes can be killed (process death,
//! no traffic in or out) or isolated into a partition group. Requests
//! to the local node loop back through the same path as remote ones.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::AppendEntriesRequest;
use crate::AppendEntriesResponse;
use crate::InstallSnapshotRequest;
use crate::InstallSnapshotResponse;
use crate::NetworkError;
use crate::Peer;
use crate::PreVoteRequest;
use crate::PreVoteResponse;
use crate::RaftCluster;
use crate::Result;
use crate::SynchronizeRequest;
use crate::SynchronizeResponse;
use crate::Transport;
use crate::VoteRequest;
use crate::VoteResponse;
use crate::test_utils::LoopbackTypes;

pub struct LoopbackHub {
    nodes: DashMap<u32, RaftCluster<LoopbackTypes>>,
    down: DashMap<u32, ()>,
    partition_group: DashMap<u32, u8>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            down: DashMap::new(),
            partition_group: DashMap::new(),
        })
    }

    pub fn register(
        &self,
        cluster: RaftCluster<LoopbackTypes>,
    ) {
        self.nodes.insert(cluster.node_id(), cluster);
    }

    pub fn transport_for(
        self: &Arc<Self>,
        local_id: u32,
    ) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            local_id,
        }
    }

    /// Simulates process death: no traffic in or out.
    pub fn kill(
        &self,
        member_id: u32,
    ) {
        self.down.insert(member_id, ());
    }

    pub fn revive(
        &self,
        member_id: u32,
    ) {
        self.down.remove(&member_id);
    }

    pub fn is_down(
        &self,
        member_id: u32,
    ) -> bool {
        self.down.contains_key(&member_id)
    }

    /// Moves the member into its own partition side.
    pub fn isolate(
        &self,
        member_id: u32,
    ) {
        self.partition_group.insert(member_id, 1);
    }

    pub fn rejoin(
        &self,
        member_id: u32,
    ) {
        self.partition_group.remove(&member_id);
    }

    fn group_of(
        &self,
        member_id: u32,
    ) -> u8 {
        self.partition_group.get(&member_id).map(|group| *group).unwrap_or(0)
    }

    fn reachable(
        &self,
        from: u32,
        to: u32,
    ) -> bool {
        !self.down.contains_key(&from)
            && !self.down.contains_key(&to)
            && self.group_of(from) == self.group_of(to)
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local_id: u32,
}

impl LoopbackTransport {
    fn target(
        &self,
        member_id: u32,
    ) -> Result<RaftCluster<LoopbackTypes>> {
        if !self.hub.reachable(self.local_id, member_id) {
            return Err(NetworkError::Unreachable {
                member_id,
                reason: "partitioned or down".into(),
            }
            .into());
        }
        self.hub
            .nodes
            .get(&member_id)
            .map(|node| node.clone())
            .ok_or_else(|| {
                NetworkError::Unreachable {
                    member_id,
                    reason: "not registered".into(),
                }
                .into()
            })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn append_entries(
        &self,
        peer: Peer,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.target(peer.id)?.append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        peer: Peer,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.target(peer.id)?.install_snapshot(request).await
    }

    async fn vote(
        &self,
        peer: Peer,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        self.target(peer.id)?.vote(request).await
    }

    async fn pre_vote(
        &self,
        peer: Peer,
        request: PreVoteRequest,
    ) -> Result<PreVoteResponse> {
        self.target(peer.id)?.pre_vote(request).await
    }

    async fn synchronize(
        &self,
        peer: Peer,
        request: SynchronizeRequest,
    ) -> Result<SynchronizeResponse> {
        self.target(peer.id)?.synchronize(request).await
    }

    async fn resign(
        &self,
        peer: Peer,
    ) -> Result<bool> {
        self.target(peer.id)?.handle_resign().await
    }

    async fn cancel_pending_requests(
        &self,
        _peer: Peer,
    ) -> Result<()> {
        // Loopback requests complete inline; nothing to abort.
        Ok(())
    }
}
