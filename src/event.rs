//! Events surfaced to embedders.

use tokio_util::sync::CancellationToken;

use crate::Peer;

/// Cluster-level notifications delivered over a broadcast channel.
///
/// Slow subscribers may observe lagging; events carry enough context to
/// resynchronize from the public getters.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A different member (or none) is now believed to be leader
    LeaderChanged {
        old_leader: Option<u32>,
        new_leader: Option<u32>,
    },

    /// A heartbeat round completed against this member
    ReplicationCompleted { member_id: u32 },

    /// Configuration promotion added this member
    MemberAdded { member_id: u32 },

    /// Configuration promotion removed this member
    MemberRemoved { member_id: u32 },
}

/// Out-of-band callback invoked when the failure detector declares a
/// follower unavailable. The core never removes members itself; the
/// handler decides whether to propose an eviction.
///
/// The token is the leadership token of the reporting term. A handler
/// should abandon its work once the token is canceled.
pub type UnavailableMemberHandler = dyn Fn(Peer, CancellationToken) + Send + Sync;
