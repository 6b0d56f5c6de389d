//! Behavior shared by all role states.
//!
//! Leader-scoped accessors default to a `NotLeader` error so callers can
//! dispatch through the trait without matching every variant; only
//! `LeaderState` overrides them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::LeaderLease;
use crate::ReplicationError;
use crate::ReplicationQueue;
use crate::Result;
use crate::TypeConfig;
use crate::raft_role::RoleKind;
use crate::timer::Timestamp;

pub trait RoleState: Send + Sync {
    type T: TypeConfig;

    fn kind(&self) -> RoleKind;

    /// Monotone instance counter compared against deferred callbacks.
    fn generation(&self) -> u64;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    // --- Follower timing ----------------------------------------------------

    /// Pushes the election deadline out. No-op for roles without one.
    fn refresh_deadline(&mut self) {}

    /// True when the election deadline has passed. Roles without a
    /// deadline never expire.
    fn is_expired(&self) -> bool {
        false
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        None
    }

    // --- Leader-scoped accessors --------------------------------------------

    fn replication_queue(&self) -> Result<Arc<ReplicationQueue>> {
        warn!("replication_queue requested on {}", self.name());
        Err(ReplicationError::NotLeader.into())
    }

    fn lease(&self) -> Result<Arc<LeaderLease>> {
        warn!("lease requested on {}", self.name());
        Err(ReplicationError::NotLeader.into())
    }

    fn leadership_token(&self) -> Result<CancellationToken> {
        warn!("leadership_token requested on {}", self.name());
        Err(ReplicationError::NotLeader.into())
    }

    /// Term the role was entered at. Follower and standby read the log
    /// instead; only candidate and leader pin a term.
    fn pinned_term(&self) -> Option<u64> {
        None
    }
}
