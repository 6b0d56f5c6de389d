pub mod candidate_state;
pub mod follower_state;
pub mod leader_state;
pub mod role_state;
pub mod standby_state;

#[cfg(test)]
mod raft_role_test;

use candidate_state::CandidateState;
use follower_state::FollowerState;
use leader_state::LeaderState;
use role_state::RoleState;
use standby_state::StandbyState;

use crate::TypeConfig;

/// Role discriminant, also published through an atomic so the lock-free
/// pre-vote handler can read the current role.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
    Standby = 3,
}

impl RoleKind {
    pub fn from_u8(raw: u8) -> RoleKind {
        match raw {
            0 => RoleKind::Follower,
            1 => RoleKind::Candidate,
            2 => RoleKind::Leader,
            _ => RoleKind::Standby,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoleKind::Follower => "Follower",
            RoleKind::Candidate => "Candidate",
            RoleKind::Leader => "Leader",
            RoleKind::Standby => "Standby",
        }
    }
}

/// The live role value guarded by the transition lock.
///
/// Exactly one variant exists at a time; transitions replace the whole
/// value. Deferred callbacks (timers, election continuations) carry the
/// generation they observed and are dropped when it no longer matches.
pub enum RaftRole<T: TypeConfig> {
    Follower(Box<FollowerState<T>>),
    Candidate(Box<CandidateState<T>>),
    Leader(Box<LeaderState<T>>),
    Standby(Box<StandbyState<T>>),
}

impl<T: TypeConfig> RaftRole<T> {
    pub(crate) fn state(&self) -> &dyn RoleState<T = T> {
        match self {
            RaftRole::Follower(state) => state.as_ref(),
            RaftRole::Candidate(state) => state.as_ref(),
            RaftRole::Leader(state) => state.as_ref(),
            RaftRole::Standby(state) => state.as_ref(),
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut dyn RoleState<T = T> {
        match self {
            RaftRole::Follower(state) => state.as_mut(),
            RaftRole::Candidate(state) => state.as_mut(),
            RaftRole::Leader(state) => state.as_mut(),
            RaftRole::Standby(state) => state.as_mut(),
        }
    }

    pub fn kind(&self) -> RoleKind {
        self.state().kind()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation()
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader(_))
    }

    pub(crate) fn is_follower(&self) -> bool {
        matches!(self, RaftRole::Follower(_))
    }

    /// Cleans up role-scoped resources before the value is replaced.
    ///
    /// Leader shutdown is the interesting case: the leadership token is
    /// canceled, the lease destroyed and barrier waiters failed so no
    /// caller waits on a round that will never run.
    pub(crate) fn shut_down(&mut self) {
        if let RaftRole::Leader(leader) = self {
            leader.shut_down();
        }
    }
}

impl<T: TypeConfig> std::fmt::Debug for RaftRole<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RaftRole")
            .field("kind", &self.kind())
            .field("generation", &self.generation())
            .finish()
    }
}
