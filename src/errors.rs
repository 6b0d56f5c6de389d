//! Error hierarchy for the consensus core.
//!
//! Errors are grouped by protocol layer: infrastructure failures (network,
//! storage), configuration validation, and consensus protocol violations.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raft consensus protocol violations and failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Persistent log and configuration storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Peer communication failures
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Node configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation interrupted by a cancellation scope
    #[error("Operation canceled by {origin} scope")]
    Canceled { origin: CancellationOrigin },

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Scope that triggered a cancellation. Callers receive the origin so a
/// node shutdown is distinguishable from a lost leadership or their own
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOrigin {
    /// The node's lifecycle token was canceled via `stop()`
    Lifecycle,
    /// The leadership token was canceled on step-down
    Leadership,
    /// The caller's own token was canceled
    Caller,
}

impl std::fmt::Display for CancellationOrigin {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            CancellationOrigin::Lifecycle => write!(f, "lifecycle"),
            CancellationOrigin::Leadership => write!(f, "leadership"),
            CancellationOrigin::Caller => write!(f, "caller"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Illegal role transitions
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    /// Leader election failures (Section 5.2 Raft paper)
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Log replication failures (Section 5.3 Raft paper)
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Cluster membership change failures (Section 6 Raft paper)
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// Role permission conflict error
    #[error("Operation requires {required_role} role but current role is {current_role}")]
    RoleViolation {
        current_role: &'static str,
        required_role: &'static str,
        context: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition.")]
    InvalidTransition,
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// A peer reported a term higher than the candidate's
    #[error("Higher term {0} found during election")]
    HigherTerm(u64),

    /// Pre-vote round vetoed or rejected by the cluster
    #[error("Pre-vote rejected: tally {tally}")]
    PreVoteRejected { tally: i64 },

    /// Not enough granted votes within the election round
    #[error("Quorum failure: got {granted} of required {required}")]
    QuorumFailure { granted: usize, required: usize },

    /// The member set resolved to nothing votable
    #[error("No voting members known to candidate {candidate_id}")]
    NoVotingMemberFound { candidate_id: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Follower log does not contain the preceding entry
    #[error("Log mismatch at index {index} (expected term {expected_term})")]
    LogMismatch { index: u64, expected_term: u64 },

    /// Sender term is older than the receiver's
    #[error("Stale term {observed}, current term is {current}")]
    StaleTerm { observed: u64, current: u64 },

    /// Operation requires this node to be the leader
    #[error("Node is not the cluster leader")]
    NotLeader,

    /// Read barrier requested but no leader is known
    #[error("No leader known to the cluster")]
    LeaderUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// One configuration change at a time; the previous proposal has not
    /// been applied yet
    #[error("A proposed configuration is already pending")]
    ProposalPending,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Peer communication timeout
    #[error("Request to member {member_id} timed out after {duration:?}")]
    Timeout { member_id: u32, duration: Duration },

    /// Unreachable member with source context
    #[error("Member {member_id} unreachable: {reason}")]
    Unreachable { member_id: u32, reason: String },

    /// Internal signal channel closed before delivery
    #[error("{0}")]
    SignalSendFailed(String),

    /// Internal signal channel closed before receipt
    #[error("{0}")]
    SignalReceiveFailed(String),

    /// Background task failed
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during log operations
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Requested index is outside the retained log range
    #[error("Log index {index} out of range [{first}, {last}]")]
    IndexOutOfRange { first: u64, last: u64, index: u64 },

    /// Log storage subsystem failures
    #[error("Log storage failure: {0}")]
    LogStorage(String),

    /// Configuration storage failures
    #[error("Configuration storage error: {0}")]
    ConfigStorage(String),
}

impl From<StateTransitionError> for Error {
    fn from(err: StateTransitionError) -> Self {
        Error::Consensus(ConsensusError::StateTransition(err))
    }
}

impl From<ElectionError> for Error {
    fn from(err: ElectionError) -> Self {
        Error::Consensus(ConsensusError::Election(err))
    }
}

impl From<ReplicationError> for Error {
    fn from(err: ReplicationError) -> Self {
        Error::Consensus(ConsensusError::Replication(err))
    }
}

impl From<MembershipError> for Error {
    fn from(err: MembershipError) -> Self {
        Error::Consensus(ConsensusError::Membership(err))
    }
}

impl Error {
    /// True when the error represents the receiver-side stale term reply.
    pub fn is_stale_term(&self) -> bool {
        matches!(
            self,
            Error::Consensus(ConsensusError::Replication(ReplicationError::StaleTerm { .. }))
        )
    }

    /// True when the operation failed because this node is not the leader.
    pub fn is_not_leader(&self) -> bool {
        matches!(
            self,
            Error::Consensus(ConsensusError::Replication(ReplicationError::NotLeader))
        )
    }
}
