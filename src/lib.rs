//! # quoraft
//!
//! Transport-independent Raft consensus core.
//!
//! This crate owns the protocol state machine of a replicated cluster
//! node: role transitions (Follower, Candidate, Leader, Standby), leader
//! election with pre-vote, quorum-gated log replication, snapshot
//! installation, a leader lease for linearizable reads, one-at-a-time
//! configuration changes and failure-detector driven member reporting.
//!
//! Everything environmental is a trait seam you implement:
//!
//! - [`PersistentLog`] - durable log, term and vote storage
//! - [`Transport`] - per-member RPC delivery
//! - [`ConfigurationStorage`] - active/proposed member tables
//! - [`FailureDetector`] - follower liveness estimation
//!
//! Bundle the four implementations in a [`TypeConfig`] marker and hand
//! them to [`RaftCluster`]:
//!
//! ```rust,ignore
//! #[derive(Clone, Debug)]
//! struct MyTypes;
//! impl TypeConfig for MyTypes {
//!     type Log = MyLog;
//!     type Transport = MyGrpcTransport;
//!     type ConfigStorage = MyConfigStore;
//!     type Detector = EwmaFailureDetector;
//! }
//!
//! let cluster = RaftCluster::<MyTypes>::new(log, transport, configs, node_config)?;
//! cluster.start().await?;
//! cluster.replicate(payload, None).await?;
//! ```
//!
//! Wire formats, sockets and on-disk layouts are deliberately out of
//! scope; the loopback transport under `test_utils` shows the smallest
//! possible integration.

mod cluster;
pub mod config;
mod errors;
mod event;
mod failure_detector;
mod lease;
mod membership;
mod messages;
mod network;
mod raft_context;
mod raft_role;
mod replication;
mod storage;
mod term_cache;
mod timer;
mod type_config;

pub use cluster::*;
pub use config::*;
pub use errors::*;
pub use event::*;
pub use failure_detector::*;
pub use lease::*;
pub use membership::*;
pub use messages::*;
pub use network::*;
pub use raft_context::*;
pub use replication::*;
pub use storage::*;
pub use term_cache::*;
pub use timer::*;
pub use type_config::*;

#[doc(hidden)]
pub use raft_role::*;


#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(any(test, feature = "test-utils"))]
pub use test_utils::*;

/// Raft paper section 5.4.1, election restriction: the candidate's log
/// is electable when its last term is higher, or terms tie and its log
/// is at least as long.
pub(crate) fn is_candidate_log_current(
    my_last_index: u64,
    my_last_term: u64,
    candidate_last_index: u64,
    candidate_last_term: u64,
) -> bool {
    candidate_last_term > my_last_term
        || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
}

#[cfg(test)]
mod up_to_date_test {
    use super::is_candidate_log_current;

    #[test]
    fn test_higher_last_term_wins() {
        assert!(is_candidate_log_current(10, 3, 2, 4));
    }

    #[test]
    fn test_tied_term_longer_log_wins() {
        assert!(is_candidate_log_current(5, 3, 5, 3));
        assert!(is_candidate_log_current(5, 3, 6, 3));
        assert!(!is_candidate_log_current(5, 3, 4, 3));
    }

    #[test]
    fn test_lower_last_term_loses() {
        assert!(!is_candidate_log_current(2, 4, 10, 3));
    }
}
