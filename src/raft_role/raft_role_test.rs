use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::RaftRole;
use super::RoleKind;
use super::candidate_state::CandidateState;
use super::follower_state::FollowerState;
use super::leader_state::LeaderHandles;
use super::leader_state::LeaderState;
use super::role_state::RoleState;
use super::standby_state::StandbyState;
use crate::LeaderLease;
use crate::ReplicationQueue;
use crate::test_utils::MockTypeConfig;

fn leader_handles(
    term: u64,
    generation: u64,
) -> LeaderHandles<MockTypeConfig> {
    LeaderHandles {
        term,
        generation,
        lease: Arc::new(LeaderLease::new(Duration::from_millis(150), 2.0)),
        leadership: CancellationToken::new(),
        queue: Arc::new(ReplicationQueue::new()),
        replicators: Arc::new(RwLock::new(HashMap::new())),
        health: Arc::new(DashMap::new()),
    }
}

#[test]
fn test_role_kinds_and_generations() {
    let follower: RaftRole<MockTypeConfig> =
        RaftRole::Follower(Box::new(FollowerState::new(3, (150, 300))));
    assert_eq!(follower.kind(), RoleKind::Follower);
    assert_eq!(follower.generation(), 3);
    assert!(follower.is_follower());

    let candidate: RaftRole<MockTypeConfig> =
        RaftRole::Candidate(Box::new(CandidateState::new(4, 7)));
    assert_eq!(candidate.kind(), RoleKind::Candidate);
    assert_eq!(candidate.state().pinned_term(), Some(7));

    let standby: RaftRole<MockTypeConfig> = RaftRole::Standby(Box::new(StandbyState::new(5, true)));
    assert_eq!(standby.kind(), RoleKind::Standby);

    let leader: RaftRole<MockTypeConfig> =
        RaftRole::Leader(Box::new(LeaderState::new(leader_handles(7, 6))));
    assert_eq!(leader.kind(), RoleKind::Leader);
    assert!(leader.is_leader());
    assert_eq!(leader.state().pinned_term(), Some(7));
}

/// Leader-scoped accessors answer only on the leader.
#[test]
fn test_leader_accessors_default_to_not_leader() {
    let follower = FollowerState::<MockTypeConfig>::new(1, (150, 300));
    assert!(follower.replication_queue().expect_err("not leader").is_not_leader());
    assert!(follower.lease().expect_err("not leader").is_not_leader());
    assert!(follower.leadership_token().expect_err("not leader").is_not_leader());

    let leader = LeaderState::<MockTypeConfig>::new(leader_handles(2, 2));
    assert!(leader.replication_queue().is_ok());
    assert!(leader.lease().is_ok());
    assert!(leader.leadership_token().is_ok());
}

#[test]
fn test_follower_deadline_refresh() {
    let mut follower = FollowerState::<MockTypeConfig>::new(1, (150, 300));
    assert!(!follower.is_expired(), "fresh follower has a future deadline");

    let before = follower.next_deadline().expect("followers have deadlines");
    std::thread::sleep(Duration::from_millis(5));
    follower.refresh_deadline();
    let after = follower.next_deadline().expect("deadline");
    assert!(after >= before, "refresh pushes the deadline out");

    // The shared cell mirrors the refreshed deadline for the timer task.
    assert_eq!(follower.deadline_cell().load(), after);
}

#[test]
fn test_follower_suppression_counter() {
    let mut follower = FollowerState::<MockTypeConfig>::new(1, (150, 300));
    assert!(!follower.is_suppressed());

    follower.begin_suppression();
    follower.begin_suppression();
    assert!(follower.is_suppressed());

    follower.end_suppression();
    assert!(follower.is_suppressed(), "nested scopes hold the suppression");
    follower.end_suppression();
    assert!(!follower.is_suppressed());

    // Underflow is clamped, not wrapped.
    follower.end_suppression();
    assert!(!follower.is_suppressed());
}

#[test]
fn test_candidate_restart_keeps_generation() {
    let mut candidate = CandidateState::<MockTypeConfig>::new(9, 4);
    candidate.restart_at(5);
    assert_eq!(candidate.term(), 5);
    assert_eq!(candidate.generation(), 9);
}

#[test]
fn test_standby_resumability() {
    let parked = StandbyState::<MockTypeConfig>::new(1, true);
    assert!(parked.is_resumable());

    let stopped = StandbyState::<MockTypeConfig>::new(2, false);
    assert!(!stopped.is_resumable());
}

/// Leader shutdown cancels the leadership scope, destroys the lease and
/// fails pending barrier waiters.
#[tokio::test]
async fn test_leader_shutdown_releases_resources() {
    let handles = leader_handles(3, 3);
    let mut leader = LeaderState::<MockTypeConfig>::new(handles.clone());

    handles.lease.renew(crate::timer::Timestamp::now());
    assert!(handles.lease.is_valid());
    let waiter = handles.queue.enqueue();

    leader.shut_down();

    assert!(handles.leadership.is_cancelled());
    assert!(!handles.lease.is_valid());
    assert_eq!(waiter.await.expect("waiter completed"), false);
}

/// Replacing a leader role value without an explicit shutdown still
/// cancels its scope through Drop.
#[tokio::test]
async fn test_leader_drop_is_a_shutdown_backstop() {
    let handles = leader_handles(4, 4);
    {
        let role: RaftRole<MockTypeConfig> =
            RaftRole::Leader(Box::new(LeaderState::new(handles.clone())));
        drop(role);
    }
    assert!(handles.leadership.is_cancelled());
}
