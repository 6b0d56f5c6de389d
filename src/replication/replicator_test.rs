use std::sync::Arc;

use bytes::Bytes;

use super::ReplicationOutcome;
use super::Replicator;
use super::RoundSnapshot;
use super::new_member_health;
use crate::AppendEntriesResponse;
use crate::ClusterConfiguration;
use crate::EwmaFailureDetector;
use crate::InMemoryConfigurationStore;
use crate::InstallSnapshotResponse;
use crate::LogEntry;
use crate::MockTransport;
use crate::NetworkError;
use crate::Peer;
use crate::PersistentLog;
use crate::TypeConfig;
use crate::config::FailureDetectorConfig;
use crate::test_utils::InMemoryLog;

/// Real log, mocked transport: the combination replicator rounds need.
#[derive(Clone, Debug)]
struct ReplicatorTypes;

impl TypeConfig for ReplicatorTypes {
    type Log = InMemoryLog;
    type Transport = MockTransport;
    type ConfigStorage = InMemoryConfigurationStore;
    type Detector = EwmaFailureDetector;
}

fn peer() -> Peer {
    Peer::new(2, "127.0.0.1:9002", true)
}

fn replicator(last_log_index: u64) -> Replicator<ReplicatorTypes> {
    let health = new_member_health::<ReplicatorTypes>(&FailureDetectorConfig::default());
    Replicator::new(peer(), last_log_index, health)
}

async fn seeded_log(entries: u64) -> Arc<InMemoryLog> {
    let log = Arc::new(InMemoryLog::new());
    let batch: Vec<LogEntry> = (1..=entries)
        .map(|index| LogEntry::new(1, index, Bytes::from_static(b"x"), None))
        .collect();
    log.append_entries(batch, 1, true).await.expect("seed");
    log
}

fn round(
    term: u64,
    commit_index: u64,
    current_index: u64,
) -> RoundSnapshot {
    RoundSnapshot {
        term,
        leader_id: 1,
        commit_index,
        current_index,
        config: ClusterConfiguration::new()
            .with_member(1, "127.0.0.1:9001")
            .with_member(2, "127.0.0.1:9002"),
        apply_config: true,
    }
}

/// Success advances match and next past the shipped batch.
#[tokio::test]
async fn test_success_advances_indices() {
    let log = seeded_log(8).await;
    let mut replicator = replicator(5);
    replicator.set_preceding(5, 1);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .withf(|_, request| {
            request.prev_log_index == 5 && request.prev_log_term == 1 && request.entries.len() == 3
        })
        .returning(|peer, request| Ok(AppendEntriesResponse::success(peer.id, request.term)));
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 5, 8), 1, 64).await;

    assert_eq!(
        outcome,
        ReplicationOutcome::Success {
            member_id: 2,
            match_index: 8,
            commit_ack: true,
        }
    );
    assert_eq!(replicator.state().next_index, 9);
    assert_eq!(replicator.state().match_index, 8);
}

/// A batch capped below the round's current index acknowledges without
/// qualifying for the commit quorum.
#[tokio::test]
async fn test_capped_batch_is_not_a_commit_ack() {
    let log = seeded_log(10).await;
    let mut replicator = replicator(0);
    replicator.set_preceding(0, 0);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .withf(|_, request| request.entries.len() == 4)
        .returning(|peer, request| Ok(AppendEntriesResponse::success(peer.id, request.term)));
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 0, 10), 1, 4).await;

    match outcome {
        ReplicationOutcome::Success {
            match_index,
            commit_ack,
            ..
        } => {
            assert_eq!(match_index, 4);
            assert!(!commit_ack, "partial catch-up must not count toward commit");
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(replicator.state().next_index, 5);
}

/// Log mismatch backs `next_index` off by the configured step.
#[tokio::test]
async fn test_log_mismatch_backs_off() {
    let log = seeded_log(8).await;
    let mut replicator = replicator(5);
    replicator.set_preceding(5, 1);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .returning(|peer, request| Ok(AppendEntriesResponse::log_mismatch(peer.id, request.term)));
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 5, 8), 2, 64).await;

    assert_eq!(outcome, ReplicationOutcome::Rejected { member_id: 2 });
    assert_eq!(replicator.state().next_index, 4, "backed off by the step");
    assert_eq!(replicator.state().match_index, 0, "match untouched on refusal");
}

/// Back-off never pushes `next_index` below one.
#[tokio::test]
async fn test_backoff_clamps_at_one() {
    let log = seeded_log(2).await;
    let mut replicator = replicator(1);
    replicator.set_preceding(1, 1);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .returning(|peer, request| Ok(AppendEntriesResponse::log_mismatch(peer.id, request.term)));
    let transport = Arc::new(transport);

    let _ = replicator.run_round(&log, &transport, &round(1, 0, 2), 10, 64).await;
    assert_eq!(replicator.state().next_index, 1);
}

/// A higher-term response surfaces for the leader to step down on.
#[tokio::test]
async fn test_higher_term_response() {
    let log = seeded_log(3).await;
    let mut replicator = replicator(3);
    replicator.set_preceding(3, 1);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .returning(|peer, _| Ok(AppendEntriesResponse::higher_term(peer.id, 9)));
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 3, 3), 1, 64).await;
    assert_eq!(
        outcome,
        ReplicationOutcome::HigherTerm {
            member_id: 2,
            term: 9,
        }
    );
}

/// Transport failure leaves the indices for the next round.
#[tokio::test]
async fn test_unreachable_leaves_indices() {
    let log = seeded_log(5).await;
    let mut replicator = replicator(3);
    replicator.set_preceding(3, 1);
    let before = replicator.state().clone();

    let mut transport = MockTransport::new();
    transport.expect_append_entries().returning(|peer, _| {
        Err(NetworkError::Unreachable {
            member_id: peer.id,
            reason: "down".into(),
        }
        .into())
    });
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 3, 5), 1, 64).await;
    assert_eq!(outcome, ReplicationOutcome::Unreachable { member_id: 2 });
    assert_eq!(replicator.state(), &before);
}

/// A member behind the earliest retained entry gets the snapshot, and
/// its indices jump past the compacted prefix.
#[tokio::test]
async fn test_snapshot_for_lagging_member() {
    let log = seeded_log(10).await;
    log.commit(10).await.expect("commit");
    log.compact(10).expect("compact");

    let mut replicator = replicator(2);
    assert!(replicator.needs_snapshot(log.first_entry_index()));

    let mut transport = MockTransport::new();
    transport
        .expect_install_snapshot()
        .withf(|_, request| request.snapshot_index == 10 && request.snapshot.is_snapshot)
        .returning(|peer, request| {
            Ok(InstallSnapshotResponse {
                node_id: peer.id,
                term: request.term,
                success: true,
            })
        });
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 10, 10), 1, 64).await;

    assert_eq!(
        outcome,
        ReplicationOutcome::Success {
            member_id: 2,
            match_index: 10,
            commit_ack: true,
        }
    );
    assert_eq!(replicator.state().next_index, 11);
}

/// After a configuration refusal the next request withholds the apply
/// flag so the proposal lands first.
#[tokio::test]
async fn test_config_rejection_forces_proposal_resend() {
    let log = seeded_log(3).await;
    let mut replicator = replicator(3);
    replicator.set_preceding(3, 1);

    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .times(1)
        .withf(|_, request| request.apply_config)
        .returning(|peer, request| {
            Ok(AppendEntriesResponse::config_mismatch(peer.id, request.term))
        });
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 3, 3), 1, 64).await;
    assert_eq!(outcome, ReplicationOutcome::ConfigRejected { member_id: 2 });
    assert!(!replicator.state().config_synced);

    // Next round resends the table as a proposal.
    let mut transport = MockTransport::new();
    transport
        .expect_append_entries()
        .times(1)
        .withf(|_, request| !request.apply_config)
        .returning(|peer, request| Ok(AppendEntriesResponse::success(peer.id, request.term)));
    let transport = Arc::new(transport);

    let outcome = replicator.run_round(&log, &transport, &round(1, 3, 3), 1, 64).await;
    assert!(matches!(outcome, ReplicationOutcome::Success { .. }));
    assert!(replicator.state().config_synced, "apply allowed again");
}
