//! Per-follower replication driver.
//!
//! One replicator owns one member's progress (`next_index`,
//! `match_index`, preceding pair) and decides each round whether the
//! member gets an AppendEntries batch or a snapshot. Requests to the same
//! member never overlap; the leader skips a member whose previous round
//! is still in flight.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::AppendConflict;
use crate::AppendEntriesRequest;
use crate::ClusterConfiguration;
use crate::FailureDetector;
use crate::InstallSnapshotRequest;
use crate::Peer;
use crate::PersistentLog;
use crate::Transport;
use crate::TypeConfig;
use crate::alias::FDOF;
use crate::alias::ROF;
use crate::alias::TROF;

/// Volatile per-member progress owned by the member's replicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationState {
    /// Index of the next entry to ship
    pub next_index: u64,
    /// Highest index known replicated on the member
    pub match_index: u64,
    /// Index preceding the next batch
    pub preceding_index: u64,
    /// Term of the preceding entry
    pub preceding_term: u64,
    /// False after the member rejected a configuration apply; forces the
    /// proposal to be resent before another apply attempt
    pub config_synced: bool,
}

impl ReplicationState {
    fn new(last_log_index: u64) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
            preceding_index: last_log_index,
            preceding_term: 0,
            config_synced: true,
        }
    }
}

/// Liveness bookkeeping kept outside the replicator lock so the eviction
/// sweep can read it while the member's round is still in flight.
pub struct MemberHealth<T: TypeConfig> {
    detector: FDOF<T>,
    eviction_reported: AtomicBool,
}

impl<T: TypeConfig> MemberHealth<T> {
    pub(crate) fn new(detector: FDOF<T>) -> Self {
        Self {
            detector,
            eviction_reported: AtomicBool::new(false),
        }
    }

    pub(crate) fn report_heartbeat(&self) {
        self.detector.report_heartbeat();
        // The member answered; allow a future eviction report again.
        self.eviction_reported.store(false, Ordering::Release);
    }

    pub(crate) fn is_monitoring(&self) -> bool {
        self.detector.is_monitoring()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.detector.is_healthy()
    }

    /// Claims the single-flight eviction slot. The first caller since
    /// the last heartbeat gets `true`.
    pub(crate) fn claim_eviction_slot(&self) -> bool {
        !self.eviction_reported.swap(true, Ordering::AcqRel)
    }
}

/// Immutable view of the leader's state taken once per heartbeat round.
#[derive(Debug, Clone)]
pub(crate) struct RoundSnapshot {
    pub term: u64,
    pub leader_id: u32,
    pub commit_index: u64,
    /// Last log index at round start; a full acknowledgement means the
    /// member confirmed everything up to here
    pub current_index: u64,
    pub config: ClusterConfiguration,
    pub apply_config: bool,
}

/// What one member's round produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReplicationOutcome {
    /// Positive acknowledgement. `commit_ack` holds when the member
    /// confirmed the round's full range.
    Success {
        member_id: u32,
        match_index: u64,
        commit_ack: bool,
    },
    /// The member reported a term above the leader's
    HigherTerm { member_id: u32, term: u64 },
    /// Log mismatch; `next_index` backed off for the next round
    Rejected { member_id: u32 },
    /// Configuration apply refused; the proposal will be resent
    ConfigRejected { member_id: u32 },
    /// Transport failure; indices untouched
    Unreachable { member_id: u32 },
    /// Snapshot transfer refused by the member
    SnapshotRefused { member_id: u32 },
}

impl ReplicationOutcome {
    /// Any delivered response, positive or not.
    pub(crate) fn is_response(&self) -> bool {
        !matches!(self, ReplicationOutcome::Unreachable { .. })
    }

    pub(crate) fn member_id(&self) -> u32 {
        match *self {
            ReplicationOutcome::Success { member_id, .. }
            | ReplicationOutcome::HigherTerm { member_id, .. }
            | ReplicationOutcome::Rejected { member_id }
            | ReplicationOutcome::ConfigRejected { member_id }
            | ReplicationOutcome::Unreachable { member_id }
            | ReplicationOutcome::SnapshotRefused { member_id } => member_id,
        }
    }
}

pub struct Replicator<T: TypeConfig> {
    peer: Peer,
    state: ReplicationState,
    health: Arc<MemberHealth<T>>,
}

impl<T: TypeConfig> Replicator<T> {
    pub(crate) fn new(
        peer: Peer,
        last_log_index: u64,
        health: Arc<MemberHealth<T>>,
    ) -> Self {
        Self {
            peer,
            state: ReplicationState::new(last_log_index),
            health,
        }
    }

    pub(crate) fn peer(&self) -> &Peer {
        &self.peer
    }

    pub(crate) fn state(&self) -> &ReplicationState {
        &self.state
    }

    /// Preceding pair resolved by the heartbeat loop (it owns the term
    /// cache).
    pub(crate) fn set_preceding(
        &mut self,
        index: u64,
        term: u64,
    ) {
        self.state.preceding_index = index;
        self.state.preceding_term = term;
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.state.next_index
    }

    /// True when the member fell behind the earliest retained entry and
    /// needs the compacted prefix instead of a batch.
    pub(crate) fn needs_snapshot(
        &self,
        first_log_index: u64,
    ) -> bool {
        first_log_index > 1 && self.state.next_index < first_log_index
    }

    /// Drives one round against this member.
    pub(crate) async fn run_round(
        &mut self,
        log: &Arc<ROF<T>>,
        transport: &Arc<TROF<T>>,
        round: &RoundSnapshot,
        backoff_step: u64,
        max_entries: u64,
    ) -> ReplicationOutcome {
        if self.needs_snapshot(log.first_entry_index()) {
            return self.install_snapshot(log, transport, round).await;
        }
        self.append_entries(log, transport, round, backoff_step, max_entries).await
    }

    async fn append_entries(
        &mut self,
        log: &Arc<ROF<T>>,
        transport: &Arc<TROF<T>>,
        round: &RoundSnapshot,
        backoff_step: u64,
        max_entries: u64,
    ) -> ReplicationOutcome {
        let member_id = self.peer.id;

        let entries = if self.state.next_index <= round.current_index {
            let from = self.state.next_index;
            let to = round.current_index.min(from + max_entries - 1);
            match log.entries_range(from..=to) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(member_id, ?e, "failed to read replication batch");
                    return ReplicationOutcome::Unreachable { member_id };
                }
            }
        } else {
            Vec::new()
        };
        let sent = entries.len() as u64;

        // A member that refused an apply gets the proposal again first.
        let apply_config = round.apply_config && self.state.config_synced;

        let request = AppendEntriesRequest {
            term: round.term,
            leader_id: round.leader_id,
            prev_log_index: self.state.preceding_index,
            prev_log_term: self.state.preceding_term,
            entries,
            commit_index: round.commit_index,
            config: round.config.clone(),
            apply_config,
        };

        trace!(
            member_id,
            prev = request.prev_log_index,
            sent,
            "replicator round"
        );

        let response = match transport.append_entries(self.peer.clone(), request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(member_id, ?e, "append entries undeliverable");
                return ReplicationOutcome::Unreachable { member_id };
            }
        };

        if response.term > round.term {
            return ReplicationOutcome::HigherTerm {
                member_id,
                term: response.term,
            };
        }

        if response.success {
            let confirmed = self.state.preceding_index + sent;
            self.state.match_index = self.state.match_index.max(confirmed);
            self.state.next_index = self.state.match_index + 1;
            self.state.config_synced = true;
            self.health.report_heartbeat();
            return ReplicationOutcome::Success {
                member_id,
                match_index: self.state.match_index,
                commit_ack: self.state.match_index >= round.current_index,
            };
        }

        match response.conflict {
            Some(AppendConflict::ConfigMismatch) => {
                self.state.config_synced = false;
                ReplicationOutcome::ConfigRejected { member_id }
            }
            _ => {
                let step = backoff_step.max(1);
                self.state.next_index = self.state.next_index.saturating_sub(step).max(1);
                debug!(
                    member_id,
                    next_index = self.state.next_index,
                    "log mismatch, backing off"
                );
                ReplicationOutcome::Rejected { member_id }
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        log: &Arc<ROF<T>>,
        transport: &Arc<TROF<T>>,
        round: &RoundSnapshot,
    ) -> ReplicationOutcome {
        let member_id = self.peer.id;
        let snapshot_index = log.first_entry_index();

        let snapshot = match log.entries_range(snapshot_index..=snapshot_index) {
            Ok(mut entries) if !entries.is_empty() => entries.remove(0),
            _ => {
                warn!(member_id, snapshot_index, "snapshot entry unavailable");
                return ReplicationOutcome::Unreachable { member_id };
            }
        };
        if !snapshot.is_snapshot {
            warn!(
                member_id,
                snapshot_index, "earliest retained entry is not a snapshot record"
            );
            return ReplicationOutcome::Unreachable { member_id };
        }

        let request = InstallSnapshotRequest {
            term: round.term,
            leader_id: round.leader_id,
            snapshot,
            snapshot_index,
        };

        debug!(member_id, snapshot_index, "installing snapshot");

        let response = match transport.install_snapshot(self.peer.clone(), request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(member_id, ?e, "snapshot undeliverable");
                return ReplicationOutcome::Unreachable { member_id };
            }
        };

        if response.term > round.term {
            return ReplicationOutcome::HigherTerm {
                member_id,
                term: response.term,
            };
        }

        if response.success {
            self.state.match_index = self.state.match_index.max(snapshot_index);
            self.state.next_index = self.state.match_index + 1;
            self.health.report_heartbeat();
            return ReplicationOutcome::Success {
                member_id,
                match_index: self.state.match_index,
                commit_ack: self.state.match_index >= round.current_index,
            };
        }

        ReplicationOutcome::SnapshotRefused { member_id }
    }
}

/// Builds the health record for a freshly tracked member.
pub(crate) fn new_member_health<T: TypeConfig>(
    config: &crate::config::FailureDetectorConfig,
) -> Arc<MemberHealth<T>> {
    Arc::new(MemberHealth::new(<FDOF<T> as FailureDetector>::new(config)))
}
