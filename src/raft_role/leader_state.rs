//! Leader role: heartbeat loop, commit quorum, lease renewal and
//! follower health sweeps.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::RoleKind;
use super::role_state::RoleState;
use crate::ClusterConfiguration;
use crate::ClusterEvent;
use crate::ConfigurationStorage;
use crate::LeaderLease;
use crate::Peer;
use crate::PersistentLog;
use crate::ReplicationQueue;
use crate::Result;
use crate::TypeConfig;
use crate::alias::CSOF;
use crate::alias::ROF;
use crate::cluster::ClusterInner;
use crate::config::FailureDetectorConfig;
use crate::membership::has_joint_quorum;
use crate::replication::MemberHealth;
use crate::replication::ReplicationOutcome;
use crate::replication::Replicator;
use crate::replication::RoundSnapshot;
use crate::replication::new_member_health;
use crate::term_cache::PrecedingTermCache;
use crate::timer::Timestamp;

type ReplicatorMap<T> = HashMap<u32, Arc<Mutex<Replicator<T>>>>;

/// Leader-scoped resources shared between the role value (accessed under
/// the transition lock) and the detached heartbeat loop.
pub(crate) struct LeaderHandles<T: TypeConfig> {
    pub term: u64,
    pub generation: u64,
    pub lease: Arc<LeaderLease>,
    pub leadership: CancellationToken,
    pub queue: Arc<ReplicationQueue>,
    pub replicators: Arc<RwLock<ReplicatorMap<T>>>,
    pub health: Arc<DashMap<u32, Arc<MemberHealth<T>>>>,
}

impl<T: TypeConfig> Clone for LeaderHandles<T> {
    fn clone(&self) -> Self {
        Self {
            term: self.term,
            generation: self.generation,
            lease: self.lease.clone(),
            leadership: self.leadership.clone(),
            queue: self.queue.clone(),
            replicators: self.replicators.clone(),
            health: self.health.clone(),
        }
    }
}

/// Leader node's state.
///
/// Replicators and the lease live for the duration of one leader term
/// and die with it.
pub struct LeaderState<T: TypeConfig> {
    generation: u64,
    term: u64,
    handles: LeaderHandles<T>,
}

impl<T: TypeConfig> LeaderState<T> {
    pub(crate) fn new(handles: LeaderHandles<T>) -> Self {
        info!(term = handles.term, "entering leader");
        Self {
            generation: handles.generation,
            term: handles.term,
            handles,
        }
    }

    pub(crate) fn term(&self) -> u64 {
        self.term
    }

    pub(crate) fn handles(&self) -> &LeaderHandles<T> {
        &self.handles
    }

    /// Cancels the leadership scope and fails all barrier waiters.
    pub(crate) fn shut_down(&mut self) {
        self.handles.leadership.cancel();
        self.handles.lease.destroy();
        self.handles.queue.shutdown();
    }
}

impl<T: TypeConfig> Drop for LeaderState<T> {
    fn drop(&mut self) {
        // Backstop for paths that replace the role without an explicit
        // shutdown; all three calls are idempotent.
        self.shut_down();
    }
}

impl<T: TypeConfig> RoleState for LeaderState<T> {
    type T = T;

    fn kind(&self) -> RoleKind {
        RoleKind::Leader
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn replication_queue(&self) -> Result<Arc<ReplicationQueue>> {
        Ok(self.handles.queue.clone())
    }

    fn lease(&self) -> Result<Arc<LeaderLease>> {
        Ok(self.handles.lease.clone())
    }

    fn leadership_token(&self) -> Result<CancellationToken> {
        Ok(self.handles.leadership.clone())
    }

    fn pinned_term(&self) -> Option<u64> {
        Some(self.term)
    }
}

impl<T: TypeConfig> std::fmt::Debug for LeaderState<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaderState")
            .field("generation", &self.generation)
            .field("term", &self.term)
            .finish()
    }
}

/// Outbound replication driver, one instance per leader term.
///
/// Each round: snapshot the leader state once, fork one task per tracked
/// member, gather outcomes through the completion channel, then derive
/// commit, configuration promotion, lease renewal and health verdicts
/// from the aggregate.
pub(crate) async fn heartbeat_loop<T: TypeConfig>(
    inner: Weak<ClusterInner<T>>,
    handles: LeaderHandles<T>,
) {
    let Some(cluster) = inner.upgrade() else {
        return;
    };
    let node_id = cluster.ctx.node_id;
    let log = cluster.ctx.log.clone();
    let transport = cluster.ctx.transport.clone();
    let config_storage = cluster.ctx.config_storage.clone();
    let node_config = cluster.ctx.node_config.clone();
    drop(cluster);

    let period = node_config.raft.heartbeat_period();
    let backoff_step = node_config.raft.replication.backoff_step;
    let max_entries = node_config.raft.replication.max_entries_per_round;
    let mut term_cache = PrecedingTermCache::default();

    debug!(term = handles.term, period_ms = period.as_millis() as u64, "heartbeat loop started");

    loop {
        if handles.leadership.is_cancelled() {
            break;
        }

        let round_start = Timestamp::now();
        // Waiters registered from here on observe the next round.
        handles.queue.switch_valve();

        let commit_index = log.last_committed_entry_index();
        let current_index = log.last_entry_index();
        let active = config_storage.active_configuration();
        let proposed = config_storage.proposed_configuration();
        let (config, apply_config) = match &proposed {
            Some(proposal) => (proposal.clone(), false),
            None => (active.clone(), true),
        };

        let members = sync_replicators(
            &handles,
            &active,
            proposed.as_ref(),
            node_id,
            current_index,
            &node_config.raft.failure_detector,
        );

        let round = RoundSnapshot {
            term: handles.term,
            leader_id: node_id,
            commit_index,
            current_index,
            config,
            apply_config,
        };

        let (tx, mut rx) = mpsc::channel::<ReplicationOutcome>(members.len().max(1));
        let mut forked = 0usize;
        {
            let replicators: Vec<_> = handles
                .replicators
                .read()
                .iter()
                .map(|(id, slot)| (*id, slot.clone()))
                .collect();
            for (member_id, slot) in replicators {
                let Ok(mut replicator) = slot.try_lock_owned() else {
                    // Previous request still in flight; per-member ordering wins
                    // over freshness.
                    trace!(member_id, "request in flight, skipping this round");
                    continue;
                };
                let preceding_index = replicator.next_index().saturating_sub(1);
                let preceding_term =
                    resolve_preceding_term::<T>(&mut term_cache, &log, preceding_index);
                replicator.set_preceding(preceding_index, preceding_term);

                let tx = tx.clone();
                let log = log.clone();
                let transport = transport.clone();
                let round = round.clone();
                tokio::spawn(async move {
                    let outcome = replicator
                        .run_round(&log, &transport, &round, backoff_step, max_entries)
                        .await;
                    let _ = tx.send(outcome).await;
                });
                forked += 1;
            }
        }
        drop(tx);

        // Self counts once in both tallies.
        let mut commit_acks = HashSet::from([node_id]);
        let mut responded = 1usize;
        let mut higher_term: Option<u64> = None;
        let mut received = 0usize;
        while received < forked {
            let outcome = tokio::select! {
                _ = handles.leadership.cancelled() => break,
                outcome = rx.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            received += 1;
            if outcome.is_response() {
                responded += 1;
            }
            match outcome {
                ReplicationOutcome::Success {
                    member_id,
                    commit_ack,
                    ..
                } => {
                    if commit_ack {
                        commit_acks.insert(member_id);
                    }
                    if let Some(cluster) = inner.upgrade() {
                        cluster.emit(ClusterEvent::ReplicationCompleted { member_id });
                    }
                }
                ReplicationOutcome::HigherTerm { member_id, term } => {
                    warn!(member_id, term, "member reported a higher term");
                    higher_term = Some(higher_term.map_or(term, |known| known.max(term)));
                }
                ReplicationOutcome::Rejected { .. }
                | ReplicationOutcome::ConfigRejected { .. }
                | ReplicationOutcome::SnapshotRefused { .. }
                | ReplicationOutcome::Unreachable { .. } => {}
            }
        }

        if handles.leadership.is_cancelled() {
            break;
        }

        if let Some(term) = higher_term {
            handles.queue.drain(false);
            let Some(cluster) = inner.upgrade() else {
                return;
            };
            cluster.step_down_to_term(handles.generation, term).await;
            break;
        }

        let quorum_reached = has_joint_quorum(&commit_acks, &active, proposed.as_ref());
        if quorum_reached {
            if current_index > commit_index {
                if let Err(e) = log.commit(current_index).await {
                    error!(?e, "commit through index {} failed", current_index);
                }
            }
            if proposed.is_some() {
                promote_configuration(&inner, &config_storage, &active).await;
            }
            handles.lease.renew(round_start);
        }
        trace!(
            responded,
            acks = commit_acks.len(),
            quorum_reached,
            "heartbeat round finished"
        );

        match inner.upgrade() {
            Some(cluster) => {
                cluster.last_heartbeat.refresh();
                sweep_unresponsive_members(&cluster, &handles, &members);
            }
            None => return,
        }

        handles.queue.drain(quorum_reached);

        tokio::select! {
            _ = handles.leadership.cancelled() => break,
            _ = tokio::time::sleep_until(round_start.as_instant() + period) => {}
            _ = handles.queue.triggered() => {}
        }
    }

    debug!(term = handles.term, "heartbeat loop exited");
}

/// Reconciles the replicator table with the current member set.
///
/// Returns the remote members of this round keyed by id.
fn sync_replicators<T: TypeConfig>(
    handles: &LeaderHandles<T>,
    active: &ClusterConfiguration,
    proposed: Option<&ClusterConfiguration>,
    node_id: u32,
    last_log_index: u64,
    detector_config: &FailureDetectorConfig,
) -> HashMap<u32, Peer> {
    let mut desired: HashMap<u32, Peer> = HashMap::new();
    for peer in active.peers(node_id) {
        if peer.is_remote {
            desired.insert(peer.id, peer);
        }
    }
    if let Some(proposal) = proposed {
        for peer in proposal.peers(node_id) {
            if peer.is_remote {
                desired.entry(peer.id).or_insert(peer);
            }
        }
    }

    let mut replicators = handles.replicators.write();
    replicators.retain(|id, _| desired.contains_key(id));
    handles.health.retain(|id, _| desired.contains_key(id));
    for (id, peer) in &desired {
        if !replicators.contains_key(id) {
            let health = new_member_health::<T>(detector_config);
            handles.health.insert(*id, health.clone());
            replicators.insert(
                *id,
                Arc::new(Mutex::new(Replicator::new(peer.clone(), last_log_index, health))),
            );
            debug!(member_id = *id, "tracking member for replication");
        }
    }
    desired
}

fn resolve_preceding_term<T: TypeConfig>(
    cache: &mut PrecedingTermCache,
    log: &Arc<ROF<T>>,
    preceding_index: u64,
) -> u64 {
    if preceding_index == 0 {
        return 0;
    }
    if let Some(term) = cache.get(preceding_index) {
        return term;
    }
    match log.term_of(preceding_index) {
        Some(term) => {
            cache.insert(preceding_index, term);
            term
        }
        // Below the earliest retained entry; the snapshot path takes over.
        None => 0,
    }
}

/// Promotes the proposed configuration after a joint-quorum round and
/// reports the membership delta.
async fn promote_configuration<T: TypeConfig>(
    inner: &Weak<ClusterInner<T>>,
    config_storage: &Arc<CSOF<T>>,
    old_active: &ClusterConfiguration,
) {
    let Some(proposed) = config_storage.proposed_configuration() else {
        return;
    };
    if let Err(e) = config_storage.apply().await {
        error!(?e, "configuration apply failed");
        return;
    }
    info!(
        members = proposed.len(),
        fingerprint = proposed.fingerprint(),
        "cluster configuration applied"
    );

    let Some(cluster) = inner.upgrade() else {
        return;
    };
    for member_id in proposed.member_ids() {
        if !old_active.contains(member_id) {
            cluster.emit(ClusterEvent::MemberAdded { member_id });
        }
    }
    for member_id in old_active.member_ids() {
        if !proposed.contains(member_id) {
            cluster.emit(ClusterEvent::MemberRemoved { member_id });
        }
    }
}

/// Reports members the failure detector has given up on. One report per
/// member per silence window; the claim flag re-arms on the next
/// successful heartbeat.
fn sweep_unresponsive_members<T: TypeConfig>(
    cluster: &Arc<ClusterInner<T>>,
    handles: &LeaderHandles<T>,
    members: &HashMap<u32, Peer>,
) {
    let Some(handler) = cluster.unavailable_handler() else {
        return;
    };
    for entry in handles.health.iter() {
        let member_id = *entry.key();
        let health = entry.value();
        if health.is_monitoring() && !health.is_healthy() && health.claim_eviction_slot() {
            if let Some(peer) = members.get(&member_id) {
                warn!(member_id, "member declared unavailable");
                handler(peer.clone(), handles.leadership.clone());
            }
        }
    }
}
