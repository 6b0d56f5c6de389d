//! Cluster controller: role transitions, inbound RPC handlers and the
//! public node API.
//!
//! Every transition and every handler except `pre_vote` runs under the
//! transition lock, a single async mutex around the live role value.
//! Deferred work (timers, campaigns, the heartbeat loop) re-validates the
//! role generation under the lock before acting, so late callbacks
//! against a dead role are dropped.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::AppendEntriesRequest;
use crate::AppendEntriesResponse;
use crate::CancellationOrigin;
use crate::ClusterConfiguration;
use crate::ClusterEvent;
use crate::ConfigurationStorage;
use crate::ConsensusError;
use crate::ElectionError;
use crate::Error;
use crate::InstallSnapshotRequest;
use crate::InstallSnapshotResponse;
use crate::LeaderLease;
use crate::LogEntry;
use crate::MembershipError;
use crate::NodeConfig;
use crate::Peer;
use crate::PersistentLog;
use crate::PreVoteRequest;
use crate::PreVoteResponse;
use crate::PreVoteVerdict;
use crate::RaftContext;
use crate::ReplicationError;
use crate::ReplicationQueue;
use crate::Result;
use crate::StateTransitionError;
use crate::SynchronizeRequest;
use crate::SynchronizeResponse;
use crate::Transport;
use crate::TypeConfig;
use crate::UnavailableMemberHandler;
use crate::VoteRequest;
use crate::VoteResponse;
use crate::alias::CSOF;
use crate::alias::ROF;
use crate::alias::TROF;
use crate::membership::majority_count;
use crate::raft_role::RaftRole;
use crate::raft_role::RoleKind;
use crate::raft_role::candidate_state::CandidateState;
use crate::raft_role::follower_state::FollowerState;
use crate::raft_role::leader_state::LeaderHandles;
use crate::raft_role::leader_state::LeaderState;
use crate::raft_role::leader_state::heartbeat_loop;
use crate::raft_role::role_state::RoleState;
use crate::raft_role::standby_state::StandbyState;
use crate::replication::await_barrier;
use crate::timer::AtomicTimestamp;
use crate::timer::ElectionTimer;
use crate::timer::Timestamp;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Replicated cluster node.
///
/// Construct with the adapter set, register callbacks, then `start()`.
/// Clones share one node through the inner `Arc`.
pub struct RaftCluster<T: TypeConfig> {
    inner: Arc<ClusterInner<T>>,
}

impl<T: TypeConfig> Clone for RaftCluster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct ClusterInner<T: TypeConfig> {
    pub(crate) ctx: RaftContext<T>,

    /// The transition lock. Guards the live role value; serializes role
    /// changes with inbound RPCs.
    pub(crate) transition: Mutex<RaftRole<T>>,

    /// Handle to self for detached tasks, set at construction
    self_ref: Weak<ClusterInner<T>>,

    /// Monotone role instance counter, bumped on every transition
    generation_counter: AtomicU64,

    /// Role discriminant mirror for the lock-free pre-vote handler
    role_kind: AtomicU8,

    /// Believed leader, 0 when unknown
    leader_id: AtomicU32,

    /// Last valid leader contact
    pub(crate) last_heartbeat: AtomicTimestamp,

    /// Timeout sampled by the current follower incarnation, milliseconds
    election_timeout_millis: AtomicU64,

    /// Canceled once on `stop()`; parents every role-scoped token
    pub(crate) lifecycle: CancellationToken,

    leader_watch: watch::Sender<Option<u32>>,
    readiness: watch::Sender<bool>,
    events: broadcast::Sender<ClusterEvent>,
    unavailable_handler: RwLock<Option<Arc<UnavailableMemberHandler>>>,
}

impl<T: TypeConfig> RaftCluster<T> {
    pub fn new(
        log: Arc<ROF<T>>,
        transport: Arc<TROF<T>>,
        config_storage: Arc<CSOF<T>>,
        node_config: Arc<NodeConfig>,
    ) -> Result<Self> {
        node_config.validate()?;
        let node_id = node_config.cluster.node_id;
        let election_floor = node_config.raft.election.election_timeout_min;
        let (leader_watch, _) = watch::channel(None);
        let (readiness, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak| ClusterInner {
            ctx: RaftContext {
                node_id,
                log,
                transport,
                config_storage,
                node_config,
            },
            transition: Mutex::new(RaftRole::Standby(Box::new(StandbyState::new(0, false)))),
            self_ref: weak.clone(),
            generation_counter: AtomicU64::new(0),
            role_kind: AtomicU8::new(RoleKind::Standby as u8),
            leader_id: AtomicU32::new(0),
            last_heartbeat: AtomicTimestamp::never(),
            election_timeout_millis: AtomicU64::new(election_floor),
            lifecycle: CancellationToken::new(),
            leader_watch,
            readiness,
            events,
            unavailable_handler: RwLock::new(None),
        });
        Ok(Self { inner })
    }

    /// Registers the out-of-band eviction callback. The core itself
    /// never removes members.
    pub fn on_unavailable_member(
        &self,
        handler: Arc<UnavailableMemberHandler>,
    ) {
        *self.inner.unavailable_handler.write() = Some(handler);
    }

    // --- Lifecycle ----------------------------------------------------------

    /// Initializes the node and enters Follower, or Standby when the
    /// local member is unknown to the configuration or standby mode is
    /// configured. Completes the readiness watch.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.lifecycle.is_cancelled() {
            return Err(StateTransitionError::InvalidTransition.into());
        }

        let mut role = inner.transition.lock().await;
        if *inner.readiness.borrow() {
            return Err(StateTransitionError::InvalidTransition.into());
        }

        // Seed the configuration storage on first boot.
        let mut active = inner.ctx.config_storage.active_configuration();
        if active.is_empty() {
            let initial = inner.ctx.node_config.initial_configuration();
            if !initial.is_empty() {
                inner.ctx.config_storage.propose(initial).await?;
                inner.ctx.config_storage.apply().await?;
                active = inner.ctx.config_storage.active_configuration();
            }
        }

        let node_id = inner.ctx.node_id;
        if active.contains(node_id) && !inner.ctx.node_config.cluster.standby {
            inner.move_to_follower(&mut role, None);
            info!(
                node_id,
                term = inner.ctx.log.current_term(),
                "node started as follower"
            );
        } else {
            let generation = inner.next_generation();
            *role = RaftRole::Standby(Box::new(StandbyState::new(generation, true)));
            inner.set_role_kind(RoleKind::Standby);
            info!(node_id, "node started in standby");
        }
        drop(role);

        let _ = inner.readiness.send(true);
        Ok(())
    }

    /// Cancels the lifecycle scope, aborts outbound requests and parks
    /// the node in non-resumable standby.
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!(node_id = inner.ctx.node_id, "stopping node");
        inner.lifecycle.cancel();

        for peer in inner.member_peers() {
            if peer.is_remote {
                let _ = inner.ctx.transport.cancel_pending_requests(peer).await;
            }
        }

        let mut role = inner.transition.lock().await;
        role.shut_down();
        let generation = inner.next_generation();
        *role = RaftRole::Standby(Box::new(StandbyState::new(generation, false)));
        inner.set_role_kind(RoleKind::Standby);
        drop(role);

        inner.set_leader(None);
        let _ = inner.readiness.send(false);
    }

    // --- Public API ---------------------------------------------------------

    /// Appends a command locally, forces replication and waits for
    /// commit.
    ///
    /// # Returns
    /// `true` when the entry survived in the leader's term. `false`
    /// means leadership moved before commit; the caller must retry
    /// against the new leader.
    pub async fn replicate(
        &self,
        payload: Bytes,
        command_id: Option<u32>,
    ) -> Result<bool> {
        let inner = &self.inner;
        let (term, index, queue) = {
            let role = inner.transition.lock().await;
            let RaftRole::Leader(leader) = &*role else {
                return Err(ReplicationError::NotLeader.into());
            };
            let term = leader.term();
            let next = inner.ctx.log.last_entry_index() + 1;
            let entry = LogEntry::new(term, next, payload, command_id);
            let index = inner.ctx.log.append(entry).await?;
            (term, index, leader.handles().queue.clone())
        };

        trace!(index, term, "entry appended, awaiting replication round");

        // The barrier outcome is advisory here: even after a quorum-less
        // round the entry may still commit later, so the definitive wait
        // is on the commit index itself.
        let barrier = queue.enqueue();
        let _ = tokio::select! {
            _ = inner.lifecycle.cancelled() => {
                return Err(Error::Canceled { origin: CancellationOrigin::Lifecycle });
            }
            outcome = await_barrier(barrier) => outcome,
        };

        tokio::select! {
            _ = inner.lifecycle.cancelled() => {
                Err(Error::Canceled { origin: CancellationOrigin::Lifecycle })
            }
            waited = inner.ctx.log.wait_for_commit(index) => {
                waited?;
                Ok(inner.ctx.log.term_of(index) == Some(term))
            }
        }
    }

    /// Wakes the heartbeat loop and resolves once the next full round
    /// completed with quorum.
    pub async fn force_replication(&self) -> Result<()> {
        let queue = self.inner.leader_queue().await?;
        self.inner.await_round(queue).await
    }

    /// Linearizable read barrier.
    ///
    /// On the leader a valid lease answers immediately; otherwise a full
    /// heartbeat round is forced. On a follower the known leader is
    /// asked via `synchronize` and the local log must catch up to the
    /// leader's committed index.
    pub async fn apply_read_barrier(&self) -> Result<()> {
        let inner = &self.inner;

        enum Route {
            LocalLeader(Arc<ReplicationQueue>),
            ThroughLeader(Peer),
        }

        let route = {
            let role = inner.transition.lock().await;
            match &*role {
                RaftRole::Leader(leader) => {
                    if leader.handles().lease.is_valid() {
                        trace!("read barrier served from lease");
                        return Ok(());
                    }
                    Route::LocalLeader(leader.handles().queue.clone())
                }
                _ => match inner.leader_peer() {
                    Some(peer) => Route::ThroughLeader(peer),
                    None => return Err(ReplicationError::LeaderUnavailable.into()),
                },
            }
        };

        match route {
            Route::LocalLeader(queue) => inner.await_round(queue).await,
            Route::ThroughLeader(leader) => {
                let request = SynchronizeRequest {
                    follower_id: inner.ctx.node_id,
                    commit_index: inner.ctx.log.last_committed_entry_index(),
                };
                let response = inner.ctx.transport.synchronize(leader, request).await?;
                match response.commit_index {
                    None => Err(ReplicationError::LeaderUnavailable.into()),
                    Some(target) => {
                        trace!(target, "waiting for local log to reach leader commit");
                        inner.ctx.log.wait_for_commit(target).await
                    }
                }
            }
        }
    }

    /// Awaits the election of any leader.
    pub async fn wait_for_leader(
        &self,
        timeout: Duration,
    ) -> Result<u32> {
        let mut watch = self.inner.leader_watch.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if let Some(leader) = *watch.borrow_and_update() {
                    return Some(leader);
                }
                if watch.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        match waited {
            Ok(Some(leader)) => Ok(leader),
            _ => Err(ReplicationError::LeaderUnavailable.into()),
        }
    }

    /// Gives up leadership. A non-leader forwards the request to the
    /// believed leader.
    ///
    /// # Returns
    /// `true` when some node actually stepped down.
    pub async fn resign(&self) -> Result<bool> {
        let inner = &self.inner;
        {
            let mut role = inner.transition.lock().await;
            if role.is_leader() {
                info!("resigning leadership");
                inner.move_to_follower(&mut role, None);
                drop(role);
                inner.set_leader(None);
                return Ok(true);
            }
        }
        match inner.leader_peer() {
            Some(leader) if leader.is_remote => inner.ctx.transport.resign(leader).await,
            _ => Ok(false),
        }
    }

    /// Parks a follower in resumable standby.
    pub async fn enable_standby_mode(&self) -> Result<()> {
        let inner = &self.inner;
        let mut role = inner.transition.lock().await;
        if matches!(&*role, RaftRole::Standby(state) if state.is_resumable()) {
            return Ok(());
        }
        if !role.is_follower() {
            return Err(StateTransitionError::InvalidTransition.into());
        }

        role.shut_down();
        let generation = inner.next_generation();
        *role = RaftRole::Standby(Box::new(StandbyState::new(generation, true)));
        inner.set_role_kind(RoleKind::Standby);
        info!("standby mode enabled");
        Ok(())
    }

    /// Proposes a new member table; the heartbeat loop propagates it and
    /// promotes it once a joint quorum acknowledged. Leader only, one
    /// change at a time.
    pub async fn propose_configuration(
        &self,
        configuration: ClusterConfiguration,
    ) -> Result<()> {
        let inner = &self.inner;
        let role = inner.transition.lock().await;
        let queue = role.state().replication_queue()?;
        if inner.ctx.config_storage.proposed_configuration().is_some() {
            return Err(MembershipError::ProposalPending.into());
        }
        info!(
            members = configuration.len(),
            fingerprint = configuration.fingerprint(),
            "proposing cluster configuration"
        );
        inner.ctx.config_storage.propose(configuration).await?;
        drop(role);

        // Start propagation without waiting for the next period.
        queue.trigger();
        Ok(())
    }

    /// Current member table, the union of active and proposed entries.
    pub fn members(&self) -> Vec<Peer> {
        self.inner.member_peers()
    }

    /// Returns a resumable standby to normal follower duty.
    pub async fn revert_to_normal_mode(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.lifecycle.is_cancelled() {
            return Err(StateTransitionError::InvalidTransition.into());
        }
        let mut role = inner.transition.lock().await;
        if role.is_follower() {
            return Ok(());
        }
        if !matches!(&*role, RaftRole::Standby(state) if state.is_resumable()) {
            return Err(StateTransitionError::InvalidTransition.into());
        }

        inner.move_to_follower(&mut role, None);
        info!("standby mode left, serving as follower");
        Ok(())
    }

    // --- Observability ------------------------------------------------------

    pub fn current_term(&self) -> u64 {
        self.inner.ctx.log.current_term()
    }

    pub fn role(&self) -> RoleKind {
        self.inner.role_kind()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.role_kind() == RoleKind::Leader
    }

    pub fn leader_id(&self) -> Option<u32> {
        match self.inner.leader_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.inner.ctx.node_id
    }

    /// Lease deadline while leader, `None` otherwise.
    pub async fn lease_deadline(&self) -> Option<Timestamp> {
        let role = self.inner.transition.lock().await;
        match &*role {
            RaftRole::Leader(leader) => leader.handles().lease.deadline(),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    pub fn leader_watch(&self) -> watch::Receiver<Option<u32>> {
        self.inner.leader_watch.subscribe()
    }

    /// Resolves once the node is serving.
    pub async fn wait_ready(&self) {
        let mut readiness = self.inner.readiness.subscribe();
        while !*readiness.borrow_and_update() {
            if readiness.changed().await.is_err() {
                return;
            }
        }
    }

    // --- Peer-facing handlers ----------------------------------------------

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.inner.handle_append_entries(request).await
    }

    pub async fn vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        self.inner.handle_vote(request).await
    }

    /// Read-only; runs outside the transition lock.
    pub async fn pre_vote(
        &self,
        request: PreVoteRequest,
    ) -> Result<PreVoteResponse> {
        Ok(self.inner.handle_pre_vote(request))
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.inner.handle_install_snapshot(request).await
    }

    pub async fn synchronize(
        &self,
        request: SynchronizeRequest,
    ) -> Result<SynchronizeResponse> {
        self.inner.handle_synchronize(request).await
    }

    /// Peer-facing resignation request.
    pub async fn handle_resign(&self) -> Result<bool> {
        let inner = &self.inner;
        let mut role = inner.transition.lock().await;
        if role.is_leader() {
            info!("stepping down on resign request");
            inner.move_to_follower(&mut role, None);
            drop(role);
            inner.set_leader(None);
            return Ok(true);
        }
        Ok(false)
    }
}

impl<T: TypeConfig> ClusterInner<T> {
    // --- Shared infrastructure ---------------------------------------------

    fn weak(&self) -> Weak<ClusterInner<T>> {
        self.self_ref.clone()
    }

    pub(crate) fn emit(
        &self,
        event: ClusterEvent,
    ) {
        // Send fails only without subscribers, which is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn unavailable_handler(&self) -> Option<Arc<UnavailableMemberHandler>> {
        self.unavailable_handler.read().clone()
    }

    fn next_generation(&self) -> u64 {
        self.generation_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn role_kind(&self) -> RoleKind {
        RoleKind::from_u8(self.role_kind.load(Ordering::Acquire))
    }

    fn set_role_kind(
        &self,
        kind: RoleKind,
    ) {
        self.role_kind.store(kind as u8, Ordering::Release);
    }

    fn set_leader(
        &self,
        new_leader: Option<u32>,
    ) {
        let old_raw = self.leader_id.swap(new_leader.unwrap_or(0), Ordering::AcqRel);
        let old_leader = (old_raw != 0).then_some(old_raw);
        if old_leader != new_leader {
            debug!(?old_leader, ?new_leader, "leader changed");
            let _ = self.leader_watch.send_replace(new_leader);
            self.emit(ClusterEvent::LeaderChanged {
                old_leader,
                new_leader,
            });
        }
    }

    /// Members of the active and proposed configurations, local included.
    pub(crate) fn member_peers(&self) -> Vec<Peer> {
        let mut merged: BTreeMap<u32, Peer> = BTreeMap::new();
        for peer in self
            .ctx
            .config_storage
            .active_configuration()
            .peers(self.ctx.node_id)
        {
            merged.insert(peer.id, peer);
        }
        if let Some(proposed) = self.ctx.config_storage.proposed_configuration() {
            for peer in proposed.peers(self.ctx.node_id) {
                merged.entry(peer.id).or_insert(peer);
            }
        }
        merged.into_values().collect()
    }

    fn leader_peer(&self) -> Option<Peer> {
        let leader_id = match self.leader_id.load(Ordering::Acquire) {
            0 => return None,
            id => id,
        };
        self.member_peers().into_iter().find(|peer| peer.id == leader_id)
    }

    async fn leader_queue(&self) -> Result<Arc<ReplicationQueue>> {
        let role = self.transition.lock().await;
        role.state().replication_queue()
    }

    /// Joins the next heartbeat round and maps a quorum miss to
    /// `LeaderUnavailable`.
    async fn await_round(
        &self,
        queue: Arc<ReplicationQueue>,
    ) -> Result<()> {
        let barrier = queue.enqueue();
        let committed = tokio::select! {
            _ = self.lifecycle.cancelled() => {
                return Err(Error::Canceled { origin: CancellationOrigin::Lifecycle });
            }
            outcome = await_barrier(barrier) => outcome?,
        };
        if committed {
            Ok(())
        } else {
            Err(ReplicationError::LeaderUnavailable.into())
        }
    }

    // --- Transitions (all called under the transition lock) ----------------

    pub(crate) fn move_to_follower(
        &self,
        role: &mut RaftRole<T>,
        leader_hint: Option<u32>,
    ) {
        role.shut_down();
        let generation = self.next_generation();
        let follower =
            FollowerState::new(generation, self.ctx.node_config.raft.election.timeout_range());
        self.election_timeout_millis
            .store(follower.current_timeout_millis(), Ordering::Release);
        let deadline_cell = follower.deadline_cell();
        *role = RaftRole::Follower(Box::new(follower));
        self.set_role_kind(RoleKind::Follower);
        if leader_hint.is_some() {
            self.set_leader(leader_hint);
        }
        spawn_follower_timer(self.weak(), generation, deadline_cell, self.lifecycle.clone());
    }

    fn move_to_candidate(
        &self,
        role: &mut RaftRole<T>,
        term: u64,
    ) {
        role.shut_down();
        let generation = self.next_generation();
        *role = RaftRole::Candidate(Box::new(CandidateState::new(generation, term)));
        self.set_role_kind(RoleKind::Candidate);
        self.set_leader(None);
        info!(term, "campaigning for leadership");
        tokio::spawn(run_campaign(self.weak(), generation, term));
    }

    /// Leader step-down driven by an observed higher term.
    pub(crate) async fn step_down_to_term(
        &self,
        observed_generation: u64,
        new_term: u64,
    ) {
        let mut role = self.transition.lock().await;
        if role.generation() != observed_generation {
            trace!(
                observed_generation,
                current = role.generation(),
                "stale step-down dropped"
            );
            return;
        }
        if self.ctx.log.current_term() < new_term {
            if let Err(e) = self.ctx.log.update_term(new_term).await {
                error!(?e, "term persistence failed during step-down");
            }
        }
        warn!(new_term, from = role.kind().name(), "stepping down to follower");
        self.move_to_follower(&mut role, None);
        drop(role);
        self.set_leader(None);
    }

    /// Candidate-to-leader promotion after a vote majority.
    async fn promote_to_leader(
        &self,
        observed_generation: u64,
        term: u64,
    ) {
        let mut role = self.transition.lock().await;
        let valid = matches!(
            &*role,
            RaftRole::Candidate(candidate)
                if candidate.generation() == observed_generation && candidate.term() == term
        );
        if !valid || self.ctx.log.current_term() != term {
            debug!(term, "stale promotion dropped");
            return;
        }

        // The no-op entry anchors commit progress and lease validity in
        // the new term.
        if let Err(e) = self.ctx.log.append_no_op_entry(term).await {
            error!(?e, "no-op append failed, aborting promotion");
            return;
        }

        let raft = &self.ctx.node_config.raft;
        let handles = LeaderHandles {
            term,
            generation: self.next_generation(),
            lease: Arc::new(LeaderLease::new(
                raft.election.min_timeout(),
                raft.clock_drift_bound,
            )),
            leadership: self.lifecycle.child_token(),
            queue: Arc::new(ReplicationQueue::new()),
            replicators: Arc::new(RwLock::new(HashMap::new())),
            health: Arc::new(DashMap::new()),
        };
        *role = RaftRole::Leader(Box::new(LeaderState::new(handles.clone())));
        self.set_role_kind(RoleKind::Leader);
        drop(role);

        self.set_leader(Some(self.ctx.node_id));
        tokio::spawn(heartbeat_loop(self.weak(), handles));
    }

    // --- Election machinery -------------------------------------------------

    /// Follower expiry entry point, called by the detached timer task.
    ///
    /// # Returns
    /// `true` when the timer task should exit (transitioned or stale).
    async fn on_election_timeout(
        &self,
        generation: u64,
    ) -> bool {
        {
            let role = self.transition.lock().await;
            match &*role {
                RaftRole::Follower(follower) if follower.generation() == generation => {
                    if follower.is_suppressed() || !follower.is_expired() {
                        return false;
                    }
                }
                _ => return true,
            }
        }

        // The poll runs without the lock; only the decision to campaign
        // re-acquires it.
        let polled_term = self.ctx.log.current_term();
        let poll = self.run_pre_vote(polled_term).await;
        if self.lifecycle.is_cancelled() {
            return true;
        }

        if let Err(e) = poll {
            debug!(?e, "pre-vote poll failed, staying follower");
            let mut role = self.transition.lock().await;
            if let RaftRole::Follower(follower) = &mut *role {
                if follower.generation() == generation {
                    follower.resample_timer();
                    self.election_timeout_millis
                        .store(follower.current_timeout_millis(), Ordering::Release);
                }
            }
            return false;
        }

        let mut role = self.transition.lock().await;
        match &mut *role {
            RaftRole::Follower(follower) if follower.generation() == generation => {
                if !follower.is_expired() || follower.is_suppressed() {
                    // A leader resurfaced while polling.
                    return false;
                }
                if self.ctx.log.current_term() != polled_term {
                    follower.resample_timer();
                    return false;
                }
            }
            _ => return true,
        }

        let new_term = match self.ctx.log.increment_term(self.ctx.node_id).await {
            Ok(term) => term,
            Err(e) => {
                error!(?e, "term increment failed, staying follower");
                return false;
            }
        };
        self.move_to_candidate(&mut role, new_term);
        true
    }

    /// Pre-vote poll across all members. Approval requires a strictly
    /// positive tally; a leader veto kills the candidacy outright.
    async fn run_pre_vote(
        &self,
        current_term: u64,
    ) -> Result<()> {
        let (last_log_index, last_log_term) = last_log_ids(&self.ctx.log);
        let request = PreVoteRequest {
            next_term: current_term + 1,
            candidate_id: self.ctx.node_id,
            last_log_index,
            last_log_term,
        };

        let members = self.member_peers();
        if members.is_empty() {
            return Err(ElectionError::NoVotingMemberFound {
                candidate_id: self.ctx.node_id,
            }
            .into());
        }

        let polls = members.into_iter().map(|peer| {
            let transport = self.ctx.transport.clone();
            async move { transport.pre_vote(peer, request).await }
        });
        let responses = tokio::select! {
            _ = self.lifecycle.cancelled() => {
                return Err(Error::Canceled { origin: CancellationOrigin::Lifecycle });
            }
            responses = join_all(polls) => responses,
        };

        let mut tally: i64 = 0;
        for response in responses {
            match response {
                Ok(poll) => match poll.verdict {
                    PreVoteVerdict::Accepted => tally += 1,
                    PreVoteVerdict::RejectedByFollower => tally -= 1,
                    PreVoteVerdict::RejectedByLeader => {
                        debug!(node = poll.node_id, "pre-vote vetoed by the leader");
                        return Err(ElectionError::PreVoteRejected { tally: i64::MIN }.into());
                    }
                },
                Err(_) => tally -= 1,
            }
        }
        debug!(tally, next_term = request.next_term, "pre-vote round finished");
        if tally > 0 {
            Ok(())
        } else {
            Err(ElectionError::PreVoteRejected { tally }.into())
        }
    }

    // --- Inbound RPC handlers ----------------------------------------------

    pub(crate) async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node_id = self.ctx.node_id;
        let mut role = self.transition.lock().await;

        let my_term = self.ctx.log.current_term();
        if my_term > request.term {
            trace!(
                sender_term = request.term,
                my_term, "rejecting stale append entries"
            );
            return Ok(AppendEntriesResponse::higher_term(node_id, my_term));
        }

        self.last_heartbeat.refresh();
        if request.term > my_term {
            self.ctx.log.update_term(request.term).await?;
        }

        match role.kind() {
            RoleKind::Leader if request.term == my_term => {
                // Two leaders in one term cannot happen; refuse and let
                // the anomaly surface on the sender.
                error!(
                    sender = request.leader_id,
                    term = my_term,
                    "append entries from a same-term leader"
                );
                return Ok(AppendEntriesResponse::higher_term(node_id, my_term));
            }
            RoleKind::Leader | RoleKind::Candidate => {
                self.move_to_follower(&mut role, Some(request.leader_id));
            }
            RoleKind::Follower => role.state_mut().refresh_deadline(),
            RoleKind::Standby => {}
        }
        self.set_leader(Some(request.leader_id));

        let my_term = self.ctx.log.current_term();
        if !self.ctx.log.contains(request.prev_log_index, request.prev_log_term) {
            debug!(
                prev_index = request.prev_log_index,
                prev_term = request.prev_log_term,
                "log mismatch"
            );
            return Ok(AppendEntriesResponse::log_mismatch(node_id, my_term));
        }

        let is_heartbeat = request.is_heartbeat();

        // Expiry actions are deferred while the batch lands locally.
        if let RaftRole::Follower(follower) = &mut *role {
            follower.begin_suppression();
        }
        let appended = self.append_and_commit(&request).await;
        if let RaftRole::Follower(follower) = &mut *role {
            follower.end_suppression();
            follower.refresh_deadline();
        }
        appended?;

        if !self.reconcile_configuration(&request).await? {
            return Ok(AppendEntriesResponse::config_mismatch(node_id, my_term));
        }

        if is_heartbeat {
            self.emit(ClusterEvent::ReplicationCompleted { member_id: node_id });

            // An empty round from a live leader unfreezes a cold-started
            // standby into follower duty.
            let frozen = matches!(&*role, RaftRole::Standby(standby) if standby.is_resumable());
            if frozen && !self.ctx.node_config.cluster.standby {
                info!("caught up with the leader, leaving standby");
                self.move_to_follower(&mut role, Some(request.leader_id));
            }
        }

        Ok(AppendEntriesResponse::success(node_id, my_term))
    }

    async fn append_and_commit(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<()> {
        if request.entries.is_empty() {
            let target = request.commit_index.min(self.ctx.log.last_entry_index());
            if target > self.ctx.log.last_committed_entry_index() {
                self.ctx.log.commit(target).await?;
            }
            return Ok(());
        }
        // Already-committed entries may arrive again after a failed
        // round; the log skips them. Commit clamps to the local tail.
        self.ctx
            .log
            .append_and_commit(
                request.entries.clone(),
                request.prev_log_index + 1,
                true,
                request.commit_index,
            )
            .await
    }

    /// Follower side of configuration propagation.
    ///
    /// # Returns
    /// `false` when the request asked to apply a configuration this node
    /// does not hold; the leader must resend the proposal.
    async fn reconcile_configuration(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<bool> {
        let storage = &self.ctx.config_storage;
        let local_fingerprint = storage
            .proposed_configuration()
            .map(|cfg| cfg.fingerprint())
            .unwrap_or_else(|| storage.active_configuration().fingerprint());
        let remote_fingerprint = request.config.fingerprint();

        if local_fingerprint == remote_fingerprint {
            if request.apply_config {
                let old_active = storage.active_configuration();
                storage.apply().await?;
                let active = storage.active_configuration();
                if active != old_active {
                    info!(
                        members = active.len(),
                        "applied configuration from the leader"
                    );
                    for member_id in active.member_ids() {
                        if !old_active.contains(member_id) {
                            self.emit(ClusterEvent::MemberAdded { member_id });
                        }
                    }
                    for member_id in old_active.member_ids() {
                        if !active.contains(member_id) {
                            self.emit(ClusterEvent::MemberRemoved { member_id });
                        }
                    }
                }
            }
            Ok(true)
        } else if request.apply_config {
            warn!(
                local_fingerprint,
                remote_fingerprint, "cannot apply an unknown configuration"
            );
            Ok(false)
        } else {
            debug!(remote_fingerprint, "proposing configuration from the leader");
            storage.propose(request.config.clone()).await?;
            Ok(true)
        }
    }

    pub(crate) async fn handle_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        let node_id = self.ctx.node_id;
        let mut role = self.transition.lock().await;
        let my_term = self.ctx.log.current_term();

        if request.term < my_term {
            return Ok(VoteResponse {
                node_id,
                term: my_term,
                vote_granted: false,
            });
        }

        // Leader stickiness: an unknown sender cannot disrupt a cluster
        // that still hears its leader.
        let candidate_known = self
            .member_peers()
            .iter()
            .any(|peer| peer.id == request.candidate_id);
        let election_floor =
            Duration::from_millis(self.ctx.node_config.raft.election.election_timeout_min);
        if !candidate_known && self.last_heartbeat.elapsed() < election_floor {
            debug!(
                candidate = request.candidate_id,
                "vote denied to an unknown candidate while the leader is live"
            );
            return Ok(VoteResponse {
                node_id,
                term: my_term,
                vote_granted: false,
            });
        }

        if request.term > my_term {
            self.ctx.log.update_term(request.term).await?;
            self.last_heartbeat.refresh();
            self.set_leader(None);
            if matches!(&*role, RaftRole::Leader(_) | RaftRole::Candidate(_)) {
                self.move_to_follower(&mut role, None);
            }
        }

        let my_term = self.ctx.log.current_term();
        let granted = self.ctx.log.is_voted_for(request.candidate_id)
            && self
                .ctx
                .log
                .is_up_to_date(request.last_log_index, request.last_log_term);
        if granted {
            self.ctx.log.update_voted_for(request.candidate_id).await?;
            role.state_mut().refresh_deadline();
            debug!(
                candidate = request.candidate_id,
                term = my_term,
                "vote granted"
            );
        } else {
            trace!(
                candidate = request.candidate_id,
                term = my_term,
                "vote denied"
            );
        }

        Ok(VoteResponse {
            node_id,
            term: my_term,
            vote_granted: granted,
        })
    }

    /// Pre-vote responder. Never mutates term or vote, never takes the
    /// transition lock; everything it needs is mirrored in atomics.
    pub(crate) fn handle_pre_vote(
        &self,
        request: PreVoteRequest,
    ) -> PreVoteResponse {
        let node_id = self.ctx.node_id;
        let term = self.ctx.log.current_term();

        let verdict = if self.role_kind() == RoleKind::Leader
            && self.ctx.node_config.raft.aggressive_leader_stickiness
        {
            PreVoteVerdict::RejectedByLeader
        } else {
            let timeout =
                Duration::from_millis(self.election_timeout_millis.load(Ordering::Acquire));
            if self.last_heartbeat.elapsed() <= timeout {
                PreVoteVerdict::RejectedByFollower
            } else if !self
                .ctx
                .log
                .is_up_to_date(request.last_log_index, request.last_log_term)
            {
                PreVoteVerdict::RejectedByFollower
            } else {
                PreVoteVerdict::Accepted
            }
        };

        trace!(
            candidate = request.candidate_id,
            next_term = request.next_term,
            ?verdict,
            "pre-vote answered"
        );
        PreVoteResponse {
            node_id,
            term,
            verdict,
        }
    }

    pub(crate) async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node_id = self.ctx.node_id;
        let mut role = self.transition.lock().await;
        let my_term = self.ctx.log.current_term();

        if request.term < my_term {
            return Ok(InstallSnapshotResponse {
                node_id,
                term: my_term,
                success: false,
            });
        }
        let committed = self.ctx.log.last_committed_entry_index();
        if request.snapshot_index <= committed {
            debug!(
                snapshot_index = request.snapshot_index,
                committed, "snapshot does not cover the committed prefix"
            );
            return Ok(InstallSnapshotResponse {
                node_id,
                term: my_term,
                success: false,
            });
        }

        self.last_heartbeat.refresh();
        if request.term > my_term {
            self.ctx.log.update_term(request.term).await?;
        }
        match role.kind() {
            RoleKind::Leader | RoleKind::Candidate => {
                self.move_to_follower(&mut role, Some(request.leader_id));
            }
            RoleKind::Follower => role.state_mut().refresh_deadline(),
            RoleKind::Standby => {}
        }
        self.set_leader(Some(request.leader_id));

        let my_term = self.ctx.log.current_term();
        info!(
            snapshot_index = request.snapshot_index,
            "installing snapshot from the leader"
        );
        self.ctx
            .log
            .append_snapshot(request.snapshot.clone(), request.snapshot_index)
            .await?;

        if let RaftRole::Follower(follower) = &mut *role {
            follower.refresh_deadline();
        }

        Ok(InstallSnapshotResponse {
            node_id,
            term: my_term,
            success: true,
        })
    }

    pub(crate) async fn handle_synchronize(
        &self,
        request: SynchronizeRequest,
    ) -> Result<SynchronizeResponse> {
        let (queue, term) = {
            let role = self.transition.lock().await;
            let term = self.ctx.log.current_term();
            match &*role {
                RaftRole::Leader(leader) => (Some(leader.handles().queue.clone()), term),
                _ => (None, term),
            }
        };

        let Some(queue) = queue else {
            return Ok(SynchronizeResponse {
                term,
                commit_index: None,
            });
        };

        // A current follower gets a fresh round so the index it waits
        // for reflects confirmed leadership.
        if request.commit_index >= self.ctx.log.last_committed_entry_index() {
            self.await_round(queue).await?;
        }

        Ok(SynchronizeResponse {
            term,
            commit_index: Some(self.ctx.log.last_committed_entry_index()),
        })
    }
}

// --- Detached tasks ---------------------------------------------------------

/// Follower election timer.
///
/// Owns nothing but a weak handle, the deadline cell and the generation
/// it was armed for; any transition invalidates it on the next firing.
fn spawn_follower_timer<T: TypeConfig>(
    inner: Weak<ClusterInner<T>>,
    generation: u64,
    deadline: Arc<AtomicTimestamp>,
    lifecycle: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            if lifecycle.is_cancelled() {
                return;
            }
            let target = deadline.load();
            if Timestamp::now() < target {
                tokio::select! {
                    _ = lifecycle.cancelled() => return,
                    _ = tokio::time::sleep_until(target.as_instant()) => {}
                }
                // The deadline may have moved while sleeping.
                continue;
            }
            let Some(cluster) = inner.upgrade() else {
                return;
            };
            if cluster.on_election_timeout(generation).await {
                return;
            }
        }
    });
}

/// Candidate campaign: vote fan-out with per-round timeouts, repeated at
/// fresh terms until won, superseded or canceled.
async fn run_campaign<T: TypeConfig>(
    inner: Weak<ClusterInner<T>>,
    generation: u64,
    mut term: u64,
) {
    loop {
        let Some(cluster) = inner.upgrade() else {
            return;
        };
        if cluster.lifecycle.is_cancelled() {
            return;
        }

        match request_votes(&cluster, term).await {
            Ok(granted) => {
                info!(term, granted, "vote majority reached");
                cluster.promote_to_leader(generation, term).await;
                return;
            }
            Err(Error::Consensus(ConsensusError::Election(ElectionError::HigherTerm(
                observed,
            )))) => {
                cluster.step_down_to_term(generation, observed).await;
                return;
            }
            Err(e) => {
                debug!(term, ?e, "election round lost");
            }
        }

        // Back off a randomized timeout, then campaign at the next term.
        let timeout_range = cluster.ctx.node_config.raft.election.timeout_range();
        let backoff = ElectionTimer::new(timeout_range).current_timeout();
        tokio::select! {
            _ = cluster.lifecycle.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        let mut role = cluster.transition.lock().await;
        match &mut *role {
            RaftRole::Candidate(candidate) if candidate.generation() == generation => {
                match cluster.ctx.log.increment_term(cluster.ctx.node_id).await {
                    Ok(next_term) => {
                        term = next_term;
                        candidate.restart_at(next_term);
                        debug!(term, "election restarted");
                    }
                    Err(e) => {
                        error!(?e, "term increment failed, abandoning campaign");
                        return;
                    }
                }
            }
            _ => return,
        }
    }
}

/// One vote round.
///
/// # Returns
/// The granted count on majority, `ElectionError::HigherTerm` when a
/// responder is ahead, `ElectionError::QuorumFailure` otherwise.
async fn request_votes<T: TypeConfig>(
    cluster: &Arc<ClusterInner<T>>,
    term: u64,
) -> Result<usize> {
    let node_id = cluster.ctx.node_id;
    let transport = cluster.ctx.transport.clone();
    let members = cluster.member_peers();
    if members.is_empty() {
        return Err(ElectionError::NoVotingMemberFound {
            candidate_id: node_id,
        }
        .into());
    }
    let timeout_range = cluster.ctx.node_config.raft.election.timeout_range();
    let (last_log_index, last_log_term) = last_log_ids(&cluster.ctx.log);

    let request = VoteRequest {
        term,
        candidate_id: node_id,
        last_log_index,
        last_log_term,
    };
    let round_timeout = ElectionTimer::new(timeout_range).current_timeout();
    let required = majority_count(members.len());

    debug!(term, members = members.len(), "requesting votes");
    let ballots = members.into_iter().map(|peer| {
        let transport = transport.clone();
        async move { tokio::time::timeout(round_timeout, transport.vote(peer, request)).await }
    });
    let responses = join_all(ballots).await;

    let mut granted = 0usize;
    let mut higher_term: Option<u64> = None;
    for response in responses {
        match response {
            Ok(Ok(ballot)) => {
                if ballot.term > term {
                    higher_term =
                        Some(higher_term.map_or(ballot.term, |known| known.max(ballot.term)));
                }
                if ballot.vote_granted {
                    granted += 1;
                }
            }
            // Timeouts and transport failures count against.
            _ => {}
        }
    }

    if let Some(observed) = higher_term {
        return Err(ElectionError::HigherTerm(observed).into());
    }
    if granted >= required {
        Ok(granted)
    } else {
        Err(ElectionError::QuorumFailure { granted, required }.into())
    }
}

pub(crate) fn last_log_ids<L: PersistentLog>(log: &Arc<L>) -> (u64, u64) {
    let last_index = log.last_entry_index();
    let last_term = log.term_of(last_index).unwrap_or(0);
    (last_index, last_term)
}
