//! Follower role: watch for heartbeats, campaign when they stop.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use super::RoleKind;
use super::role_state::RoleState;
use crate::TypeConfig;
use crate::timer::AtomicTimestamp;
use crate::timer::ElectionTimer;
use crate::timer::Timestamp;

/// Follower node's state.
///
/// The deadline lives in a shared atomic cell so the detached timer task
/// observes refreshes without taking the transition lock.
pub struct FollowerState<T: TypeConfig> {
    generation: u64,

    /// Randomized timeout sampler
    timer: ElectionTimer,

    /// Deadline mirror read by the timer task
    deadline_cell: Arc<AtomicTimestamp>,

    /// While positive, expiry actions are deferred. Incremented around
    /// local batch processing.
    suppress_transitions: u32,

    _marker: PhantomData<T>,
}

impl<T: TypeConfig> FollowerState<T> {
    pub fn new(
        generation: u64,
        timeout_range: (u64, u64),
    ) -> Self {
        let timer = ElectionTimer::new(timeout_range);
        let deadline_cell = Arc::new(AtomicTimestamp::now());
        deadline_cell.store(timer.next_deadline());
        trace!(
            generation,
            timeout_ms = timer.current_timeout().as_millis() as u64,
            "entering follower"
        );
        Self {
            generation,
            timer,
            deadline_cell,
            suppress_transitions: 0,
            _marker: PhantomData,
        }
    }

    /// Cell shared with the detached timer task.
    pub(crate) fn deadline_cell(&self) -> Arc<AtomicTimestamp> {
        self.deadline_cell.clone()
    }

    /// Sampled timeout for this follower incarnation, milliseconds.
    pub(crate) fn current_timeout_millis(&self) -> u64 {
        self.timer.current_timeout().as_millis() as u64
    }

    /// Re-samples the timeout, used after a failed pre-vote so the next
    /// attempt does not collide with other expired followers.
    pub(crate) fn resample_timer(&mut self) {
        self.timer.reset();
        self.deadline_cell.store(self.timer.next_deadline());
    }

    pub(crate) fn begin_suppression(&mut self) {
        self.suppress_transitions += 1;
    }

    pub(crate) fn end_suppression(&mut self) {
        self.suppress_transitions = self.suppress_transitions.saturating_sub(1);
    }

    pub(crate) fn is_suppressed(&self) -> bool {
        self.suppress_transitions > 0
    }
}

impl<T: TypeConfig> RoleState for FollowerState<T> {
    type T = T;

    fn kind(&self) -> RoleKind {
        RoleKind::Follower
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn refresh_deadline(&mut self) {
        self.timer.refresh();
        self.deadline_cell.store(self.timer.next_deadline());
    }

    fn is_expired(&self) -> bool {
        self.timer.is_expired()
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        Some(self.timer.next_deadline())
    }
}

impl<T: TypeConfig> std::fmt::Debug for FollowerState<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FollowerState")
            .field("generation", &self.generation)
            .field("deadline", &self.timer.next_deadline())
            .field("suppress_transitions", &self.suppress_transitions)
            .finish()
    }
}
