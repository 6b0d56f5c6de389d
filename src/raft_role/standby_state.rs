//! Standby role: replicate, never campaign.

use std::marker::PhantomData;

use tracing::trace;

use super::RoleKind;
use super::role_state::RoleState;
use crate::TypeConfig;

/// Passive member state.
///
/// A standby accepts log replication and snapshots but has no election
/// timer. Entered on start-up when the local member is unknown to the
/// configuration or standby mode is configured, and on `stop()`.
pub struct StandbyState<T: TypeConfig> {
    generation: u64,

    /// False once entered through `stop()`; a stopped node never leaves
    /// standby again
    resumable: bool,

    _marker: PhantomData<T>,
}

impl<T: TypeConfig> StandbyState<T> {
    pub fn new(
        generation: u64,
        resumable: bool,
    ) -> Self {
        trace!(generation, resumable, "entering standby");
        Self {
            generation,
            resumable,
            _marker: PhantomData,
        }
    }

    pub(crate) fn is_resumable(&self) -> bool {
        self.resumable
    }
}

impl<T: TypeConfig> RoleState for StandbyState<T> {
    type T = T;

    fn kind(&self) -> RoleKind {
        RoleKind::Standby
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: TypeConfig> std::fmt::Debug for StandbyState<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StandbyState")
            .field("generation", &self.generation)
            .field("resumable", &self.resumable)
            .finish()
    }
}
