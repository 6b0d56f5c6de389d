//! Candidate role: a campaign pinned to the term it was started at.

use std::marker::PhantomData;

use tracing::trace;

use super::RoleKind;
use super::role_state::RoleState;
use crate::TypeConfig;

/// Candidate node's volatile state.
///
/// The vote fan-out runs in a detached task; this value only records the
/// campaign identity so late continuations can be matched against it.
pub struct CandidateState<T: TypeConfig> {
    generation: u64,

    /// Term the campaign runs at; bumped in place on election restart
    term: u64,

    _marker: PhantomData<T>,
}

impl<T: TypeConfig> CandidateState<T> {
    pub fn new(
        generation: u64,
        term: u64,
    ) -> Self {
        trace!(generation, term, "entering candidate");
        Self {
            generation,
            term,
            _marker: PhantomData,
        }
    }

    pub(crate) fn term(&self) -> u64 {
        self.term
    }

    /// Election restart keeps the candidate instance and moves the
    /// campaign to a fresh term.
    pub(crate) fn restart_at(
        &mut self,
        term: u64,
    ) {
        self.term = term;
    }
}

impl<T: TypeConfig> RoleState for CandidateState<T> {
    type T = T;

    fn kind(&self) -> RoleKind {
        RoleKind::Candidate
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn pinned_term(&self) -> Option<u64> {
        Some(self.term)
    }
}

impl<T: TypeConfig> std::fmt::Debug for CandidateState<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CandidateState")
            .field("generation", &self.generation)
            .field("term", &self.term)
            .finish()
    }
}
