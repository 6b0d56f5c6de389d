//! PersistentLog trait with explicit safety contracts.
//!
//! The consensus core is the single writer of this log. Implementers MUST
//! uphold the documented invariants, otherwise the protocol guarantees
//! (log matching, leader completeness, state machine safety) do not hold.
//!
//! Durability contract: `update_term`, `increment_term` and
//! `update_voted_for` MUST be durable before returning. Entry appends MAY
//! buffer, but an implementation that acknowledges an append and then
//! loses the entry across a restart breaks the protocol.

use std::ops::RangeInclusive;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

use crate::LogEntry;
use crate::Result;

#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait PersistentLog: Send + Sync + 'static {
    // =========================================================================
    // PERSISTENT TERM AND VOTE STATE
    // =========================================================================

    /// Latest term this node has seen.
    ///
    /// # Safety Invariants
    /// - MUST be monotonically non-decreasing across the process lifetime
    ///   and across restarts
    fn current_term(&self) -> u64;

    /// Durably records a new term and clears the vote.
    ///
    /// # Safety Invariants
    /// - MUST reject (or ignore) values below the stored term
    /// - The vote reset and the term write MUST be atomic
    async fn update_term(
        &self,
        term: u64,
    ) -> Result<()>;

    /// Durably increments the term and votes for the local member.
    ///
    /// Used when a follower promotes itself to candidate. Combining the
    /// two writes keeps the single-vote invariant under crash recovery.
    ///
    /// # Returns
    /// The new term value.
    async fn increment_term(
        &self,
        local_member_id: u32,
    ) -> Result<u64>;

    /// True when no vote has been cast this term, or the vote already
    /// went to `candidate_id`.
    fn is_voted_for(
        &self,
        candidate_id: u32,
    ) -> bool;

    /// Candidate that received this node's vote in the current term.
    fn voted_for(&self) -> Option<u32>;

    /// Durably records a vote for `candidate_id` in the current term.
    ///
    /// # Safety Invariants
    /// - At most one distinct value may ever be persisted per term
    async fn update_voted_for(
        &self,
        candidate_id: u32,
    ) -> Result<()>;

    // =========================================================================
    // READ OPERATIONS
    // =========================================================================

    /// Earliest retained log index. Grows when a snapshot replaces the
    /// prefix. `0` for an empty log.
    fn first_entry_index(&self) -> u64;

    /// Largest appended index, `0` for an empty log.
    fn last_entry_index(&self) -> u64;

    /// Largest committed index.
    ///
    /// # Safety Invariants
    /// - MUST be `<= last_entry_index()`
    /// - MUST be monotonically non-decreasing
    fn last_committed_entry_index(&self) -> u64;

    /// Term of the entry at `index`, `None` when outside the retained
    /// range. Index `0` always resolves to term `0`.
    fn term_of(
        &self,
        index: u64,
    ) -> Option<u64>;

    /// True when the log holds an entry at `index` with exactly `term`.
    ///
    /// The pair `(0, 0)` denotes the empty prefix and MUST return true.
    /// An index covered by a snapshot matches when the snapshot record
    /// carries `term`.
    fn contains(
        &self,
        index: u64,
        term: u64,
    ) -> bool;

    /// Raft up-to-date comparison (Section 5.4.1): a higher last term
    /// wins, on equal terms the longer log wins.
    fn is_up_to_date(
        &self,
        last_index: u64,
        last_term: u64,
    ) -> bool;

    /// Contiguous range of entries for replication reads.
    ///
    /// # Safety Invariants
    /// - Returned entries MUST be ordered by index without gaps
    fn entries_range(
        &self,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<LogEntry>>;

    // =========================================================================
    // WRITE OPERATIONS
    // =========================================================================

    /// Appends a single entry at `last_entry_index() + 1`.
    ///
    /// # Returns
    /// The index assigned to the entry.
    async fn append(
        &self,
        entry: LogEntry,
    ) -> Result<u64>;

    /// Appends `entries` starting at `start_index`.
    ///
    /// Conflicting uncommitted suffixes are truncated first. With
    /// `skip_committed`, entries at or below the committed index are
    /// dropped silently; the leader may resend them after a failed round.
    ///
    /// # Safety Invariants
    /// - MUST NOT rewrite a committed entry with a different term
    async fn append_entries(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
    ) -> Result<()>;

    /// Atomically replaces the prefix up to `snapshot_index` with the
    /// snapshot record and marks it committed.
    async fn append_snapshot(
        &self,
        snapshot: LogEntry,
        snapshot_index: u64,
    ) -> Result<()>;

    /// Append followed by a commit up to `commit_index`, as one call so
    /// followers apply a replication batch without an extra round trip.
    async fn append_and_commit(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
        commit_index: u64,
    ) -> Result<()>;

    /// Commits all entries up to `up_to`.
    ///
    /// # Returns
    /// The number of newly committed entries.
    ///
    /// # Safety Invariants
    /// - Commit waiters MUST be released strictly after the commit index
    ///   is recorded
    async fn commit(
        &self,
        up_to: u64,
    ) -> Result<u64>;

    /// Resolves once `index` is committed.
    async fn wait_for_commit(
        &self,
        index: u64,
    ) -> Result<()>;

    /// Appends the empty marker entry a fresh leader writes in its own
    /// term to anchor commit progress.
    ///
    /// # Returns
    /// The index assigned to the marker.
    async fn append_no_op_entry(
        &self,
        term: u64,
    ) -> Result<u64>;
}
