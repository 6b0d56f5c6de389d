//! Reference `PersistentLog` kept entirely in memory.
//!
//! Honors the full adapter contract including conflict truncation,
//! snapshot prefix replacement and commit waiters, minus durability.

use std::ops::RangeInclusive;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::LogEntry;
use crate::NetworkError;
use crate::PersistentLog;
use crate::Result;
use crate::StorageError;
use crate::is_candidate_log_current;

#[derive(Debug, Default)]
struct LogState {
    term: u64,
    voted_for: Option<u32>,
    entries: Vec<LogEntry>,
    /// Index of `entries[0]`; meaningful only when entries exist
    first_index: u64,
    committed: u64,
}

impl LogState {
    fn last_index(&self) -> u64 {
        if self.entries.is_empty() {
            0
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    fn position(
        &self,
        index: u64,
    ) -> Option<usize> {
        if self.entries.is_empty() || index < self.first_index || index > self.last_index() {
            None
        } else {
            Some((index - self.first_index) as usize)
        }
    }

    /// Replaces the prefix up to `snapshot_index` with the snapshot
    /// record, keeping any consistent suffix.
    fn install_snapshot_record(
        &mut self,
        mut snapshot: LogEntry,
        snapshot_index: u64,
    ) {
        snapshot.index = snapshot_index;
        snapshot.is_snapshot = true;

        let suffix = match self.position(snapshot_index + 1) {
            Some(pos) if self.last_index() > snapshot_index => self.entries.split_off(pos),
            _ => Vec::new(),
        };
        self.entries = Vec::with_capacity(1 + suffix.len());
        self.entries.push(snapshot);
        self.entries.extend(suffix);
        self.first_index = snapshot_index;
        self.committed = self.committed.max(snapshot_index);
    }
}

pub struct InMemoryLog {
    state: Mutex<LogState>,
    commit_watch: watch::Sender<u64>,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        let (commit_watch, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            commit_watch,
        }
    }

    /// Compacts the committed prefix up to `up_to` into a snapshot
    /// record, the way a state-machine snapshotter would.
    pub fn compact(
        &self,
        up_to: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if up_to > state.committed {
            return Err(StorageError::LogStorage(format!(
                "cannot compact uncommitted index {up_to}"
            ))
            .into());
        }
        let Some(pos) = state.position(up_to) else {
            return Err(StorageError::IndexOutOfRange {
                first: state.first_index,
                last: state.last_index(),
                index: up_to,
            }
            .into());
        };
        let term = state.entries[pos].term;
        state.install_snapshot_record(LogEntry::snapshot(term, up_to, Bytes::new()), up_to);
        Ok(())
    }

    fn publish_commit(
        &self,
        committed: u64,
    ) {
        self.commit_watch.send_modify(|current| *current = (*current).max(committed));
    }
}

#[async_trait]
impl PersistentLog for InMemoryLog {
    fn current_term(&self) -> u64 {
        self.state.lock().term
    }

    async fn update_term(
        &self,
        term: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if term > state.term {
            state.term = term;
            state.voted_for = None;
        }
        Ok(())
    }

    async fn increment_term(
        &self,
        local_member_id: u32,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        state.term += 1;
        state.voted_for = Some(local_member_id);
        Ok(state.term)
    }

    fn is_voted_for(
        &self,
        candidate_id: u32,
    ) -> bool {
        self.state
            .lock()
            .voted_for
            .map_or(true, |voted| voted == candidate_id)
    }

    fn voted_for(&self) -> Option<u32> {
        self.state.lock().voted_for
    }

    async fn update_voted_for(
        &self,
        candidate_id: u32,
    ) -> Result<()> {
        self.state.lock().voted_for = Some(candidate_id);
        Ok(())
    }

    fn first_entry_index(&self) -> u64 {
        let state = self.state.lock();
        if state.entries.is_empty() {
            0
        } else {
            state.first_index
        }
    }

    fn last_entry_index(&self) -> u64 {
        self.state.lock().last_index()
    }

    fn last_committed_entry_index(&self) -> u64 {
        self.state.lock().committed
    }

    fn term_of(
        &self,
        index: u64,
    ) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        let state = self.state.lock();
        state.position(index).map(|pos| state.entries[pos].term)
    }

    fn contains(
        &self,
        index: u64,
        term: u64,
    ) -> bool {
        self.term_of(index) == Some(term)
    }

    fn is_up_to_date(
        &self,
        last_index: u64,
        last_term: u64,
    ) -> bool {
        let state = self.state.lock();
        let my_last = state.last_index();
        let my_term = if my_last == 0 {
            0
        } else {
            state.position(my_last).map(|pos| state.entries[pos].term).unwrap_or(0)
        };
        drop(state);
        is_candidate_log_current(my_last, my_term, last_index, last_term)
    }

    fn entries_range(
        &self,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        if state.entries.is_empty() {
            return Ok(Vec::new());
        }
        let start = *range.start();
        let end = (*range.end()).min(state.last_index());
        if start > end {
            return Ok(Vec::new());
        }
        if start < state.first_index {
            return Err(StorageError::IndexOutOfRange {
                first: state.first_index,
                last: state.last_index(),
                index: start,
            }
            .into());
        }
        let from = state.position(start).expect("bounds checked");
        let to = state.position(end).expect("bounds checked");
        Ok(state.entries[from..=to].to_vec())
    }

    async fn append(
        &self,
        mut entry: LogEntry,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let index = state.last_index() + 1;
        entry.index = index;
        if state.entries.is_empty() {
            state.first_index = index;
        }
        state.entries.push(entry);
        Ok(index)
    }

    async fn append_entries(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let mut expected = start_index;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::LogStorage(format!(
                    "non-contiguous batch: expected index {expected}, got {}",
                    entry.index
                ))
                .into());
            }
            expected += 1;

            if skip_committed && entry.index <= state.committed {
                continue;
            }

            match state.position(entry.index) {
                Some(pos) => {
                    if state.entries[pos].term != entry.term {
                        if entry.index <= state.committed {
                            return Err(StorageError::LogStorage(format!(
                                "refusing to rewrite committed index {}",
                                entry.index
                            ))
                            .into());
                        }
                        // Conflicting uncommitted suffix goes away.
                        state.entries.truncate(pos);
                        state.entries.push(entry);
                    }
                }
                None => {
                    let last = state.last_index();
                    if state.entries.is_empty() {
                        state.first_index = entry.index;
                        state.entries.push(entry);
                    } else if entry.index == last + 1 {
                        state.entries.push(entry);
                    } else {
                        return Err(StorageError::LogStorage(format!(
                            "gap: last index {last}, appending {}",
                            entry.index
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn append_snapshot(
        &self,
        snapshot: LogEntry,
        snapshot_index: u64,
    ) -> Result<()> {
        let committed = {
            let mut state = self.state.lock();
            state.install_snapshot_record(snapshot, snapshot_index);
            state.committed
        };
        self.publish_commit(committed);
        Ok(())
    }

    async fn append_and_commit(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
        commit_index: u64,
    ) -> Result<()> {
        self.append_entries(entries, start_index, skip_committed).await?;
        self.commit(commit_index).await?;
        Ok(())
    }

    async fn commit(
        &self,
        up_to: u64,
    ) -> Result<u64> {
        let (target, count) = {
            let mut state = self.state.lock();
            let target = up_to.min(state.last_index());
            if target <= state.committed {
                return Ok(0);
            }
            let count = target - state.committed;
            state.committed = target;
            (target, count)
        };
        // Waiters wake strictly after the commit index is recorded.
        self.publish_commit(target);
        Ok(count)
    }

    async fn wait_for_commit(
        &self,
        index: u64,
    ) -> Result<()> {
        let mut watcher = self.commit_watch.subscribe();
        loop {
            if *watcher.borrow_and_update() >= index {
                return Ok(());
            }
            if watcher.changed().await.is_err() {
                return Err(NetworkError::SignalReceiveFailed(
                    "log dropped while waiting for commit".into(),
                )
                .into());
            }
        }
    }

    async fn append_no_op_entry(
        &self,
        term: u64,
    ) -> Result<u64> {
        self.append(LogEntry::no_op(term, 0)).await
    }
}

#[cfg(test)]
mod in_memory_log_test {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn entry(
        term: u64,
        index: u64,
    ) -> LogEntry {
        LogEntry::new(term, index, Bytes::from_static(b"payload"), None)
    }

    /// Stored term never decreases and a term change clears the vote.
    #[tokio::test]
    async fn test_term_is_monotone_and_clears_vote() {
        let log = InMemoryLog::new();
        log.update_term(5).await.expect("update");
        log.update_voted_for(2).await.expect("vote");

        log.update_term(3).await.expect("stale update ignored");
        assert_eq!(log.current_term(), 5);
        assert_eq!(log.voted_for(), Some(2));

        log.update_term(6).await.expect("update");
        assert_eq!(log.current_term(), 6);
        assert_eq!(log.voted_for(), None, "vote cleared on term change");
    }

    #[tokio::test]
    async fn test_increment_term_votes_for_self() {
        let log = InMemoryLog::new();
        let term = log.increment_term(7).await.expect("increment");
        assert_eq!(term, 1);
        assert_eq!(log.voted_for(), Some(7));
        assert!(log.is_voted_for(7));
        assert!(!log.is_voted_for(8));
    }

    #[tokio::test]
    async fn test_conflicting_suffix_is_truncated() {
        let log = InMemoryLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2), entry(1, 3)], 1, true)
            .await
            .expect("append");

        // A new leader overwrites index 2 with a higher-term entry.
        log.append_entries(vec![entry(2, 2)], 2, true).await.expect("append");

        assert_eq!(log.last_entry_index(), 2, "old index 3 discarded");
        assert_eq!(log.term_of(2), Some(2));
        assert!(log.contains(1, 1));
    }

    #[tokio::test]
    async fn test_committed_entries_cannot_be_rewritten() {
        let log = InMemoryLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2)], 1, true)
            .await
            .expect("append");
        log.commit(2).await.expect("commit");

        let conflicting = log.append_entries(vec![entry(9, 2)], 2, false).await;
        assert!(conflicting.is_err(), "rewrite of committed index must fail");

        // The resend of already-committed entries is skipped silently.
        log.append_entries(vec![entry(1, 2)], 2, true).await.expect("resend ok");
        assert_eq!(log.term_of(2), Some(1));
    }

    #[tokio::test]
    async fn test_commit_wakes_waiters_after_recording() {
        let log = std::sync::Arc::new(InMemoryLog::new());
        log.append_entries(vec![entry(1, 1)], 1, true).await.expect("append");

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move {
                log.wait_for_commit(1).await.expect("wait");
                log.last_committed_entry_index()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter must block until commit");

        let committed = log.commit(1).await.expect("commit");
        assert_eq!(committed, 1);
        let observed = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter completes")
            .expect("task");
        assert!(observed >= 1, "commit recorded before waiters woke");
    }

    #[tokio::test]
    async fn test_snapshot_replaces_prefix() {
        let log = InMemoryLog::new();
        log.append_entries(
            vec![entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)],
            1,
            true,
        )
        .await
        .expect("append");
        log.commit(4).await.expect("commit");

        log.compact(3).expect("compact");

        assert_eq!(log.first_entry_index(), 3);
        assert_eq!(log.last_entry_index(), 4);
        assert_eq!(log.term_of(3), Some(2), "snapshot record keeps its term");
        assert_eq!(log.term_of(1), None, "compacted prefix is gone");

        let record = log.entries_range(3..=3).expect("range");
        assert!(record[0].is_snapshot);
    }

    #[tokio::test]
    async fn test_snapshot_install_on_stale_follower() {
        let log = InMemoryLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2)], 1, true)
            .await
            .expect("append");

        let snapshot = LogEntry::snapshot(4, 0, Bytes::from_static(b"state"));
        log.append_snapshot(snapshot, 100).await.expect("install");

        assert_eq!(log.first_entry_index(), 100);
        assert_eq!(log.last_entry_index(), 100);
        assert_eq!(log.last_committed_entry_index(), 100);
        assert!(log.contains(100, 4));
    }

    #[tokio::test]
    async fn test_entries_range_clamps_and_rejects_compacted() {
        let log = InMemoryLog::new();
        log.append_entries(vec![entry(1, 1), entry(1, 2), entry(1, 3)], 1, true)
            .await
            .expect("append");
        log.commit(3).await.expect("commit");

        let tail = log.entries_range(2..=9).expect("clamped");
        assert_eq!(tail.len(), 2);

        log.compact(2).expect("compact");
        assert!(log.entries_range(1..=3).is_err(), "below first retained index");
    }
}
