//! Monotonic timestamps with atomic refresh.
//!
//! Readings are millisecond offsets from a process-wide monotonic anchor,
//! which makes them storable in an `AtomicU64`. Handlers refresh the
//! "last heartbeat" marker without taking any lock.

use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// A monotonic reading, comparable and cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(anchor().elapsed().as_millis() as u64)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since this reading, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(Timestamp::now().0.saturating_sub(self.0))
    }

    pub fn saturating_add(
        &self,
        duration: Duration,
    ) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// Duration until this reading, zero if it already passed.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(Timestamp::now().0))
    }

    /// The tokio instant this reading corresponds to.
    pub fn as_instant(&self) -> Instant {
        anchor() + Duration::from_millis(self.0)
    }
}

/// Lock-free refreshable timestamp cell.
///
/// A zero reading is the "never refreshed" sentinel: `elapsed()` reports
/// the maximum duration for it, so staleness checks treat a cell that
/// was never touched as infinitely old.
#[derive(Debug)]
pub struct AtomicTimestamp(AtomicU64);

impl AtomicTimestamp {
    pub fn now() -> Self {
        Self(AtomicU64::new(Timestamp::now().millis()))
    }

    /// Cell that reads as never refreshed.
    pub fn never() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> Timestamp {
        Timestamp::from_millis(self.0.load(Ordering::Acquire))
    }

    pub fn store(
        &self,
        value: Timestamp,
    ) {
        self.0.store(value.millis(), Ordering::Release);
    }

    /// Moves the cell to the current reading.
    pub fn refresh(&self) {
        self.store(Timestamp::now());
    }

    /// Monotone store: never moves the cell backwards.
    pub fn advance_to(
        &self,
        value: Timestamp,
    ) {
        self.0.fetch_max(value.millis(), Ordering::AcqRel);
    }

    pub fn elapsed(&self) -> Duration {
        match self.0.load(Ordering::Acquire) {
            0 => Duration::MAX,
            millis => Timestamp::from_millis(millis).elapsed(),
        }
    }
}
