//! Leader lease for locally served linearizable reads.
//!
//! The deadline only ever moves forward and is derived from the start of
//! a heartbeat round, never from its end: the guarantee must cover the
//! moment the quorum was solicited, not the moment responses arrived.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::timer::Timestamp;

/// Monotone lease deadline shared between the heartbeat loop (writer)
/// and read paths (readers). A zeroed deadline means no lease.
#[derive(Debug)]
pub struct LeaderLease {
    deadline_millis: AtomicU64,
    duration: Duration,
}

impl LeaderLease {
    /// Lease window: `election_timeout_min / clock_drift_bound`.
    ///
    /// Dividing by the drift bound keeps the lease inside the window in
    /// which no other member can win an election, even on a clock
    /// running fast by that factor.
    pub fn new(
        election_timeout_min: Duration,
        clock_drift_bound: f64,
    ) -> Self {
        let bounded = clock_drift_bound.max(1.0);
        let duration =
            Duration::from_millis((election_timeout_min.as_millis() as f64 / bounded) as u64);
        Self {
            deadline_millis: AtomicU64::new(0),
            duration,
        }
    }

    /// Renews the lease from a round start reading. Never moves the
    /// deadline backwards.
    pub fn renew(
        &self,
        round_start: Timestamp,
    ) {
        let new_deadline = round_start.saturating_add(self.duration).millis();
        self.deadline_millis.fetch_max(new_deadline, Ordering::AcqRel);
    }

    pub fn is_valid(&self) -> bool {
        let deadline = self.deadline_millis.load(Ordering::Acquire);
        deadline != 0 && Timestamp::now().millis() < deadline
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        match self.deadline_millis.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Timestamp::from_millis(millis)),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Invalidates the lease on step-down.
    pub fn destroy(&self) {
        self.deadline_millis.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod lease_test {
    use super::*;

    #[test]
    fn test_lease_invalid_until_renewed() {
        let lease = LeaderLease::new(Duration::from_millis(150), 2.0);
        assert!(!lease.is_valid());
        assert!(lease.deadline().is_none());

        lease.renew(Timestamp::now());
        assert!(lease.is_valid());
    }

    #[test]
    fn test_lease_duration_divided_by_drift_bound() {
        let lease = LeaderLease::new(Duration::from_millis(300), 2.0);
        assert_eq!(lease.duration(), Duration::from_millis(150));

        // Bounds below 1.0 are clamped rather than extending the lease.
        let clamped = LeaderLease::new(Duration::from_millis(300), 0.5);
        assert_eq!(clamped.duration(), Duration::from_millis(300));
    }

    #[test]
    fn test_renew_never_moves_deadline_backwards() {
        let lease = LeaderLease::new(Duration::from_millis(200), 1.0);
        let later_round = Timestamp::now().saturating_add(Duration::from_millis(500));
        lease.renew(later_round);
        let deadline = lease.deadline().expect("deadline set");

        lease.renew(Timestamp::from_millis(0));
        assert_eq!(lease.deadline(), Some(deadline));
    }

    #[test]
    fn test_destroy_invalidates() {
        let lease = LeaderLease::new(Duration::from_millis(150), 1.0);
        lease.renew(Timestamp::now());
        assert!(lease.is_valid());

        lease.destroy();
        assert!(!lease.is_valid());
        assert!(lease.deadline().is_none());
    }

    #[test]
    fn test_expired_deadline_is_invalid() {
        let lease = LeaderLease::new(Duration::from_millis(50), 1.0);
        // A round that started long ago yields an already-expired lease.
        lease.renew(Timestamp::from_millis(1));
        assert!(!lease.is_valid());
    }
}
