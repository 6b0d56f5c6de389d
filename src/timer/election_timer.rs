//! Randomized election timeout sampling.

use std::time::Duration;

use rand::Rng;

use super::Timestamp;

/// Samples a fresh timeout on every reset, uniform over the configured
/// range, so colliding candidacies stay unlikely.
#[derive(Clone, Debug)]
pub struct ElectionTimer {
    deadline: Timestamp,
    current_timeout: Duration,
    timeout_range: (u64, u64),
}

impl ElectionTimer {
    /// `timeout_range` is `(election_timeout_min, election_timeout_max)`
    /// in milliseconds.
    pub fn new(timeout_range: (u64, u64)) -> Self {
        let current_timeout = Self::random_timeout(timeout_range);
        Self {
            deadline: Timestamp::now().saturating_add(current_timeout),
            current_timeout,
            timeout_range,
        }
    }

    /// Re-samples the timeout and pushes the deadline out from now.
    pub fn reset(&mut self) {
        self.current_timeout = Self::random_timeout(self.timeout_range);
        self.deadline = Timestamp::now().saturating_add(self.current_timeout);
    }

    /// Pushes the deadline out from now, keeping the sampled timeout.
    pub fn refresh(&mut self) {
        self.deadline = Timestamp::now().saturating_add(self.current_timeout);
    }

    pub fn next_deadline(&self) -> Timestamp {
        self.deadline
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn is_expired(&self) -> bool {
        self.deadline <= Timestamp::now()
    }

    fn random_timeout((min, max): (u64, u64)) -> Duration {
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }
}
