//! Consensus tuning parameters.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use super::ensure;
use crate::Result;

/// Configuration parameters for the consensus protocol.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RaftConfig {
    /// Election timing parameters
    #[serde(default)]
    pub election: ElectionConfig,

    /// Log replication parameters
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Follower liveness estimation parameters
    #[serde(default)]
    pub failure_detector: FailureDetectorConfig,

    /// Heartbeat period as a fraction of the minimum election timeout,
    /// in `(0, 1]`
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_threshold: f64,

    /// Assumed worst-case clock drift factor, `>= 1.0`. The leader lease
    /// lasts `election_timeout_min / clock_drift_bound`.
    #[serde(default = "default_clock_drift_bound")]
    pub clock_drift_bound: f64,

    /// Compatibility flag for relaxed commit under partition. Commit
    /// quorum stays strict regardless; see `validate`.
    #[serde(default)]
    pub partitioning: bool,

    /// Leaders answer pre-vote polls with a hard veto
    #[serde(default)]
    pub aggressive_leader_stickiness: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election: ElectionConfig::default(),
            replication: ReplicationConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
            heartbeat_threshold: default_heartbeat_threshold(),
            clock_drift_bound: default_clock_drift_bound(),
            partitioning: false,
            aggressive_leader_stickiness: false,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(
            self.heartbeat_threshold > 0.0 && self.heartbeat_threshold <= 1.0,
            "heartbeat_threshold must be in (0, 1]",
        )?;
        ensure(
            self.clock_drift_bound >= 1.0,
            "clock_drift_bound must be at least 1.0",
        )?;

        if self.partitioning {
            warn!(
                "partitioning is set but commit quorum remains strict; the flag is kept for \
                 configuration compatibility only"
            );
        }

        self.election.validate()?;
        self.replication.validate()?;
        self.failure_detector.validate()?;
        Ok(())
    }

    /// Heartbeat period derived from the election floor and threshold.
    pub fn heartbeat_period(&self) -> Duration {
        let millis = (self.election.election_timeout_min as f64 * self.heartbeat_threshold) as u64;
        Duration::from_millis(millis.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElectionConfig {
    /// Lower bound of the randomized election timeout, milliseconds
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min: u64,

    /// Upper bound of the randomized election timeout, milliseconds
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: default_election_timeout_min(),
            election_timeout_max: default_election_timeout_max(),
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(
            self.election_timeout_min > 0,
            "election_timeout_min must be greater than 0",
        )?;
        ensure(
            self.election_timeout_max >= self.election_timeout_min,
            "election_timeout_max must be >= election_timeout_min",
        )?;
        Ok(())
    }

    pub fn timeout_range(&self) -> (u64, u64) {
        (self.election_timeout_min, self.election_timeout_max)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplicationConfig {
    /// How far `next_index` backs off after a log mismatch, at least 1
    #[serde(default = "default_backoff_step")]
    pub backoff_step: u64,

    /// Upper bound of entries shipped per member per round
    #[serde(default = "default_max_entries_per_round")]
    pub max_entries_per_round: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            backoff_step: default_backoff_step(),
            max_entries_per_round: default_max_entries_per_round(),
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(self.backoff_step >= 1, "backoff_step must be at least 1")?;
        ensure(
            self.max_entries_per_round > 0,
            "max_entries_per_round must be greater than 0",
        )?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailureDetectorConfig {
    /// Weight of the newest inter-arrival sample, in `(0, 1]`
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,

    /// Silence tolerated as a multiple of the smoothed interval
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: f64,

    /// Samples required before verdicts count
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: u32,

    /// Floor for the smoothed interval, milliseconds. Guards against a
    /// burst of back-to-back beats shrinking the tolerance to nothing.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: default_smoothing_factor(),
            unhealthy_threshold: default_unhealthy_threshold(),
            warmup_samples: default_warmup_samples(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl FailureDetectorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(
            self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0,
            "smoothing_factor must be in (0, 1]",
        )?;
        ensure(
            self.unhealthy_threshold > 1.0,
            "unhealthy_threshold must be greater than 1.0",
        )?;
        ensure(
            self.min_interval_ms > 0,
            "min_interval_ms must be greater than 0",
        )?;
        Ok(())
    }
}

fn default_heartbeat_threshold() -> f64 {
    0.5
}

fn default_clock_drift_bound() -> f64 {
    1.0
}

fn default_election_timeout_min() -> u64 {
    150
}

fn default_election_timeout_max() -> u64 {
    300
}

fn default_backoff_step() -> u64 {
    1
}

fn default_max_entries_per_round() -> u64 {
    64
}

fn default_smoothing_factor() -> f64 {
    0.3
}

fn default_unhealthy_threshold() -> f64 {
    4.0
}

fn default_warmup_samples() -> u32 {
    10
}

fn default_min_interval_ms() -> u64 {
    10
}
