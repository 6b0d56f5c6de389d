//! Log entry and peer RPC message types.
//!
//! These are in-process representations only. Wire encoding is owned by the
//! transport implementation behind the [`Transport`](crate::Transport) trait.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::ClusterConfiguration;

/// A single replicated log record.
///
/// Entries are immutable once created. A snapshot entry (`is_snapshot`)
/// stands for the whole log prefix up to and including its index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub is_snapshot: bool,
    #[serde(with = "serde_bytes_compat")]
    pub payload: Bytes,
    pub command_id: Option<u32>,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

mod serde_bytes_compat {
    use bytes::Bytes;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        payload: &Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(payload)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}

impl LogEntry {
    pub fn new(
        term: u64,
        index: u64,
        payload: Bytes,
        command_id: Option<u32>,
    ) -> Self {
        Self {
            term,
            index,
            is_snapshot: false,
            payload,
            command_id,
            timestamp: unix_millis(),
        }
    }

    /// Empty marker entry appended by a fresh leader to anchor commit
    /// progress in its own term.
    pub fn no_op(
        term: u64,
        index: u64,
    ) -> Self {
        Self {
            term,
            index,
            is_snapshot: false,
            payload: Bytes::new(),
            command_id: None,
            timestamp: unix_millis(),
        }
    }

    pub fn snapshot(
        term: u64,
        index: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            term,
            index,
            is_snapshot: true,
            payload,
            command_id: None,
            timestamp: unix_millis(),
        }
    }

    pub fn payload_length(&self) -> u64 {
        self.payload.len() as u64
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Replication request from the leader.
///
/// Always carries the leader's view of the cluster configuration so a
/// follower that lost the proposal can be brought back in sync.
#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u32,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
    pub config: ClusterConfiguration,
    pub apply_config: bool,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a follower refused an [`AppendEntriesRequest`].
///
/// `ConfigMismatch` is reported separately from `LogMismatch` so the leader
/// re-sends the configuration proposal instead of backing off `next_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendConflict {
    /// The preceding entry check failed
    LogMismatch,
    /// The configuration fingerprint did not match on an apply request
    ConfigMismatch,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub node_id: u32,
    pub term: u64,
    pub success: bool,
    pub conflict: Option<AppendConflict>,
}

impl AppendEntriesResponse {
    pub fn success(
        node_id: u32,
        term: u64,
    ) -> Self {
        Self {
            node_id,
            term,
            success: true,
            conflict: None,
        }
    }

    pub fn higher_term(
        node_id: u32,
        term: u64,
    ) -> Self {
        Self {
            node_id,
            term,
            success: false,
            conflict: None,
        }
    }

    pub fn log_mismatch(
        node_id: u32,
        term: u64,
    ) -> Self {
        Self {
            node_id,
            term,
            success: false,
            conflict: Some(AppendConflict::LogMismatch),
        }
    }

    pub fn config_mismatch(
        node_id: u32,
        term: u64,
    ) -> Self {
        Self {
            node_id,
            term,
            success: false,
            conflict: Some(AppendConflict::ConfigMismatch),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct VoteResponse {
    pub node_id: u32,
    pub term: u64,
    pub vote_granted: bool,
}

/// Side-effect-free poll sent before a follower increments its term.
#[derive(Debug, Clone, Copy)]
pub struct PreVoteRequest {
    /// The term the candidate would campaign at, `current_term + 1`
    pub next_term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Responder's judgement of a pre-vote poll. Handlers never mutate
/// persistent state when producing this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreVoteVerdict {
    Accepted,
    /// Responder heard from a leader recently or has a fresher log
    RejectedByFollower,
    /// Responder is the leader and vetoes the candidacy outright
    RejectedByLeader,
}

#[derive(Debug, Clone, Copy)]
pub struct PreVoteResponse {
    pub node_id: u32,
    pub term: u64,
    pub verdict: PreVoteVerdict,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: u32,
    /// Snapshot record standing for the log prefix up to `snapshot_index`
    pub snapshot: LogEntry,
    pub snapshot_index: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InstallSnapshotResponse {
    pub node_id: u32,
    pub term: u64,
    pub success: bool,
}

/// Follower-initiated commit index probe used by the read barrier.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizeRequest {
    pub follower_id: u32,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SynchronizeResponse {
    pub term: u64,
    /// Leader's committed index, `None` when the responder is not leader
    pub commit_index: Option<u64>,
}
