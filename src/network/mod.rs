//! Network abstraction layer.
//!
//! The core never touches a socket. Everything it needs from the outside
//! world is the per-member capability set below; wire format, retries and
//! connection management belong to the implementer.

use async_trait::async_trait;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

use crate::AppendEntriesRequest;
use crate::AppendEntriesResponse;
use crate::InstallSnapshotRequest;
use crate::InstallSnapshotResponse;
use crate::Peer;
use crate::PreVoteRequest;
use crate::PreVoteResponse;
use crate::Result;
use crate::SynchronizeRequest;
use crate::SynchronizeResponse;
use crate::VoteRequest;
use crate::VoteResponse;

/// Per-member RPC capability set.
///
/// Requests addressed to the local member loop back into the local
/// handlers so quorum arithmetic stays uniform over the member table.
///
/// # Error semantics
/// A transport `Err` means the member was unreachable. Protocol-level
/// refusals (stale term, log mismatch, vote denied) are `Ok` responses
/// carrying the refusal; only delivery failures surface as errors.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Replicates entries, or confirms leadership when the request
    /// carries none.
    async fn append_entries(
        &self,
        peer: Peer,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Transfers a compacted log prefix to a member that fell behind the
    /// leader's earliest retained entry.
    async fn install_snapshot(
        &self,
        peer: Peer,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Requests this member's vote for the sender's candidacy.
    async fn vote(
        &self,
        peer: Peer,
        request: VoteRequest,
    ) -> Result<VoteResponse>;

    /// Side-effect-free candidacy poll. Responders MUST NOT mutate
    /// persistent state.
    async fn pre_vote(
        &self,
        peer: Peer,
        request: PreVoteRequest,
    ) -> Result<PreVoteResponse>;

    /// Asks the member (expected to be the leader) for its committed
    /// index, forcing a heartbeat round when the caller lags.
    async fn synchronize(
        &self,
        peer: Peer,
        request: SynchronizeRequest,
    ) -> Result<SynchronizeResponse>;

    /// Asks the member to give up leadership.
    ///
    /// # Returns
    /// `true` when the member was leader and stepped down.
    async fn resign(
        &self,
        peer: Peer,
    ) -> Result<bool>;

    /// Aborts every request still in flight toward `peer`. Called on
    /// node shutdown.
    async fn cancel_pending_requests(
        &self,
        peer: Peer,
    ) -> Result<()>;
}
