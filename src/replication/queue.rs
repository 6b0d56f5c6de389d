//! Round barrier for replication waiters.
//!
//! Callers forcing replication must observe a complete heartbeat round,
//! not whatever round happens to be in flight. The queue keeps two waiter
//! lanes: `pending` collects new callers, `in_round` holds the callers the
//! current round answers for. The heartbeat loop switches the valve at
//! round start and drains at round end.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::oneshot;

use crate::NetworkError;
use crate::Result;

#[derive(Debug, Default)]
struct WaiterLanes {
    in_round: Vec<oneshot::Sender<bool>>,
    pending: Vec<oneshot::Sender<bool>>,
    /// Set on leader step-down; late waiters fail immediately instead of
    /// waiting for a round that will never run
    closed: bool,
}

/// One-shot barrier batching `force_replication` callers onto the next
/// full heartbeat round.
#[derive(Debug, Default)]
pub struct ReplicationQueue {
    lanes: Mutex<WaiterLanes>,
    trigger: Notify,
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the next round and wakes the heartbeat
    /// loop. The receiver resolves with the round's commit outcome.
    pub fn enqueue(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                let _ = tx.send(false);
                return rx;
            }
            lanes.pending.push(tx);
        }
        self.trigger.notify_one();
        rx
    }

    /// Wakes the heartbeat loop without registering a waiter.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Suspends until the next trigger fires.
    pub async fn triggered(&self) {
        self.trigger.notified().await;
    }

    /// Admits pending waiters into the starting round.
    ///
    /// Waiters enqueued after this point join the following round.
    pub fn switch_valve(&self) {
        let mut lanes = self.lanes.lock();
        let pending = std::mem::take(&mut lanes.pending);
        lanes.in_round.extend(pending);
    }

    /// Completes the current round's waiters with its commit outcome.
    ///
    /// Dropped receivers are skipped; a oneshot can fail only when its
    /// consumer is gone.
    pub fn drain(
        &self,
        committed: bool,
    ) {
        let waiters = std::mem::take(&mut self.lanes.lock().in_round);
        for waiter in waiters {
            let _ = waiter.send(committed);
        }
    }

    /// Fails every waiter in both lanes and refuses future ones. Called
    /// on leader step-down.
    pub fn shutdown(&self) {
        let mut lanes = self.lanes.lock();
        lanes.closed = true;
        let in_round = lanes.in_round.drain(..).collect::<Vec<_>>();
        let pending = lanes.pending.drain(..).collect::<Vec<_>>();
        for waiter in in_round.into_iter().chain(pending) {
            let _ = waiter.send(false);
        }
    }
}

/// Awaits a barrier receiver, mapping sender loss to a channel error.
pub(crate) async fn await_barrier(receiver: oneshot::Receiver<bool>) -> Result<bool> {
    receiver.await.map_err(|_| {
        NetworkError::SignalReceiveFailed("replication barrier dropped before completion".into())
            .into()
    })
}
