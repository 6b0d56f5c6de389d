use std::sync::Arc;
use std::time::Duration;

use super::ReplicationQueue;
use super::await_barrier;

/// Waiters enqueued before the valve switch complete with the round
/// outcome.
#[tokio::test]
async fn test_waiters_complete_with_round_outcome() {
    let queue = ReplicationQueue::new();
    let rx = queue.enqueue();

    queue.switch_valve();
    queue.drain(true);

    assert_eq!(await_barrier(rx).await.expect("barrier"), true);
}

/// Waiters arriving mid-round are deferred to the next round.
#[tokio::test]
async fn test_late_waiters_join_next_round() {
    let queue = ReplicationQueue::new();

    queue.switch_valve();
    let late = queue.enqueue();
    queue.drain(true);

    // The late waiter must still be pending.
    let mut late = late;
    assert!(
        late.try_recv().is_err(),
        "late waiter must not observe the in-flight round"
    );

    queue.switch_valve();
    queue.drain(false);
    assert_eq!(await_barrier(late).await.expect("barrier"), false);
}

#[tokio::test]
async fn test_enqueue_triggers_loop_wakeup() {
    let queue = Arc::new(ReplicationQueue::new());

    let loop_side = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.triggered().await;
        })
    };

    // Give the loop task a chance to park on the trigger.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let _rx = queue.enqueue();

    tokio::time::timeout(Duration::from_millis(200), loop_side)
        .await
        .expect("trigger must wake the loop")
        .expect("task");
}

#[tokio::test]
async fn test_shutdown_fails_all_lanes_and_late_waiters() {
    let queue = ReplicationQueue::new();
    let in_round = queue.enqueue();
    queue.switch_valve();
    let pending = queue.enqueue();

    queue.shutdown();

    assert_eq!(await_barrier(in_round).await.expect("barrier"), false);
    assert_eq!(await_barrier(pending).await.expect("barrier"), false);

    // A waiter arriving after shutdown fails immediately instead of
    // hanging on a dead loop.
    let late = queue.enqueue();
    assert_eq!(await_barrier(late).await.expect("barrier"), false);
}

/// A caller abandoning its barrier must not poison the drain.
#[tokio::test]
async fn test_dropped_waiter_is_skipped() {
    let queue = ReplicationQueue::new();
    let alive = queue.enqueue();
    drop(queue.enqueue());

    queue.switch_valve();
    queue.drain(true);

    assert_eq!(await_barrier(alive).await.expect("barrier"), true);
}
