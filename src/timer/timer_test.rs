use std::time::Duration;

use super::AtomicTimestamp;
use super::ElectionTimer;
use super::Timestamp;

#[test]
fn test_timer_samples_within_range() {
    for _ in 0..32 {
        let timer = ElectionTimer::new((150, 300));
        let timeout = timer.current_timeout().as_millis() as u64;
        assert!(
            (150..=300).contains(&timeout),
            "sampled timeout {timeout} outside configured range"
        );
    }
}

#[test]
fn test_timer_reset_moves_deadline_forward() {
    let mut timer = ElectionTimer::new((150, 300));
    let before = timer.next_deadline();
    timer.reset();
    assert!(timer.next_deadline() >= before);
    assert!(!timer.is_expired());
}

#[test]
fn test_degenerate_range_uses_min() {
    let timer = ElectionTimer::new((100, 100));
    assert_eq!(timer.current_timeout(), Duration::from_millis(100));
}

#[test]
fn test_atomic_timestamp_advance_is_monotone() {
    let cell = AtomicTimestamp::now();
    let later = Timestamp::now().saturating_add(Duration::from_secs(5));
    cell.advance_to(later);
    assert_eq!(cell.load(), later);

    // Advancing to an older reading keeps the newer one.
    cell.advance_to(Timestamp::from_millis(0));
    assert_eq!(cell.load(), later);
}

#[tokio::test]
async fn test_timestamp_elapsed_grows() {
    let reading = Timestamp::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(reading.elapsed() >= Duration::from_millis(10));
}
