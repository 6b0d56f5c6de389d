//! Per-follower liveness estimation.
//!
//! The leader feeds a detector with one signal only: a heartbeat that
//! came back successfully. Everything else (health judgement, warm-up)
//! is derived from the inter-arrival times of those signals.

use std::time::Duration;

use parking_lot::Mutex;

use crate::config::FailureDetectorConfig;
use crate::timer::Timestamp;

/// Liveness estimator fed by successful heartbeat responses.
///
/// `is_monitoring` stays false until enough samples arrived to trust the
/// estimate; an unhealthy verdict is only meaningful while monitoring.
pub trait FailureDetector: Send + Sync + 'static {
    fn new(config: &FailureDetectorConfig) -> Self;

    /// Records a successful heartbeat response from the follower.
    fn report_heartbeat(&self);

    /// True once the warm-up sample count has been reached.
    fn is_monitoring(&self) -> bool;

    /// False when the follower stopped responding for longer than the
    /// tolerated multiple of its smoothed heartbeat interval.
    fn is_healthy(&self) -> bool;
}

#[derive(Debug)]
struct EwmaState {
    last_beat: Option<Timestamp>,
    smoothed_interval_ms: f64,
    samples: u32,
}

/// Exponentially weighted moving average over heartbeat inter-arrival
/// times.
#[derive(Debug)]
pub struct EwmaFailureDetector {
    state: Mutex<EwmaState>,
    smoothing_factor: f64,
    unhealthy_threshold: f64,
    warmup_samples: u32,
    min_interval: Duration,
}

impl FailureDetector for EwmaFailureDetector {
    fn new(config: &FailureDetectorConfig) -> Self {
        Self {
            state: Mutex::new(EwmaState {
                last_beat: None,
                smoothed_interval_ms: config.min_interval_ms as f64,
                samples: 0,
            }),
            smoothing_factor: config.smoothing_factor,
            unhealthy_threshold: config.unhealthy_threshold,
            warmup_samples: config.warmup_samples,
            min_interval: Duration::from_millis(config.min_interval_ms),
        }
    }

    fn report_heartbeat(&self) {
        let now = Timestamp::now();
        let mut state = self.state.lock();

        if let Some(last) = state.last_beat {
            let interval_ms = now.millis().saturating_sub(last.millis()) as f64;
            if state.samples == 1 {
                // Seed the average with the first observed interval.
                state.smoothed_interval_ms = interval_ms;
            } else {
                state.smoothed_interval_ms = self.smoothing_factor * interval_ms
                    + (1.0 - self.smoothing_factor) * state.smoothed_interval_ms;
            }
        }
        state.last_beat = Some(now);
        state.samples = state.samples.saturating_add(1);
    }

    fn is_monitoring(&self) -> bool {
        self.state.lock().samples >= self.warmup_samples
    }

    fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        let Some(last) = state.last_beat else {
            // Nothing observed yet; warm-up gating applies.
            return true;
        };
        let floor = self.min_interval.as_millis() as f64;
        let tolerated = state.smoothed_interval_ms.max(floor) * self.unhealthy_threshold;
        (last.elapsed().as_millis() as f64) <= tolerated
    }
}

#[cfg(test)]
mod failure_detector_test {
    use std::time::Duration;

    use super::*;

    fn config(warmup: u32) -> FailureDetectorConfig {
        FailureDetectorConfig {
            smoothing_factor: 0.3,
            unhealthy_threshold: 3.0,
            warmup_samples: warmup,
            min_interval_ms: 10,
        }
    }

    #[test]
    fn test_detector_not_monitoring_before_warmup() {
        let detector = EwmaFailureDetector::new(&config(3));
        assert!(!detector.is_monitoring());

        detector.report_heartbeat();
        detector.report_heartbeat();
        assert!(!detector.is_monitoring());

        detector.report_heartbeat();
        assert!(detector.is_monitoring());
    }

    #[test]
    fn test_detector_healthy_without_samples() {
        let detector = EwmaFailureDetector::new(&config(1));
        assert!(detector.is_healthy());
    }

    #[tokio::test]
    async fn test_detector_goes_unhealthy_on_silence() {
        let detector = EwmaFailureDetector::new(&config(2));

        // Two quick beats establish a ~20ms smoothed interval.
        detector.report_heartbeat();
        tokio::time::sleep(Duration::from_millis(20)).await;
        detector.report_heartbeat();
        assert!(detector.is_monitoring());
        assert!(detector.is_healthy());

        // Silence well past threshold * smoothed interval.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!detector.is_healthy());

        // A fresh beat restores the verdict.
        detector.report_heartbeat();
        assert!(detector.is_healthy());
    }
}
