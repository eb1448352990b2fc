//! Network-adjusted time
//!
//! Each outbound handshake contributes one clock-offset sample; the
//! adjusted offset is the median once enough samples exist, clamped so a
//! majority of skewed peers cannot drag our clock arbitrarily.

use crate::types::now;
use std::sync::Mutex;
use tracing::warn;

/// Samples kept; later handshakes stop contributing.
const MAX_TIME_SAMPLES: usize = 200;

/// Offsets are ignored beyond this bound (70 minutes).
const MAX_TIME_OFFSET_SECS: i64 = 70 * 60;

/// Samples required before the median is applied.
const MIN_TIME_SAMPLES: usize = 5;

#[derive(Default)]
pub struct TimeData {
    inner: Mutex<TimeDataInner>,
}

#[derive(Default)]
struct TimeDataInner {
    samples: Vec<i64>,
    offset: i64,
    warned: bool,
}

impl TimeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one peer's clock offset (their time minus ours).
    pub fn add_sample(&self, offset: i64) {
        let mut inner = self.inner.lock().expect("timedata lock poisoned");
        if inner.samples.len() >= MAX_TIME_SAMPLES {
            return;
        }
        inner.samples.push(offset);

        // Only recompute on odd counts so the median is a real sample.
        if inner.samples.len() < MIN_TIME_SAMPLES || inner.samples.len() % 2 == 0 {
            return;
        }

        let mut sorted = inner.samples.clone();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];

        if median.abs() <= MAX_TIME_OFFSET_SECS {
            inner.offset = median;
        } else {
            inner.offset = 0;
            if !inner.warned {
                inner.warned = true;
                warn!(
                    "peer clocks disagree with ours by {median}s; check the local clock"
                );
            }
        }
    }

    /// Current offset applied to the local clock.
    pub fn offset(&self) -> i64 {
        self.inner.lock().expect("timedata lock poisoned").offset
    }

    /// Unix seconds, network-adjusted.
    pub fn adjusted_time(&self) -> u64 {
        let offset = self.offset();
        let base = now() as i64;
        base.saturating_add(offset).max(0) as u64
    }

    pub fn sample_count(&self) -> usize {
        self.inner
            .lock()
            .expect("timedata lock poisoned")
            .samples
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_offset_until_enough_samples() {
        let td = TimeData::new();
        td.add_sample(50);
        td.add_sample(50);
        td.add_sample(50);
        assert_eq!(td.offset(), 0);
    }

    #[test]
    fn median_applies_at_five_samples() {
        let td = TimeData::new();
        for offset in [10, 20, 30, 40, 50] {
            td.add_sample(offset);
        }
        assert_eq!(td.offset(), 30);
        assert!(td.adjusted_time() >= now());
    }

    #[test]
    fn outlier_minority_cannot_move_median() {
        let td = TimeData::new();
        for offset in [0, 1, -1, 100_000, 100_000] {
            td.add_sample(offset);
        }
        assert_eq!(td.offset(), 1);
    }

    #[test]
    fn absurd_majority_is_clamped_to_zero() {
        let td = TimeData::new();
        for _ in 0..5 {
            td.add_sample(MAX_TIME_OFFSET_SECS + 1_000);
        }
        assert_eq!(td.offset(), 0);
    }

    #[test]
    fn sample_cap_enforced() {
        let td = TimeData::new();
        for i in 0..(MAX_TIME_SAMPLES + 50) {
            td.add_sample(i as i64 % 10);
        }
        assert_eq!(td.sample_count(), MAX_TIME_SAMPLES);
    }
}
