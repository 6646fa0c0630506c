//! Latency samples collected by the read stages.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::warn;

use crate::stage::StageKind;

/// Collects per-worker latency samples and reduces them to a mean.
///
/// Read stages run one timed operation per worker, so every stage is
/// expected to record exactly `expected_samples` samples.
#[derive(Debug)]
pub struct MetricsAggregator {
    expected_samples: usize,
    samples: Mutex<HashMap<StageKind, Vec<f64>>>,
}

impl MetricsAggregator {
    pub fn new(expected_samples: usize) -> Self {
        Self {
            expected_samples,
            samples: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StageKind, Vec<f64>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a latency of `millis` milliseconds for `stage`.
    pub fn record_sample(&self, stage: StageKind, millis: f64) {
        self.lock().entry(stage).or_default().push(millis);
    }

    /// Records the time elapsed since `start` for `stage`.
    pub fn record_elapsed(&self, stage: StageKind, start: Instant) {
        self.record_sample(stage, start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Samples recorded for `stage`, in no particular order.
    #[cfg(test)]
    pub(crate) fn samples(&self, stage: StageKind) -> Vec<f64> {
        self.lock().get(&stage).cloned().unwrap_or_default()
    }

    /// Arithmetic mean of the samples recorded for `stage`, in milliseconds.
    ///
    /// Divides by the number of samples actually recorded. If that differs
    /// from the expected one-sample-per-worker count a warning is logged,
    /// since the figure then no longer describes a per-worker latency.
    /// Returns `None` if nothing was recorded.
    pub fn mean(&self, stage: StageKind) -> Option<f64> {
        let samples = self.lock();
        let samples = samples.get(&stage).filter(|s| !s.is_empty())?;
        if samples.len() != self.expected_samples {
            warn!(
                "{stage}: averaging {} samples, expected one per worker ({})",
                samples.len(),
                self.expected_samples
            );
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mean_of_one_sample_per_worker() {
        let metrics = MetricsAggregator::new(4);
        for millis in [10.0, 20.0, 30.0, 40.0] {
            metrics.record_sample(StageKind::SelectUserById, millis);
        }
        assert_eq!(metrics.mean(StageKind::SelectUserById), Some(25.0));
    }

    #[test]
    fn stages_are_kept_apart() {
        let metrics = MetricsAggregator::new(1);
        metrics.record_sample(StageKind::SelectUserById, 3.0);
        metrics.record_sample(StageKind::SelectWithJoins, 9.0);
        assert_eq!(metrics.mean(StageKind::SelectUserById), Some(3.0));
        assert_eq!(metrics.mean(StageKind::SelectWithJoins), Some(9.0));
        assert_eq!(metrics.mean(StageKind::SelectWithFilters), None);
    }

    #[test]
    fn unexpected_sample_count_uses_actual_count() {
        let metrics = MetricsAggregator::new(4);
        metrics.record_sample(StageKind::SelectUserById, 6.0);
        metrics.record_sample(StageKind::SelectUserById, 2.0);
        assert_eq!(metrics.mean(StageKind::SelectUserById), Some(4.0));
    }

    #[test]
    fn concurrent_recording() {
        let metrics = MetricsAggregator::new(8);
        thread::scope(|scope| {
            for worker in 0..8 {
                let metrics = &metrics;
                scope.spawn(move || {
                    let start = Instant::now();
                    metrics.record_elapsed(StageKind::SelectUserById, start);
                    metrics.record_sample(StageKind::SelectWithFilters, worker as f64);
                });
            }
        });
        assert_eq!(metrics.samples(StageKind::SelectUserById).len(), 8);
        assert_eq!(metrics.mean(StageKind::SelectWithFilters), Some(3.5));
    }
}
