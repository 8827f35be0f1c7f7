//! Bounded latency/outcome history for one node.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// One observation held in the history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
}

/// Ring buffer of recent samples, bounded both by count and by age.
///
/// Age eviction happens lazily on [`push`](Self::push); readers may see
/// samples that have aged out since the last write.
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<Sample>,
    capacity: usize,
    window: Duration,
}

impl LatencyHistory {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Append a sample, evicting anything older than the window or beyond
    /// capacity.
    pub fn push(&mut self, sample: Sample) {
        let cutoff = sample.timestamp - self.window;
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// `(total, failures)` over samples at or after `floor`.
    pub fn counts_since(&self, floor: Option<DateTime<Utc>>) -> (usize, usize) {
        self.samples
            .iter()
            .filter(|s| floor.is_none_or(|f| s.timestamp >= f))
            .fold((0, 0), |(total, failures), s| {
                (total + 1, failures + usize::from(!s.success))
            })
    }

    /// Failure ratio over samples at or after `floor`; 0.0 when empty.
    pub fn error_rate_since(&self, floor: Option<DateTime<Utc>>) -> f64 {
        let (total, failures) = self.counts_since(floor);
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    /// Latency percentile (`p` in `[0, 1]`) over successful samples.
    ///
    /// Uses linear interpolation between the closest ranks
    /// (`rank = p * (n - 1)`). Returns `None` with fewer than `min_samples`
    /// successes.
    pub fn percentile(&self, p: f64, min_samples: usize) -> Option<f64> {
        let mut latencies: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms)
            .collect();
        if latencies.is_empty() || latencies.len() < min_samples {
            return None;
        }
        latencies.sort_unstable();

        let rank = p.clamp(0.0, 1.0) * (latencies.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let low = latencies[lower] as f64;
        let high = latencies[upper] as f64;
        Some(low + (high - low) * (rank - lower as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: DateTime<Utc>, latency_ms: u64, success: bool) -> Sample {
        Sample {
            timestamp: at,
            latency_ms,
            success,
        }
    }

    #[test]
    fn capacity_bounds_length() {
        let now = Utc::now();
        let mut history = LatencyHistory::new(200, Duration::seconds(300));
        for i in 0..500 {
            history.push(sample(now, i, true));
        }
        assert_eq!(history.len(), 200);
        // Oldest samples were dropped first
        assert_eq!(history.iter().next().unwrap().latency_ms, 300);
    }

    #[test]
    fn old_samples_evicted_on_write() {
        let start = Utc::now();
        let mut history = LatencyHistory::new(200, Duration::seconds(60));
        history.push(sample(start, 10, false));
        history.push(sample(start + Duration::seconds(30), 10, true));
        assert_eq!(history.len(), 2);

        history.push(sample(start + Duration::seconds(90), 10, true));
        assert_eq!(history.len(), 2);
        assert_eq!(history.error_rate_since(None), 0.0);
    }

    #[test]
    fn percentile_interpolates_over_successes_only() {
        let now = Utc::now();
        let mut history = LatencyHistory::new(200, Duration::seconds(300));
        for latency in [10, 20, 30, 40, 50] {
            history.push(sample(now, latency, true));
        }
        history.push(sample(now, 10_000, false));

        assert_eq!(history.percentile(0.5, 5), Some(30.0));
        // rank = 0.95 * 4 = 3.8 -> 40 + 0.8 * 10
        let p95 = history.percentile(0.95, 5).unwrap();
        assert!((p95 - 48.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_unknown_below_min_samples() {
        let now = Utc::now();
        let mut history = LatencyHistory::new(200, Duration::seconds(300));
        for _ in 0..4 {
            history.push(sample(now, 50, true));
        }
        assert_eq!(history.percentile(0.95, 5), None);
        history.push(sample(now, 50, true));
        assert_eq!(history.percentile(0.95, 5), Some(50.0));
    }

    #[test]
    fn error_rate_respects_floor() {
        let start = Utc::now();
        let mut history = LatencyHistory::new(200, Duration::seconds(300));
        for _ in 0..3 {
            history.push(sample(start, 10, false));
        }
        let later = start + Duration::seconds(10);
        history.push(sample(later, 10, true));

        assert!((history.error_rate_since(None) - 0.75).abs() < 1e-9);
        assert_eq!(history.error_rate_since(Some(later)), 0.0);
        assert_eq!(history.counts_since(Some(later)), (1, 0));
    }

    #[test]
    fn empty_history_has_zero_error_rate() {
        let history = LatencyHistory::new(10, Duration::seconds(1));
        assert!(history.is_empty());
        assert_eq!(history.error_rate_since(None), 0.0);
        assert_eq!(history.percentile(0.5, 0), None);
    }
}
