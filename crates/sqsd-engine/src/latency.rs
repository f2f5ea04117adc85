use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept for the moving average.
pub const LATENCY_SAMPLES: usize = 50;

/// Moving window of successful dispatch latencies.
///
/// Before the first sample the average reports `empty_default`, so a freshly
/// started daemon behaves as if the application were slow.
pub struct LatencyWindow {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
    empty_default: Duration,
}

impl LatencyWindow {
    pub fn new(empty_default: Duration) -> Self {
        Self::with_capacity(LATENCY_SAMPLES, empty_default)
    }

    pub fn with_capacity(capacity: usize, empty_default: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            empty_default,
        }
    }

    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    pub fn average(&self) -> Duration {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return self.empty_default;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
