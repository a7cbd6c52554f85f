use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept by [`WorkTimeHistory::new`]. The median tolerates a fair number
/// of outliers at this size.
pub const DEFAULT_WORK_TIME_SAMPLES: usize = 20;

/// Recent receive-to-delete durations of processed messages.
///
/// The coordinator records a sample each time it deletes a message it has
/// dispatched; the receive pump reads the median to size the visibility timeout
/// of its next receive. Only the newest samples are kept.
#[derive(Debug)]
pub struct WorkTimeHistory {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl Default for WorkTimeHistory {
    fn default() -> Self {
        Self::new(DEFAULT_WORK_TIME_SAMPLES)
    }
}

impl WorkTimeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Median of the kept samples; the mean of the middle two for an even count.
    pub fn median(&self) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2
        } else {
            sorted[mid]
        })
    }
}
