use std::time::{Duration, Instant};

/// One accepted pulse width and when it was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub at: Instant,
    pub duration_us: u32,
}

/// Fixed-capacity history of accepted pulse widths
///
/// Once full, every push overwrites the oldest sample.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: Vec<Sample>,
    head: usize,
    capacity: usize,
}

impl SampleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.head] = sample;
        }
        self.head = (self.head + 1) % self.capacity;
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

    pub fn clear(&mut self) {
        self.samples.clear();
        self.head = 0;
    }

    /// Integer mean of the samples recorded within `window` before `now`
    ///
    /// Samples stamped after `now` are ignored.
    pub fn mean_within(&self, window: Duration, now: Instant) -> Option<u32> {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|sample| {
                now.checked_duration_since(sample.at)
                    .is_some_and(|age| age <= window)
            })
            .fold((0u64, 0u64), |(sum, count), sample| {
                (sum + u64::from(sample.duration_us), count + 1)
            });

        (count > 0).then(|| u32::try_from(sum / count).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: Instant, duration_us: u32) -> Sample {
        Sample { at, duration_us }
    }

    #[test]
    fn empty_ring_has_no_mean() {
        let ring = SampleRing::with_capacity(4);
        assert!(ring.is_empty());
        assert_eq!(ring.mean_within(Duration::from_secs(1), Instant::now()), None);
    }

    #[test]
    fn push_overwrites_oldest_when_full() {
        let now = Instant::now();
        let mut ring = SampleRing::with_capacity(3);
        for width in [1000, 1100, 1200, 1300] {
            ring.push(sample(now, width));
        }
        assert_eq!(ring.len(), 3);
        // 1000 was overwritten
        assert_eq!(ring.mean_within(Duration::from_secs(1), now), Some(1200));
    }

    #[test]
    fn mean_only_counts_samples_inside_window() {
        let base = Instant::now();
        let mut ring = SampleRing::with_capacity(8);
        ring.push(sample(base, 1000));
        ring.push(sample(base + Duration::from_millis(300), 1400));
        ring.push(sample(base + Duration::from_millis(400), 1600));

        let now = base + Duration::from_millis(450);
        assert_eq!(ring.mean_within(Duration::from_millis(200), now), Some(1500));
        assert_eq!(ring.mean_within(Duration::from_millis(500), now), Some(1333));
        assert_eq!(ring.mean_within(Duration::from_millis(10), now), None);
    }

    #[test]
    fn future_samples_are_ignored() {
        let base = Instant::now();
        let mut ring = SampleRing::with_capacity(4);
        ring.push(sample(base + Duration::from_millis(50), 2000));
        assert_eq!(ring.mean_within(Duration::from_secs(1), base), None);
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let mut ring = SampleRing::with_capacity(0);
        assert_eq!(ring.capacity(), 1);
        let now = Instant::now();
        ring.push(sample(now, 1500));
        ring.push(sample(now, 1700));
        assert_eq!(ring.mean_within(Duration::from_secs(1), now), Some(1700));
    }
}
