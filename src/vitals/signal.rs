//! Signal conditioning primitives shared by the analysers

use std::collections::VecDeque;

/// Fixed-capacity buffer that overwrites its oldest entry when full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    total_pushed: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total_pushed: 0,
        }
    }

    /// Push a value, returning the evicted one if the buffer was full
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(value);
        self.total_pushed += 1;
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of values ever pushed, including overwritten ones
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// The last `n` values, oldest first
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.total_pushed = 0;
    }
}

/// N-tap moving average used as a cheap band-pass stand-in
#[derive(Debug, Clone)]
pub struct MovingAverage<const N: usize> {
    taps: [f64; N],
    index: usize,
}

impl<const N: usize> MovingAverage<N> {
    pub fn new() -> Self {
        Self {
            taps: [0.0; N],
            index: 0,
        }
    }

    /// Feed a sample and return the filtered value
    pub fn apply(&mut self, value: f64) -> f64 {
        if N == 0 {
            return value;
        }
        self.taps[self.index] = value;
        self.index = (self.index + 1) % N;
        self.taps.iter().sum::<f64>() / N as f64
    }

    pub fn reset(&mut self) {
        self.taps = [0.0; N];
        self.index = 0;
    }
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The 10-tap filter applied to ECG and PPG channels
pub type BandpassFilter = MovingAverage<10>;

/// Local-maximum detector with a threshold and a refractory interval
#[derive(Debug, Clone)]
pub struct PeakDetector {
    threshold: f64,
    min_interval_ms: u64,
    last_value: Option<f64>,
    last_derivative: f64,
    last_peak_ms: Option<u64>,
}

impl PeakDetector {
    pub fn new(threshold: f64, min_interval_ms: u64) -> Self {
        Self {
            threshold,
            min_interval_ms,
            last_value: None,
            last_derivative: 0.0,
            last_peak_ms: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    /// Feed a sample; returns true when the previous sample was a peak.
    /// A peak is above threshold, where the slope turns from rising to falling,
    /// and at least `min_interval_ms` after the previous peak.
    pub fn process(&mut self, value: f64, timestamp_ms: u64) -> bool {
        let Some(last_value) = self.last_value else {
            self.last_value = Some(value);
            return false;
        };

        let derivative = value - last_value;
        let turning = self.last_derivative > 0.0 && derivative <= 0.0;
        let mut is_peak = false;

        if turning && last_value > self.threshold {
            let clear_of_last = self
                .last_peak_ms
                .map_or(true, |last| timestamp_ms.saturating_sub(last) >= self.min_interval_ms);
            if clear_of_last {
                self.last_peak_ms = Some(timestamp_ms);
                is_peak = true;
            }
        }

        self.last_value = Some(value);
        self.last_derivative = derivative;
        is_peak
    }

    pub fn reset(&mut self) {
        self.last_value = None;
        self.last_derivative = 0.0;
        self.last_peak_ms = None;
    }
}

/// 1.5 times the mean of the most recent 50 samples, or None when empty
pub fn adaptive_threshold<'a, I>(samples: I) -> Option<f64>
where
    I: DoubleEndedIterator<Item = &'a f64>,
{
    let recent: Vec<f64> = samples.rev().take(50).copied().collect();
    if recent.is_empty() {
        return None;
    }
    Some(1.5 * recent.iter().sum::<f64>() / recent.len() as f64)
}

/// Population mean and standard deviation
pub fn mean_and_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}
