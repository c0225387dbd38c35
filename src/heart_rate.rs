use crate::{config::HeartRateMergeConfig, protocol::HeartRateReading, types::MetricSample};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Merges chest-strap heart-rate readings into machine samples
///
/// Readings are kept in a bounded buffer. Each machine sample takes the
/// reading closest to its own timestamp on either side, provided the two are
/// no further apart than the configured skew. A strap value replaces whatever
/// heart rate the machine reported itself.
///
/// A reading taken after the sample can only win if it is buffered before the
/// merge; [`HeartRateMerger::is_settled`] tells a caller when waiting longer
/// cannot change the outcome.
#[derive(Debug, Clone)]
pub struct HeartRateMerger {
    readings: VecDeque<HeartRateReading>,
    capacity: usize,
    max_skew: Duration,
    dropped: u64,
    received: u64,
}

impl HeartRateMerger {
    /// Create a merger from configuration
    #[must_use]
    pub fn new(config: &HeartRateMergeConfig) -> Self {
        Self {
            readings: VecDeque::with_capacity(config.buffer_capacity),
            capacity: config.buffer_capacity.max(1),
            max_skew: config.max_skew(),
            dropped: 0,
            received: 0,
        }
    }

    /// Buffer a strap reading
    ///
    /// Returns `false` when the reading was dropped because its value does
    /// not fit the 8-bit heart-rate field.
    pub fn push(&mut self, reading: HeartRateReading) -> bool {
        if u8::try_from(reading.bpm).is_err() {
            self.dropped += 1;
            warn!("Dropping heart rate reading of {} bpm", reading.bpm);
            return false;
        }

        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
        self.received += 1;
        true
    }

    /// Whether the merge for a sample taken at `at` is final as of `now`
    ///
    /// True when no strap has reported yet, when a reading at or after `at`
    /// is buffered (anything later is further away), or when `now` is past
    /// the skew window of `at`.
    #[must_use]
    pub fn is_settled(&self, at: Instant, now: Instant) -> bool {
        self.received == 0
            || self.readings.iter().any(|reading| reading.at >= at)
            || now.saturating_duration_since(at) >= self.max_skew
    }

    /// Closest buffered value to `at` within the skew limit
    #[must_use]
    pub fn nearest(&self, at: Instant) -> Option<u8> {
        self.readings
            .iter()
            .map(|reading| (abs_diff(reading.at, at), reading.bpm))
            .filter(|(skew, _)| *skew <= self.max_skew)
            .min_by_key(|(skew, _)| *skew)
            .and_then(|(_, bpm)| u8::try_from(bpm).ok())
    }

    /// Merge the nearest reading into `sample`
    ///
    /// Readings too old to match this or any later sample are discarded.
    /// Returns `true` when the sample's heart rate came from the strap.
    pub fn merge(&mut self, sample: &mut MetricSample) -> bool {
        let merged = self.nearest(sample.timestamp);
        if let Some(bpm) = merged {
            if let Some(machine_bpm) = sample.heart_rate.filter(|value| *value != bpm) {
                debug!("Strap heart rate {bpm} overrides machine value {machine_bpm}");
            }
            sample.heart_rate = Some(bpm);
        }

        while self
            .readings
            .front()
            .is_some_and(|reading| reading.at + self.max_skew < sample.timestamp)
        {
            self.readings.pop_front();
        }

        merged.is_some()
    }

    /// Number of buffered readings
    #[must_use]
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether no readings are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Readings rejected because they did not fit in a byte
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn abs_diff(a: Instant, b: Instant) -> Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineClass;

    fn reading(bpm: u16, at: Instant) -> HeartRateReading {
        HeartRateReading { bpm, at }
    }

    #[test]
    fn test_nearest_reading_wins() {
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        merger.push(reading(120, start));
        merger.push(reading(130, start + Duration::from_millis(1500)));

        let mut sample = MetricSample::new(MachineClass::Bike, start + Duration::from_secs(1));
        assert!(merger.merge(&mut sample));
        assert_eq!(sample.heart_rate, Some(130));
    }

    #[test]
    fn test_later_reading_wins_once_buffered() {
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        merger.push(reading(118, start));

        let taken = start + Duration::from_millis(900);
        assert!(!merger.is_settled(taken, taken));

        merger.push(reading(131, start + Duration::from_millis(1000)));
        assert!(merger.is_settled(taken, start + Duration::from_millis(1000)));

        let mut sample = MetricSample::new(MachineClass::Bike, taken);
        assert!(merger.merge(&mut sample));
        assert_eq!(sample.heart_rate, Some(131));
    }

    #[test]
    fn test_settled_after_skew_window() {
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        // nothing to wait for without a strap
        assert!(merger.is_settled(start, start));

        merger.push(reading(120, start));
        let taken = start + Duration::from_millis(500);
        assert!(!merger.is_settled(taken, start + Duration::from_millis(2400)));
        assert!(merger.is_settled(taken, start + Duration::from_millis(2500)));
    }

    #[test]
    fn test_skew_limit() {
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        merger.push(reading(120, start));

        let mut sample = MetricSample::new(MachineClass::Rower, start + Duration::from_secs(3));
        assert!(!merger.merge(&mut sample));
        assert!(sample.heart_rate.is_none());
        // stale reading pruned
        assert!(merger.is_empty());
    }

    #[test]
    fn test_strap_overrides_machine_value() {
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        merger.push(reading(142, start));

        let mut sample = MetricSample::new(MachineClass::Bike, start);
        sample.heart_rate = Some(99);
        merger.merge(&mut sample);
        assert_eq!(sample.heart_rate, Some(142));
    }

    #[test]
    fn test_wide_reading_dropped() {
        let mut merger = HeartRateMerger::new(&HeartRateMergeConfig::default());
        assert!(!merger.push(reading(300, Instant::now())));
        assert_eq!(merger.dropped(), 1);
        assert!(merger.is_empty());
    }

    #[test]
    fn test_buffer_is_bounded() {
        let config = HeartRateMergeConfig {
            buffer_capacity: 4,
            ..HeartRateMergeConfig::default()
        };
        let start = Instant::now();
        let mut merger = HeartRateMerger::new(&config);
        for i in 0..10 {
            merger.push(reading(100 + i, start + Duration::from_millis(u64::from(i) * 100)));
        }
        assert_eq!(merger.len(), 4);
        assert_eq!(merger.nearest(start), Some(106));
    }
}
