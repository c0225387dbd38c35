use crate::{
    config::ValidatorConfig,
    error::ValidationWarning,
    types::{DataQuality, Metric, MetricSample},
};
use serde::Serialize;
use std::{collections::VecDeque, time::Instant};
use tracing::{debug, warn};

/// Counters kept by the sample validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    /// Samples pushed
    pub total: u64,
    /// Values removed by the range policy
    pub out_of_range: u64,
    /// Values replaced by the window median, or distances held at the last
    /// good value
    pub outliers_corrected: u64,
    /// Values filled by interpolation
    pub interpolated: u64,
    /// Values left absent in an unfillable gap
    pub unfilled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    Closed,
    Open { start: u64 },
    Unfilled,
}

/// Per-metric validator state
#[derive(Debug, Clone)]
struct Track {
    metric: Metric,
    window: VecDeque<f64>,
    last: Option<(u64, f64)>,
    /// Last value that passed its check, and when
    good: Option<(Instant, f64)>,
    gap: Gap,
}

impl Track {
    fn new(metric: Metric, window: usize) -> Self {
        Self {
            metric,
            window: VecDeque::with_capacity(window),
            last: None,
            good: None,
            gap: Gap::Closed,
        }
    }

    fn remember(&mut self, value: f64, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Window median when `value` lies too far from the window mean
    #[allow(clippy::cast_precision_loss)]
    fn outlier_replacement(&self, value: f64, config: &ValidatorConfig) -> Option<f64> {
        let n = self.window.len();
        if n < config.min_samples_for_outlier || n < 2 {
            return None;
        }

        let mean = self.window.iter().sum::<f64>() / n as f64;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std_dev = variance.sqrt();
        if std_dev <= 0.0 || (value - mean).abs() <= config.outlier_std_multiplier * std_dev {
            return None;
        }

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = n / 2;
        Some(if n % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }

    /// Last good value when a cumulative counter moved faster than allowed
    ///
    /// The allowance grows with the time since the last good value, never
    /// less than one second's worth.
    fn jump_replacement(&self, value: f64, at: Instant, config: &ValidatorConfig) -> Option<f64> {
        let (since, good) = self.good?;
        let elapsed = at.saturating_duration_since(since).as_secs_f64().max(1.0);
        ((value - good).abs() > config.distance_max_jump_mps * elapsed).then_some(good)
    }

    fn replacement(&self, value: f64, at: Instant, config: &ValidatorConfig) -> Option<f64> {
        match self.metric {
            Metric::Distance => self.jump_replacement(value, at, config),
            _ => self.outlier_replacement(value, config),
        }
    }
}

/// Streaming sample validator
///
/// Applies, per metric and in order, the range policy, the outlier policy and
/// the short-gap interpolation policy. Rate metrics use a rolling-window
/// outlier check; the distance counter is instead held at its last good value
/// when it jumps further than `distance_max_jump_mps` allows. Samples are
/// returned in input order. While a short gap is open the samples inside it
/// are withheld, so output lags input by at most `max_gap_samples`.
///
/// Running the validator over its own output changes nothing: interpolated
/// and corrected values are recognised by their warnings and take the same
/// path through the rolling windows as on the first pass.
#[derive(Debug, Clone)]
pub struct SampleValidator {
    config: ValidatorConfig,
    tracks: Vec<Track>,
    pending: VecDeque<MetricSample>,
    next_index: u64,
    stats: ValidationStats,
}

impl SampleValidator {
    /// Create a validator with the given thresholds
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        let tracks = Metric::ALL
            .iter()
            .map(|metric| Track::new(*metric, config.outlier_window))
            .collect();
        Self {
            config,
            tracks,
            pending: VecDeque::new(),
            next_index: 0,
            stats: ValidationStats::default(),
        }
    }

    /// Validate one sample, returning every sample that is now final
    pub fn push(&mut self, mut sample: MetricSample) -> Vec<MetricSample> {
        let index = self.next_index;
        self.next_index += 1;
        self.stats.total += 1;

        for track in &mut self.tracks {
            check_metric(
                &self.config,
                track,
                &mut self.pending,
                &mut self.stats,
                index,
                &mut sample,
            );
        }

        self.pending.push_back(sample);
        self.release()
    }

    /// Close every open gap as unfilled and return all withheld samples
    pub fn flush(&mut self) -> Vec<MetricSample> {
        self.close_open_gaps();
        self.pending.drain(..).collect()
    }

    /// Account for frames lost by the transport
    ///
    /// A loss longer than `max_gap_samples` cannot be interpolated across, so
    /// open gaps are closed as unfilled and their samples released.
    pub fn note_transport_gap(&mut self, missed: usize) -> Vec<MetricSample> {
        if missed <= self.config.max_gap_samples {
            return Vec::new();
        }
        warn!("Transport lost {missed} frames, closing open gaps");
        self.close_open_gaps();
        for track in &mut self.tracks {
            if track.last.is_some() {
                track.gap = Gap::Unfilled;
            }
        }
        self.release()
    }

    /// Counters accumulated so far
    #[must_use]
    pub const fn stats(&self) -> ValidationStats {
        self.stats
    }

    /// Samples currently withheld behind an open gap
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn front_index(&self) -> u64 {
        self.next_index - self.pending.len() as u64
    }

    fn close_open_gaps(&mut self) {
        let front = self.front_index();
        for track in &mut self.tracks {
            if let Gap::Open { start } = track.gap {
                mark_unfilled(
                    &mut self.pending,
                    &mut self.stats,
                    track.metric,
                    front,
                    start..self.next_index,
                );
                track.gap = Gap::Unfilled;
            }
        }
    }

    fn release(&mut self) -> Vec<MetricSample> {
        let hold = self
            .tracks
            .iter()
            .filter_map(|track| match track.gap {
                Gap::Open { start } => Some(start),
                _ => None,
            })
            .min()
            .unwrap_or(self.next_index);

        let releasable = usize::try_from(hold.saturating_sub(self.front_index()))
            .unwrap_or(usize::MAX)
            .min(self.pending.len());
        self.pending.drain(..releasable).collect()
    }
}

fn in_range(config: &ValidatorConfig, metric: Metric, value: f64) -> bool {
    let (min, max) = match metric {
        Metric::Power => (config.power_min, config.power_max),
        Metric::Cadence => (0.0, config.cadence_max),
        Metric::StrokeRate => (0.0, config.stroke_rate_max),
        Metric::Pace => (config.pace_min, config.pace_max),
        Metric::Speed => (0.0, config.speed_max_kmh),
        Metric::Distance => (0.0, f64::MAX),
        Metric::HeartRate => (config.heart_rate_min, config.heart_rate_max),
    };
    (min..=max).contains(&value)
}

fn has_warning(sample: &MetricSample, metric: Metric, kind: fn(&ValidationWarning) -> Option<Metric>) -> bool {
    sample.warnings.iter().any(|w| kind(w) == Some(metric))
}

const fn interpolated_metric(warning: &ValidationWarning) -> Option<Metric> {
    match warning {
        ValidationWarning::Interpolated { metric, .. } => Some(*metric),
        _ => None,
    }
}

const fn corrected_metric(warning: &ValidationWarning) -> Option<Metric> {
    match warning {
        ValidationWarning::OutlierCorrected { metric, .. } => Some(*metric),
        _ => None,
    }
}

const fn unfilled_metric(warning: &ValidationWarning) -> Option<Metric> {
    match warning {
        ValidationWarning::DataGapUnfilled { metric } => Some(*metric),
        _ => None,
    }
}

fn check_metric(
    config: &ValidatorConfig,
    track: &mut Track,
    pending: &mut VecDeque<MetricSample>,
    stats: &mut ValidationStats,
    index: u64,
    sample: &mut MetricSample,
) {
    let metric = track.metric;
    let mut value = sample.metric(metric);

    if let Some(v) = value.filter(|v| !in_range(config, metric, *v)) {
        debug!("Removing out-of-range {metric} value {v}");
        sample.set_metric(metric, None);
        sample.annotate(
            ValidationWarning::OutOfRange { metric, value: v },
            DataQuality::Good,
        );
        stats.out_of_range += 1;
        value = None;
    }

    let front = index - pending.len() as u64;
    match value {
        Some(v) => {
            let accepted = if has_warning(sample, metric, interpolated_metric) {
                v
            } else if has_warning(sample, metric, corrected_metric) {
                track.remember(v, config.outlier_window);
                v
            } else {
                let accepted = match track.replacement(v, sample.timestamp, config) {
                    Some(estimate) => {
                        sample.set_metric(metric, Some(estimate));
                        let replacement = sample.metric(metric).unwrap_or(estimate);
                        debug!("Replacing {metric} outlier {v} with {replacement}");
                        sample.annotate(
                            ValidationWarning::OutlierCorrected {
                                metric,
                                original: v,
                                replacement,
                            },
                            DataQuality::Estimated,
                        );
                        stats.outliers_corrected += 1;
                        replacement
                    }
                    None => {
                        track.good = Some((sample.timestamp, v));
                        v
                    }
                };
                track.remember(accepted, config.outlier_window);
                accepted
            };

            if let (Gap::Open { start }, Some((last_index, last_value))) = (track.gap, track.last) {
                interpolate(
                    pending,
                    stats,
                    metric,
                    front,
                    start..index,
                    (last_index, last_value),
                    (index, accepted),
                );
            }
            track.gap = Gap::Closed;
            track.last = Some((index, accepted));
        }
        None if track.last.is_none() => {}
        None => {
            let forced = has_warning(sample, metric, unfilled_metric);
            track.gap = match track.gap {
                Gap::Closed => Gap::Open { start: index },
                other => other,
            };

            if let Gap::Open { start } = track.gap {
                let length = index - start + 1;
                if forced || length > config.max_gap_samples as u64 {
                    mark_unfilled(pending, stats, metric, front, start..index);
                    track.gap = Gap::Unfilled;
                }
            }

            if track.gap == Gap::Unfilled {
                sample.annotate(ValidationWarning::DataGapUnfilled { metric }, DataQuality::Good);
                stats.unfilled += 1;
            }
        }
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn interpolate(
    pending: &mut VecDeque<MetricSample>,
    stats: &mut ValidationStats,
    metric: Metric,
    front: u64,
    gap: std::ops::Range<u64>,
    (from_index, from_value): (u64, f64),
    (to_index, to_value): (u64, f64),
) {
    let span = (to_index - from_index) as f64;
    for index in gap {
        let Some(sample) = pending.get_mut((index - front) as usize) else {
            continue;
        };
        let fraction = (index - from_index) as f64 / span;
        sample.set_metric(metric, Some((to_value - from_value).mul_add(fraction, from_value)));
        let value = sample.metric(metric).unwrap_or(from_value);
        sample.annotate(
            ValidationWarning::Interpolated { metric, value },
            DataQuality::Interpolated,
        );
        stats.interpolated += 1;
    }
    debug!("Interpolated {metric} across samples {from_index}..{to_index}");
}

#[allow(clippy::cast_possible_truncation)]
fn mark_unfilled(
    pending: &mut VecDeque<MetricSample>,
    stats: &mut ValidationStats,
    metric: Metric,
    front: u64,
    gap: std::ops::Range<u64>,
) {
    for index in gap {
        if let Some(sample) = pending.get_mut((index - front) as usize) {
            sample.annotate(ValidationWarning::DataGapUnfilled { metric }, DataQuality::Good);
            stats.unfilled += 1;
        }
    }
}
