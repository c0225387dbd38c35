use crate::{
    config::PhaseConfig,
    error::AggregationError,
    types::{MachineClass, MetricSample, Phase, PhaseSummary, SessionSummary},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// O(1) running statistics for one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: Option<f64>,
    max: Option<f64>,
    last: Option<f64>,
}

impl RunningStats {
    /// No observations, usable in `const` contexts
    pub const EMPTY: Self = Self {
        count: 0,
        sum: 0.0,
        sum_sq: 0.0,
        min: None,
        max: None,
        last: None,
    };

    /// Add one observation
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.last = Some(value);
    }

    /// Add an observation when one is present
    pub fn push_opt(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.push(value);
        }
    }

    /// Number of observations
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all observations
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population standard deviation
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self.sum_sq / self.count as f64 - mean * mean;
        Some(variance.max(0.0).sqrt())
    }

    /// Smallest observation
    #[must_use]
    pub const fn min(&self) -> Option<f64> {
        self.min
    }

    /// Largest observation
    #[must_use]
    pub const fn max(&self) -> Option<f64> {
        self.max
    }

    /// Most recent observation
    #[must_use]
    pub const fn last(&self) -> Option<f64> {
        self.last
    }
}

/// A cleaned sample and its offset from the session start
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSample {
    /// Elapsed time since the first sample
    pub offset: Duration,
    /// The sample itself
    pub sample: MetricSample,
}

/// Ordered cleaned samples of one workout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutSession {
    machine_class: MachineClass,
    started_at: DateTime<Utc>,
    samples: Vec<SessionSample>,
}

impl WorkoutSession {
    /// Build a session from samples already in offset order
    ///
    /// Offsets are clamped so they never decrease.
    #[must_use]
    pub fn new(
        machine_class: MachineClass,
        started_at: DateTime<Utc>,
        mut samples: Vec<SessionSample>,
    ) -> Self {
        let mut floor = Duration::ZERO;
        for entry in &mut samples {
            entry.offset = entry.offset.max(floor);
            floor = entry.offset;
        }
        Self {
            machine_class,
            started_at,
            samples,
        }
    }

    /// Machine class of every sample
    #[must_use]
    pub const fn machine_class(&self) -> MachineClass {
        self.machine_class
    }

    /// Wall-clock time of the first sample
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Samples in offset order
    #[must_use]
    pub fn samples(&self) -> &[SessionSample] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the session holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Offset of the last sample
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.samples.last().map_or(Duration::ZERO, |s| s.offset)
    }

    /// Cumulative distance in meters at each sample
    ///
    /// Uses the machine's distance counter when it ever reported one.
    /// Otherwise distance is integrated from speed, each interval using the
    /// speed of the sample that opens it. Without either, every entry is
    /// `None`.
    #[must_use]
    pub fn distance_track(&self) -> Vec<Option<f64>> {
        if self.samples.iter().any(|s| s.sample.total_distance.is_some()) {
            return self
                .samples
                .iter()
                .map(|s| s.sample.total_distance.map(f64::from))
                .collect();
        }
        if !self.samples.iter().any(|s| s.sample.speed_mps.is_some()) {
            return vec![None; self.samples.len()];
        }

        let mut track = Vec::with_capacity(self.samples.len());
        let mut distance = 0.0;
        let mut previous: Option<&SessionSample> = None;
        for entry in &self.samples {
            if let Some(prev) = previous {
                let dt = entry.offset.saturating_sub(prev.offset).as_secs_f64();
                distance += prev.sample.speed_mps.unwrap_or(0.0) * dt;
            }
            track.push(Some(distance));
            previous = Some(entry);
        }
        track
    }

    /// Whether `distance_track` integrates speed rather than reporting a counter
    #[must_use]
    pub fn distance_estimated(&self) -> bool {
        !self.samples.iter().any(|s| s.sample.total_distance.is_some())
            && self.samples.iter().any(|s| s.sample.speed_mps.is_some())
    }
}

/// A phase change and the elapsed offset it happened at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    /// Phase left
    pub from: Phase,
    /// Phase entered
    pub to: Phase,
    /// Elapsed offset of the triggering sample
    pub at: Duration,
}

/// Output of a successful finalize
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedSession {
    /// Read-only sample sequence
    pub session: WorkoutSession,
    /// Statistics computed over it
    pub summary: SessionSummary,
}

#[derive(Debug, Clone)]
struct PhaseSpan {
    phase: Phase,
    start: Duration,
    samples: usize,
    power: RunningStats,
}

/// Streaming phase detector and session aggregator
///
/// Owns the session while it is running. Each accepted sample advances the
/// phase state machine and updates the running statistics in constant time.
#[derive(Debug, Clone)]
pub struct SessionAggregator {
    config: PhaseConfig,
    machine_class: MachineClass,
    phase: Phase,
    origin: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    samples: Vec<SessionSample>,
    transitions: Vec<PhaseTransition>,
    spans: Vec<PhaseSpan>,
    power: RunningStats,
    heart_rate: RunningStats,
    cadence: RunningStats,
    stroke_rate: RunningStats,
    speed: RunningStats,
    total_energy: Option<u16>,
    stroke_count: Option<u16>,
}

impl SessionAggregator {
    /// Create an aggregator for one machine class
    #[must_use]
    pub const fn new(machine_class: MachineClass, config: PhaseConfig) -> Self {
        Self {
            config,
            machine_class,
            phase: Phase::NotStarted,
            origin: None,
            started_at: None,
            samples: Vec::new(),
            transitions: Vec::new(),
            spans: Vec::new(),
            power: RunningStats::EMPTY,
            heart_rate: RunningStats::EMPTY,
            cadence: RunningStats::EMPTY,
            stroke_rate: RunningStats::EMPTY,
            speed: RunningStats::EMPTY,
            total_energy: None,
            stroke_count: None,
        }
    }

    /// Fix the wall-clock start instead of reading the clock on the first sample
    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Machine class accepted by this session
    #[must_use]
    pub const fn machine_class(&self) -> MachineClass {
        self.machine_class
    }

    /// Every transition so far
    #[must_use]
    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// Number of accepted samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Running power statistics
    #[must_use]
    pub const fn power_stats(&self) -> &RunningStats {
        &self.power
    }

    /// Accept one cleaned sample
    ///
    /// Returns the phase transitions the sample triggered, usually none.
    ///
    /// # Errors
    ///
    /// - `AggregationError::SessionEnded` once the session has ended
    /// - `AggregationError::MachineClassMismatch` for a sample of another class
    pub fn ingest(
        &mut self,
        sample: MetricSample,
    ) -> Result<Vec<PhaseTransition>, AggregationError> {
        if self.phase == Phase::Ended {
            return Err(AggregationError::SessionEnded);
        }
        if sample.machine_class != self.machine_class {
            return Err(AggregationError::MachineClassMismatch {
                expected: self.machine_class,
                found: sample.machine_class,
            });
        }

        let origin = *self.origin.get_or_insert(sample.timestamp);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        let floor = self.samples.last().map_or(Duration::ZERO, |s| s.offset);
        let offset = sample.timestamp.saturating_duration_since(origin).max(floor);

        let transitions = self.advance_phase(offset, sample.instantaneous_power);

        // negative power (braking) counts as zero in every average
        let power = sample.instantaneous_power.map(|p| f64::from(p.max(0)));
        self.power.push_opt(power);
        self.heart_rate.push_opt(sample.heart_rate.map(f64::from));
        self.cadence.push_opt(sample.cadence);
        self.stroke_rate.push_opt(sample.stroke_rate);
        self.speed.push_opt(sample.speed);
        if sample.total_energy.is_some() {
            self.total_energy = sample.total_energy;
        }
        if sample.stroke_count.is_some() {
            self.stroke_count = sample.stroke_count;
        }
        if let Some(span) = self.spans.last_mut() {
            span.samples += 1;
            span.power.push_opt(power);
        }

        self.samples.push(SessionSample { offset, sample });
        Ok(transitions)
    }

    /// End the session
    ///
    /// Returns the transition into `Ended`, or `None` if it had already ended.
    pub fn end(&mut self) -> Option<PhaseTransition> {
        if self.phase == Phase::Ended {
            return None;
        }
        let at = self.samples.last().map_or(Duration::ZERO, |s| s.offset);
        Some(self.transition(Phase::Ended, at))
    }

    /// End the session and compute its summary
    ///
    /// # Errors
    ///
    /// Returns `AggregationError::EmptySessionFinalize` when no sample was
    /// ever accepted.
    pub fn finalize(&mut self) -> Result<FinishedSession, AggregationError> {
        self.end();
        let started_at = match self.started_at {
            Some(started_at) if !self.samples.is_empty() => started_at,
            _ => return Err(AggregationError::EmptySessionFinalize),
        };

        let session = WorkoutSession::new(self.machine_class, started_at, self.samples.clone());
        let duration = session.duration();
        let total_distance = session.distance_track().into_iter().flatten().last();

        let phases = self
            .spans
            .iter()
            .enumerate()
            .map(|(i, span)| {
                let end = self.spans.get(i + 1).map_or(duration, |next| next.start);
                PhaseSummary {
                    phase: span.phase,
                    start_offset: span.start,
                    duration: end.saturating_sub(span.start),
                    sample_count: span.samples,
                    average_power: span.power.mean(),
                }
            })
            .collect();

        let summary = SessionSummary {
            machine_class: self.machine_class,
            started_at,
            duration,
            sample_count: session.len(),
            total_distance,
            distance_estimated: session.distance_estimated(),
            total_energy: self.total_energy,
            average_power: self.power.mean(),
            max_power: self.power.max(),
            average_heart_rate: self.heart_rate.mean(),
            max_heart_rate: self.heart_rate.max(),
            average_cadence: self.cadence.mean(),
            max_cadence: self.cadence.max(),
            average_stroke_rate: self.stroke_rate.mean(),
            max_stroke_rate: self.stroke_rate.max(),
            average_speed: self.speed.mean(),
            max_speed: self.speed.max(),
            total_strokes: self.stroke_count.map(u32::from),
            phases,
        };

        info!(
            "Finalized {} session: {} samples over {:?}, average power {:?}",
            self.machine_class, summary.sample_count, summary.duration, summary.average_power
        );

        Ok(FinishedSession { session, summary })
    }

    fn advance_phase(&mut self, offset: Duration, power: Option<i16>) -> Vec<PhaseTransition> {
        let mut transitions = Vec::new();
        if self.phase == Phase::NotStarted {
            transitions.push(self.transition(Phase::WarmUp, offset));
        }

        let watts = power.map(f64::from);
        let next = match self.phase {
            Phase::WarmUp
                if offset >= self.config.warmup_force()
                    || (offset >= self.config.warmup_min()
                        && watts.is_some_and(|p| p > self.config.warmup_power_threshold)) =>
            {
                Some(Phase::Main)
            }
            Phase::Main
                if offset > self.config.cooldown_after()
                    && watts.is_some_and(|p| p < self.config.cooldown_power_threshold) =>
            {
                Some(Phase::Cooldown)
            }
            _ => None,
        };
        if let Some(next) = next {
            transitions.push(self.transition(next, offset));
        }
        transitions
    }

    fn transition(&mut self, to: Phase, at: Duration) -> PhaseTransition {
        let transition = PhaseTransition {
            from: self.phase,
            to,
            at,
        };
        if to == Phase::Ended {
            debug!("Session ended at {at:?}");
        } else {
            info!("Phase {} -> {} at {:?}", self.phase, to, at);
            self.spans.push(PhaseSpan {
                phase: to,
                start: at,
                samples: 0,
                power: RunningStats::EMPTY,
            });
        }
        self.phase = to;
        self.transitions.push(transition);
        transition
    }
}
