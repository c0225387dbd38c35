use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::Instant};

use crate::error::ValidationWarning;

/// Exercise machine class carried by an FTMS data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineClass {
    /// Stationary bike (Indoor Bike Data)
    Bike,
    /// Rowing machine (Rower Data)
    Rower,
}

impl fmt::Display for MachineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bike => write!(f, "Bike"),
            Self::Rower => write!(f, "Rower"),
        }
    }
}

/// Kind of notification frame delivered by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// FTMS Indoor Bike Data (0x2AD2)
    IndoorBikeData,
    /// FTMS Rower Data (0x2AD1)
    RowerData,
    /// Heart Rate Measurement (0x2A37)
    HeartRateMeasurement,
}

impl FrameKind {
    /// 16-bit assigned number of the characteristic carrying this frame kind
    #[must_use]
    pub const fn characteristic(self) -> u16 {
        match self {
            Self::IndoorBikeData => 0x2AD2,
            Self::RowerData => 0x2AD1,
            Self::HeartRateMeasurement => 0x2A37,
        }
    }

    /// Look up the frame kind for a 16-bit characteristic number
    #[must_use]
    pub const fn from_characteristic(characteristic: u16) -> Option<Self> {
        match characteristic {
            0x2AD2 => Some(Self::IndoorBikeData),
            0x2AD1 => Some(Self::RowerData),
            0x2A37 => Some(Self::HeartRateMeasurement),
            _ => None,
        }
    }

    /// Machine class decoded from this frame kind, if it carries machine data
    #[must_use]
    pub const fn machine_class(self) -> Option<MachineClass> {
        match self {
            Self::IndoorBikeData => Some(MachineClass::Bike),
            Self::RowerData => Some(MachineClass::Rower),
            Self::HeartRateMeasurement => None,
        }
    }
}

impl From<MachineClass> for FrameKind {
    fn from(class: MachineClass) -> Self {
        match class {
            MachineClass::Bike => Self::IndoorBikeData,
            MachineClass::Rower => Self::RowerData,
        }
    }
}

/// Metric checked and corrected by the sample validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Instantaneous power
    Power,
    /// Instantaneous cadence
    Cadence,
    /// Instantaneous stroke rate
    StrokeRate,
    /// Instantaneous rowing pace
    Pace,
    /// Instantaneous speed
    Speed,
    /// Total distance counter
    Distance,
    /// Heart rate
    HeartRate,
}

impl Metric {
    /// Every validated metric, in processing order
    ///
    /// Pace comes before speed because a rower's speed is derived from it.
    pub const ALL: [Self; 7] = [
        Self::Power,
        Self::Cadence,
        Self::StrokeRate,
        Self::Pace,
        Self::Speed,
        Self::Distance,
        Self::HeartRate,
    ];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power => write!(f, "power"),
            Self::Cadence => write!(f, "cadence"),
            Self::StrokeRate => write!(f, "stroke_rate"),
            Self::Pace => write!(f, "pace"),
            Self::Speed => write!(f, "speed"),
            Self::Distance => write!(f, "distance"),
            Self::HeartRate => write!(f, "heart_rate"),
        }
    }
}

/// Data quality marker, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DataQuality {
    /// Value as decoded
    #[default]
    Good,
    /// At least one value was filled by interpolation
    Interpolated,
    /// At least one value was replaced by an estimate
    Estimated,
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Interpolated => write!(f, "Interpolated"),
            Self::Estimated => write!(f, "Estimated"),
        }
    }
}

/// Workout phase tracked by the session aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No sample accepted yet
    NotStarted,
    /// Warm-up
    WarmUp,
    /// Main effort
    Main,
    /// Cool-down
    Cooldown,
    /// Session closed
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "Not Started"),
            Self::WarmUp => write!(f, "Warm-up"),
            Self::Main => write!(f, "Main"),
            Self::Cooldown => write!(f, "Cool-down"),
            Self::Ended => write!(f, "Ended"),
        }
    }
}

/// One decoded instant of machine telemetry
///
/// Fields are `None` unless the frame's flag header announced them. Values
/// are stored in engineering units: the wire resolution (0.5 rpm, 0.01 km/h,
/// 0.1 MET) is applied at decode time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    /// Machine class that produced the sample
    pub machine_class: MachineClass,
    /// Monotonic decode instant, never taken from the wire
    #[serde(skip)]
    pub timestamp: Instant,
    /// Instantaneous power in watts
    pub instantaneous_power: Option<i16>,
    /// Average power in watts
    pub average_power: Option<i16>,
    /// Instantaneous cadence in rpm
    pub cadence: Option<f64>,
    /// Average cadence in rpm
    pub average_cadence: Option<f64>,
    /// Stroke rate in strokes per minute
    pub stroke_rate: Option<f64>,
    /// Average stroke rate in strokes per minute
    pub average_stroke_rate: Option<f64>,
    /// Stroke counter since the start of the workout
    pub stroke_count: Option<u16>,
    /// Instantaneous speed in km/h, derived from `pace` on rowers
    pub speed: Option<f64>,
    /// Instantaneous speed in m/s, derived from `speed`
    pub speed_mps: Option<f64>,
    /// Average speed in km/h
    pub average_speed: Option<f64>,
    /// Total distance counter in meters
    pub total_distance: Option<u32>,
    /// Instantaneous pace in seconds per 500 m
    pub pace: Option<u16>,
    /// Average pace in seconds per 500 m
    pub average_pace: Option<u16>,
    /// Resistance level as reported (unitless)
    pub resistance_level: Option<i16>,
    /// Total energy in kcal
    pub total_energy: Option<u16>,
    /// Energy per hour in kcal
    pub energy_per_hour: Option<u16>,
    /// Energy per minute in kcal
    pub energy_per_minute: Option<u8>,
    /// Heart rate in bpm
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time in seconds as reported by the machine
    pub elapsed_time: Option<u16>,
    /// Remaining time in seconds as reported by the machine
    pub remaining_time: Option<u16>,
    /// Quality marker set by the validator
    pub quality: DataQuality,
    /// Corrections applied by the validator
    pub warnings: Vec<ValidationWarning>,
}

impl MetricSample {
    /// Create an empty sample for the given machine class
    #[must_use]
    pub const fn new(machine_class: MachineClass, timestamp: Instant) -> Self {
        Self {
            machine_class,
            timestamp,
            instantaneous_power: None,
            average_power: None,
            cadence: None,
            average_cadence: None,
            stroke_rate: None,
            average_stroke_rate: None,
            stroke_count: None,
            speed: None,
            speed_mps: None,
            average_speed: None,
            total_distance: None,
            pace: None,
            average_pace: None,
            resistance_level: None,
            total_energy: None,
            energy_per_hour: None,
            energy_per_minute: None,
            heart_rate: None,
            metabolic_equivalent: None,
            elapsed_time: None,
            remaining_time: None,
            quality: DataQuality::Good,
            warnings: Vec::new(),
        }
    }

    /// Set instantaneous speed in km/h, keeping the m/s value in step
    pub fn set_speed(&mut self, kmh: Option<f64>) {
        self.speed = kmh;
        self.speed_mps = kmh.map(|v| v / 3.6);
    }

    /// Set instantaneous pace in seconds per 500 m
    ///
    /// Rowers report pace instead of speed, so on a rower the speed follows:
    /// 500 m per `pace` seconds, absent for a zero pace.
    pub fn set_pace(&mut self, pace: Option<u16>) {
        self.pace = pace;
        if self.machine_class == MachineClass::Rower {
            self.set_speed(pace.filter(|p| *p > 0).map(|p| 1800.0 / f64::from(p)));
        }
    }

    /// Read a validated metric as a float
    #[must_use]
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Power => self.instantaneous_power.map(f64::from),
            Metric::Cadence => self.cadence,
            Metric::StrokeRate => self.stroke_rate,
            Metric::Pace => self.pace.map(f64::from),
            Metric::Speed => self.speed,
            Metric::Distance => self.total_distance.map(f64::from),
            Metric::HeartRate => self.heart_rate.map(f64::from),
        }
    }

    /// Overwrite a validated metric, rounding to the field's wire resolution
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_metric(&mut self, metric: Metric, value: Option<f64>) {
        match metric {
            Metric::Power => {
                self.instantaneous_power = value.map(|v| {
                    v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
                });
            }
            Metric::Cadence => self.cadence = value.map(|v| round_to(v, 0.5)),
            Metric::StrokeRate => self.stroke_rate = value.map(|v| round_to(v, 0.5)),
            Metric::Pace => {
                self.set_pace(value.map(|v| v.round().clamp(0.0, f64::from(u16::MAX)) as u16));
            }
            Metric::Speed => self.set_speed(value.map(|v| round_to(v, 0.01))),
            Metric::Distance => {
                self.total_distance =
                    value.map(|v| v.round().clamp(0.0, f64::from(u32::MAX)) as u32);
            }
            Metric::HeartRate => {
                self.heart_rate = value.map(|v| v.round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    /// Record a validator correction, raising the quality marker if needed
    ///
    /// Duplicate warnings are ignored and quality never goes back down.
    pub fn annotate(&mut self, warning: ValidationWarning, quality: DataQuality) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
        self.quality = self.quality.max(quality);
    }
}

fn round_to(value: f64, resolution: f64) -> f64 {
    (value / resolution).round() * resolution
}

/// Per-phase breakdown of a finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    /// Phase covered
    pub phase: Phase,
    /// Elapsed offset at which the phase began
    pub start_offset: Duration,
    /// Length of the phase
    pub duration: Duration,
    /// Samples recorded during the phase
    pub sample_count: usize,
    /// Average power during the phase, used as its intensity
    pub average_power: Option<f64>,
}

/// Immutable statistics of a finished session
///
/// Any statistic that had no contributing samples is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Machine class of the session
    pub machine_class: MachineClass,
    /// Wall-clock time of the first sample
    pub started_at: DateTime<Utc>,
    /// Offset of the last sample
    pub duration: Duration,
    /// Number of samples in the session
    pub sample_count: usize,
    /// Total distance in meters
    pub total_distance: Option<f64>,
    /// True when `total_distance` was integrated from speed
    pub distance_estimated: bool,
    /// Total energy in kcal
    pub total_energy: Option<u16>,
    /// Mean instantaneous power in watts
    pub average_power: Option<f64>,
    /// Peak instantaneous power in watts
    pub max_power: Option<f64>,
    /// Mean heart rate in bpm
    pub average_heart_rate: Option<f64>,
    /// Peak heart rate in bpm
    pub max_heart_rate: Option<f64>,
    /// Mean cadence in rpm (bike)
    pub average_cadence: Option<f64>,
    /// Peak cadence in rpm (bike)
    pub max_cadence: Option<f64>,
    /// Mean stroke rate in strokes per minute (rower)
    pub average_stroke_rate: Option<f64>,
    /// Peak stroke rate in strokes per minute (rower)
    pub max_stroke_rate: Option<f64>,
    /// Mean speed in km/h
    pub average_speed: Option<f64>,
    /// Peak speed in km/h
    pub max_speed: Option<f64>,
    /// Strokes in the session (rower)
    pub total_strokes: Option<u32>,
    /// Phase breakdown in chronological order
    pub phases: Vec<PhaseSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_characteristics() {
        for kind in [
            FrameKind::IndoorBikeData,
            FrameKind::RowerData,
            FrameKind::HeartRateMeasurement,
        ] {
            assert_eq!(FrameKind::from_characteristic(kind.characteristic()), Some(kind));
        }
        assert_eq!(FrameKind::from_characteristic(0x2ACD), None);
        assert_eq!(
            FrameKind::IndoorBikeData.machine_class(),
            Some(MachineClass::Bike)
        );
        assert_eq!(FrameKind::HeartRateMeasurement.machine_class(), None);
        assert_eq!(FrameKind::from(MachineClass::Rower), FrameKind::RowerData);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(DataQuality::Good < DataQuality::Interpolated);
        assert!(DataQuality::Interpolated < DataQuality::Estimated);
    }

    #[test]
    fn test_set_speed_keeps_mps() {
        let mut sample = MetricSample::new(MachineClass::Bike, Instant::now());
        sample.set_speed(Some(36.0));
        assert!((sample.speed_mps.unwrap() - 10.0).abs() < 1e-9);

        sample.set_metric(Metric::Speed, None);
        assert!(sample.speed.is_none());
        assert!(sample.speed_mps.is_none());
    }

    #[test]
    fn test_set_metric_rounds_to_resolution() {
        let mut sample = MetricSample::new(MachineClass::Bike, Instant::now());
        sample.set_metric(Metric::Power, Some(149.6));
        sample.set_metric(Metric::Cadence, Some(80.3));
        sample.set_metric(Metric::HeartRate, Some(300.0));

        assert_eq!(sample.instantaneous_power, Some(150));
        assert_eq!(sample.cadence, Some(80.5));
        assert_eq!(sample.heart_rate, Some(255));
    }

    #[test]
    fn test_rower_speed_follows_pace() {
        let mut sample = MetricSample::new(MachineClass::Rower, Instant::now());
        sample.set_pace(Some(120));
        assert!((sample.speed.unwrap() - 15.0).abs() < 1e-9);
        assert!((sample.speed_mps.unwrap() - 500.0 / 120.0).abs() < 1e-9);

        sample.set_metric(Metric::Pace, Some(99.6));
        assert_eq!(sample.pace, Some(100));
        assert!((sample.speed_mps.unwrap() - 5.0).abs() < 1e-9);

        sample.set_pace(Some(0));
        assert_eq!(sample.speed, None);

        let mut bike = MetricSample::new(MachineClass::Bike, Instant::now());
        bike.set_speed(Some(30.0));
        bike.set_pace(Some(120));
        assert_eq!(bike.speed, Some(30.0));
    }

    #[test]
    fn test_distance_metric_rounds_to_meters() {
        let mut sample = MetricSample::new(MachineClass::Bike, Instant::now());
        sample.set_metric(Metric::Distance, Some(1234.6));
        assert_eq!(sample.total_distance, Some(1235));
        assert_eq!(sample.metric(Metric::Distance), Some(1235.0));

        sample.set_metric(Metric::Distance, Some(-3.0));
        assert_eq!(sample.total_distance, Some(0));
    }

    #[test]
    fn test_annotate_never_downgrades() {
        let mut sample = MetricSample::new(MachineClass::Rower, Instant::now());
        let warning = ValidationWarning::DataGapUnfilled {
            metric: Metric::StrokeRate,
        };

        sample.annotate(warning.clone(), DataQuality::Estimated);
        sample.annotate(warning, DataQuality::Interpolated);

        assert_eq!(sample.warnings.len(), 1);
        assert_eq!(sample.quality, DataQuality::Estimated);
    }
}
