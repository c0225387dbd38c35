use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::error::ConfigError;

/// Complete pipeline configuration
///
/// Every section falls back to its documented defaults, so a JSON document
/// only needs to name the values it changes:
///
/// ```
/// use ftms_fit_bridge::PipelineConfig;
///
/// let config = PipelineConfig::from_json_str(r#"{ "validator": { "max_gap_samples": 5 } }"#)?;
/// assert_eq!(config.validator.max_gap_samples, 5);
/// assert_eq!(config.phases.warmup_force_secs, 600);
/// # Ok::<(), ftms_fit_bridge::error::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sample validator thresholds
    pub validator: ValidatorConfig,
    /// Phase detection thresholds
    pub phases: PhaseConfig,
    /// Heart-rate merge settings
    pub heart_rate: HeartRateMergeConfig,
    /// Export self-validation tolerances
    pub export: ExportConfig,
}

impl PipelineConfig {
    /// Parse and check a configuration from a JSON string
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and
    /// `ConfigError::Invalid` when the values are inconsistent.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and check a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` when the file cannot be read, otherwise the
    /// same errors as [`PipelineConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every section for inconsistent values
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validator.validate()?;
        self.phases.validate()?;
        self.heart_rate.validate()?;
        self.export.validate()
    }
}

/// Thresholds applied by the sample validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Lowest accepted heart rate in bpm
    pub heart_rate_min: f64,
    /// Highest accepted heart rate in bpm
    pub heart_rate_max: f64,
    /// Lowest accepted power in watts
    pub power_min: f64,
    /// Highest accepted power in watts
    pub power_max: f64,
    /// Cadence ceiling in rpm
    pub cadence_max: f64,
    /// Stroke rate ceiling in strokes per minute
    pub stroke_rate_max: f64,
    /// Speed ceiling in km/h
    pub speed_max_kmh: f64,
    /// Fastest accepted rowing pace in seconds per 500 m
    pub pace_min: f64,
    /// Slowest accepted rowing pace in seconds per 500 m
    pub pace_max: f64,
    /// Largest plausible distance gain in meters per second of elapsed time
    pub distance_max_jump_mps: f64,
    /// Rolling window length for outlier detection
    pub outlier_window: usize,
    /// Standard deviations from the window mean that mark an outlier
    pub outlier_std_multiplier: f64,
    /// Values needed in the window before outliers are corrected
    pub min_samples_for_outlier: usize,
    /// Longest gap, in samples, that is filled by interpolation
    pub max_gap_samples: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            heart_rate_min: 30.0,
            heart_rate_max: 230.0,
            power_min: -50.0,
            power_max: 3000.0,
            cadence_max: 200.0,
            stroke_rate_max: 60.0,
            speed_max_kmh: 80.0,
            pace_min: 60.0,
            pace_max: 600.0,
            distance_max_jump_mps: 1000.0,
            outlier_window: 10,
            outlier_std_multiplier: 3.0,
            min_samples_for_outlier: 10,
            max_gap_samples: 3,
        }
    }
}

impl ValidatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.heart_rate_min >= self.heart_rate_max {
            return Err(invalid("validator.heart_rate_min must be below heart_rate_max"));
        }
        if self.power_min >= self.power_max {
            return Err(invalid("validator.power_min must be below power_max"));
        }
        if self.cadence_max <= 0.0 || self.stroke_rate_max <= 0.0 || self.speed_max_kmh <= 0.0 {
            return Err(invalid("validator ceilings must be positive"));
        }
        if self.pace_min <= 0.0 || self.pace_min >= self.pace_max {
            return Err(invalid("validator.pace_min must be positive and below pace_max"));
        }
        if self.distance_max_jump_mps <= 0.0 {
            return Err(invalid("validator.distance_max_jump_mps must be positive"));
        }
        if self.outlier_std_multiplier <= 0.0 {
            return Err(invalid("validator.outlier_std_multiplier must be positive"));
        }
        if self.min_samples_for_outlier < 2 || self.min_samples_for_outlier > self.outlier_window {
            return Err(invalid(
                "validator.min_samples_for_outlier must be between 2 and outlier_window",
            ));
        }
        Ok(())
    }
}

/// Thresholds driving the warm-up / main / cool-down state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Earliest elapsed second at which warm-up may end on power
    pub warmup_min_secs: u64,
    /// Power in watts that ends warm-up once `warmup_min_secs` has passed
    pub warmup_power_threshold: f64,
    /// Elapsed second at which warm-up ends regardless of power
    pub warmup_force_secs: u64,
    /// Elapsed second after which a low power reading starts the cool-down
    pub cooldown_after_secs: u64,
    /// Power in watts below which the cool-down starts
    pub cooldown_power_threshold: f64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            warmup_min_secs: 300,
            warmup_power_threshold: 150.0,
            warmup_force_secs: 600,
            cooldown_after_secs: 1800,
            cooldown_power_threshold: 100.0,
        }
    }
}

impl PhaseConfig {
    /// Earliest warm-up exit as a duration
    #[must_use]
    pub const fn warmup_min(&self) -> Duration {
        Duration::from_secs(self.warmup_min_secs)
    }

    /// Forced warm-up exit as a duration
    #[must_use]
    pub const fn warmup_force(&self) -> Duration {
        Duration::from_secs(self.warmup_force_secs)
    }

    /// Cool-down eligibility as a duration
    #[must_use]
    pub const fn cooldown_after(&self) -> Duration {
        Duration::from_secs(self.cooldown_after_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.warmup_min_secs > self.warmup_force_secs {
            return Err(invalid("phases.warmup_min_secs must not exceed warmup_force_secs"));
        }
        if self.warmup_force_secs > self.cooldown_after_secs {
            return Err(invalid(
                "phases.warmup_force_secs must not exceed cooldown_after_secs",
            ));
        }
        Ok(())
    }
}

/// Heart-rate strap merge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartRateMergeConfig {
    /// Largest time difference, in milliseconds, between a strap reading and
    /// the machine sample it is merged into
    pub max_skew_ms: u64,
    /// Readings kept in the merge buffer
    pub buffer_capacity: usize,
}

impl Default for HeartRateMergeConfig {
    fn default() -> Self {
        Self {
            max_skew_ms: 2_000,
            buffer_capacity: 32,
        }
    }
}

impl HeartRateMergeConfig {
    /// Maximum skew as a duration
    #[must_use]
    pub const fn max_skew(&self) -> Duration {
        Duration::from_millis(self.max_skew_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(invalid("heart_rate.buffer_capacity must be positive"));
        }
        Ok(())
    }
}

/// Tolerances for the exporter's self-validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Allowed difference between session and record distance, in meters
    pub distance_tolerance_m: f64,
    /// Allowed difference between session and record calories, in kcal
    pub calorie_tolerance_kcal: f64,
    /// Allowed difference between session and record mean power, in watts
    pub power_tolerance_w: f64,
    /// Record count below which the report carries a warning
    pub min_records: usize,
    /// Offset of the local wall clock east of UTC, in seconds
    ///
    /// Used for the activity's `local_timestamp`. The system time zone applies
    /// when unset.
    pub utc_offset_secs: Option<i32>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            distance_tolerance_m: 1.0,
            calorie_tolerance_kcal: 1.0,
            power_tolerance_w: 1.0,
            min_records: 10,
            utc_offset_secs: None,
        }
    }
}

impl ExportConfig {
    /// Local wall-clock offset in effect at `time`
    #[must_use]
    pub fn utc_offset_at(&self, time: DateTime<Utc>) -> FixedOffset {
        self.utc_offset_secs
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Local.offset_from_utc_datetime(&time.naive_utc()).fix())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self
            .utc_offset_secs
            .is_some_and(|secs| FixedOffset::east_opt(secs).is_none())
        {
            return Err(invalid("export.utc_offset_secs must be within one day"));
        }
        if self.distance_tolerance_m < 0.0
            || self.calorie_tolerance_kcal < 0.0
            || self.power_tolerance_w < 0.0
        {
            return Err(invalid("export tolerances must not be negative"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();

        assert!((config.validator.heart_rate_min - 30.0).abs() < f64::EPSILON);
        assert!((config.validator.heart_rate_max - 230.0).abs() < f64::EPSILON);
        assert_eq!(config.validator.outlier_window, 10);
        assert_eq!(config.validator.max_gap_samples, 3);
        assert_eq!(config.phases.warmup_min(), Duration::from_secs(300));
        assert_eq!(config.phases.warmup_force(), Duration::from_secs(600));
        assert_eq!(config.phases.cooldown_after(), Duration::from_secs(1800));
        assert_eq!(config.heart_rate.max_skew(), Duration::from_secs(2));
        assert!((config.validator.pace_min - 60.0).abs() < f64::EPSILON);
        assert!((config.validator.pace_max - 600.0).abs() < f64::EPSILON);
        assert!((config.validator.distance_max_jump_mps - 1000.0).abs() < f64::EPSILON);
        assert_eq!(config.export.utc_offset_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "phases": { "warmup_power_threshold": 180.0 },
            "export": { "min_records": 3 }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();

        assert!((config.phases.warmup_power_threshold - 180.0).abs() < f64::EPSILON);
        assert_eq!(config.phases.warmup_min_secs, 300);
        assert_eq!(config.export.min_records, 3);
        assert_eq!(config.validator, ValidatorConfig::default());
    }

    #[test]
    fn test_inconsistent_values_rejected() {
        let result = PipelineConfig::from_json_str(
            r#"{ "phases": { "warmup_min_secs": 700, "warmup_force_secs": 600 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result =
            PipelineConfig::from_json_str(r#"{ "validator": { "outlier_std_multiplier": 0.0 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = PipelineConfig::from_json_str(
            r#"{ "validator": { "pace_min": 300.0, "pace_max": 200.0 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result =
            PipelineConfig::from_json_str(r#"{ "validator": { "distance_max_jump_mps": 0.0 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = PipelineConfig::from_json_str(r#"{ "export": { "utc_offset_secs": 90000 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_fixed_utc_offset() {
        let config =
            PipelineConfig::from_json_str(r#"{ "export": { "utc_offset_secs": -18000 } }"#).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 11, 5, 18, 0, 0).unwrap();
        assert_eq!(config.export.utc_offset_at(at).local_minus_utc(), -18_000);
    }

    #[test]
    fn test_malformed_json() {
        let result = PipelineConfig::from_json_str("{ validator: ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_path_missing_file() {
        let result = PipelineConfig::from_path("/nonexistent/bridge-config.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
