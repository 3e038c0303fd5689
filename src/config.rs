use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExposureConfig {
    pub feedback: FeedbackConfig,
    pub recovery: RecoveryConfig,
    pub controller: ControllerConfig,
}

/// Gating parameters for the shutter-priority feedback loop.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct FeedbackConfig {
    /// Minimum time between applied sensitivity adjustments, in milliseconds
    #[serde(default = "default_min_adjustment_interval_ms")]
    pub min_adjustment_interval_ms: u64,

    /// Dead band on the metering offset, in EV units
    #[serde(default = "default_ev_offset_threshold")]
    pub ev_offset_threshold: f32,

    /// Dead band on the relative sensitivity change (0.05 = 5%)
    #[serde(default = "default_iso_change_threshold")]
    pub iso_change_threshold: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct RecoveryConfig {
    /// Maximum number of attempts per operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the backoff delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures before the circuit breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the breaker stays open before a half-open trial, in seconds
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct ControllerConfig {
    /// Suspend the feedback loop entirely while a recording is active
    #[serde(default = "default_freeze_during_capture")]
    pub freeze_during_capture: bool,

    /// Shutter angle to hold across frame-rate changes, as a fraction of the
    /// frame period (0.5 = 180 degrees). None carries durations over exactly.
    pub shutter_angle: Option<f64>,

    /// Capacity of the outward update channel
    #[serde(default = "default_update_bus_capacity")]
    pub update_bus_capacity: usize,
}

impl FeedbackConfig {
    pub fn min_adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.min_adjustment_interval_ms)
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl ExposureConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("exposurectl.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default(
                "feedback.min_adjustment_interval_ms",
                default_min_adjustment_interval_ms(),
            )?
            .set_default(
                "feedback.ev_offset_threshold",
                default_ev_offset_threshold() as f64,
            )?
            .set_default(
                "feedback.iso_change_threshold",
                default_iso_change_threshold() as f64,
            )?
            .set_default("recovery.max_retries", default_max_retries())?
            .set_default("recovery.base_delay_ms", default_base_delay_ms())?
            .set_default("recovery.max_delay_ms", default_max_delay_ms())?
            .set_default("recovery.failure_threshold", default_failure_threshold())?
            .set_default(
                "recovery.recovery_timeout_secs",
                default_recovery_timeout_secs(),
            )?
            .set_default(
                "controller.freeze_during_capture",
                default_freeze_during_capture(),
            )?
            .set_default(
                "controller.update_bus_capacity",
                default_update_bus_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with EXPOSURE_ prefix
            .add_source(Environment::with_prefix("EXPOSURE").separator("_"))
            .build()?;

        let config: ExposureConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feedback.ev_offset_threshold < 0.0 {
            return Err(ConfigError::Message(
                "Feedback ev_offset_threshold must not be negative".to_string(),
            ));
        }

        if self.feedback.iso_change_threshold < 0.0 || self.feedback.iso_change_threshold >= 1.0 {
            return Err(ConfigError::Message(
                "Feedback iso_change_threshold must be within [0, 1)".to_string(),
            ));
        }

        if self.recovery.max_retries == 0 {
            return Err(ConfigError::Message(
                "Recovery max_retries must be greater than 0".to_string(),
            ));
        }

        if self.recovery.base_delay_ms == 0 {
            return Err(ConfigError::Message(
                "Recovery base_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.recovery.max_delay_ms < self.recovery.base_delay_ms {
            return Err(ConfigError::Message(
                "Recovery max_delay_ms must not be smaller than base_delay_ms".to_string(),
            ));
        }

        if self.recovery.failure_threshold == 0 {
            return Err(ConfigError::Message(
                "Recovery failure_threshold must be greater than 0".to_string(),
            ));
        }

        if let Some(angle) = self.controller.shutter_angle {
            if angle <= 0.0 || angle > 1.0 {
                return Err(ConfigError::Message(
                    "Controller shutter_angle must be within (0, 1]".to_string(),
                ));
            }
        }

        if self.controller.update_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Controller update_bus_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            feedback: FeedbackConfig::default(),
            recovery: RecoveryConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_adjustment_interval_ms: default_min_adjustment_interval_ms(),
            ev_offset_threshold: default_ev_offset_threshold(),
            iso_change_threshold: default_iso_change_threshold(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            freeze_during_capture: default_freeze_during_capture(),
            shutter_angle: None,
            update_bus_capacity: default_update_bus_capacity(),
        }
    }
}

// Default value functions
fn default_min_adjustment_interval_ms() -> u64 {
    100
}
fn default_ev_offset_threshold() -> f32 {
    0.1
}
fn default_iso_change_threshold() -> f32 {
    0.05
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    10
}

fn default_freeze_during_capture() -> bool {
    true
}
fn default_update_bus_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExposureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feedback.min_adjustment_interval_ms, 100);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.recovery.failure_threshold, 5);
        assert!(config.controller.freeze_during_capture);
    }

    #[test]
    fn test_duration_accessors() {
        let config = ExposureConfig::default();
        assert_eq!(
            config.feedback.min_adjustment_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(config.recovery.base_delay(), Duration::from_millis(100));
        assert_eq!(config.recovery.max_delay(), Duration::from_secs(2));
        assert_eq!(config.recovery.recovery_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let config = ExposureConfig::load_from_file("/nonexistent/exposurectl.toml")
            .expect("missing file should fall back to defaults");
        assert_eq!(config.recovery.max_delay_ms, 2000);
        assert_eq!(config.feedback.ev_offset_threshold, 0.1);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[feedback]\nmin_adjustment_interval_ms = 250\n\n[recovery]\nmax_retries = 7\n"
        )
        .unwrap();

        let config = ExposureConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.feedback.min_adjustment_interval_ms, 250);
        assert_eq!(config.recovery.max_retries, 7);
        // Untouched sections keep their defaults
        assert_eq!(config.recovery.failure_threshold, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ExposureConfig::default();
        config.recovery.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = ExposureConfig::default();
        config.feedback.iso_change_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = ExposureConfig::default();
        config.controller.shutter_angle = Some(2.0);
        assert!(config.validate().is_err());
    }
}
