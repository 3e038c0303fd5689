pub mod mock;

pub use mock::MockDevice;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

/// Exposure mode as the hardware reports and accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareExposureMode {
    /// Hardware continuously self-meters
    Auto,
    /// Fixed sensitivity and duration supplied by the caller
    Manual,
    /// Current values frozen by the hardware
    Locked,
    /// Caller-driven exposure with hardware metering still reported
    Custom,
}

/// Red/blue channel gains relative to green.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WhiteBalanceGains {
    pub red: f32,
    pub blue: f32,
}

/// Inclusive range of a hardware-supported parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRange<T> {
    pub min: T,
    pub max: T,
}

impl ParameterRange<f32> {
    pub fn clamp(&self, value: f32) -> f32 {
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Point-in-time readings from the active sensor configuration.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Stable identity of the underlying sensor
    pub device_id: String,
    pub mode: HardwareExposureMode,
    pub iso: f32,
    pub shutter_duration: Duration,
    pub white_balance: WhiteBalanceGains,
    /// Frames per second of the active format
    pub frame_rate: f64,
    pub iso_range: ParameterRange<f32>,
    pub shutter_range: ParameterRange<Duration>,
}

/// Asynchronous value-change notifications pushed by the device once a
/// written or self-metered value has settled.
#[derive(Debug, Clone)]
pub enum DeviceUpdate {
    Iso(f32),
    ShutterDuration(Duration),
    WhiteBalance(WhiteBalanceGains),
    /// Deviation between the current exposure and the hardware's own ideal
    /// estimate, in EV units. Positive means over-exposed.
    MeteringOffset(f32),
}

/// RAII guard for the device's exclusive configuration lock. Dropping the
/// guard releases the lock on every exit path.
pub type ConfigLockGuard = tokio::sync::OwnedMutexGuard<()>;

/// Abstraction over the single hardware handle. All reads and writes needed
/// to service one event happen under one `acquire_config_lock` guard.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Stable identity of the underlying sensor, used to detect swaps
    fn device_id(&self) -> String;

    /// Read the current sensitivity, duration, gains, ranges and mode
    async fn snapshot(&self) -> Result<DeviceSnapshot>;

    /// Acquire the exclusive configuration lock for a batch of writes
    async fn acquire_config_lock(&self) -> Result<ConfigLockGuard>;

    async fn set_exposure_mode(&self, mode: HardwareExposureMode) -> Result<()>;

    /// Single combined sensitivity + duration write
    async fn set_iso_and_duration(&self, iso: f32, duration: Duration) -> Result<()>;

    async fn set_white_balance(&self, gains: WhiteBalanceGains) -> Result<()>;

    /// Subscribe to settled-value and metering-offset notifications
    fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_range_clamp() {
        let range = ParameterRange {
            min: 100.0,
            max: 6400.0,
        };
        assert_eq!(range.clamp(50.0), 100.0);
        assert_eq!(range.clamp(800.0), 800.0);
        assert_eq!(range.clamp(12800.0), 6400.0);
    }

    #[test]
    fn test_parameter_range_contains() {
        let range = ParameterRange {
            min: 100.0,
            max: 6400.0,
        };
        assert!(range.contains(100.0));
        assert!(range.contains(6400.0));
        assert!(!range.contains(99.9));
        assert!(!range.contains(6400.1));
    }
}
