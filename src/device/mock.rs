use super::{
    CameraDevice, ConfigLockGuard, DeviceSnapshot, DeviceUpdate, HardwareExposureMode,
    ParameterRange, WhiteBalanceGains,
};
use crate::error::{ExposureError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Writes accepted by the mock, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockWrite {
    Mode(HardwareExposureMode),
    IsoAndDuration(f32, Duration),
    WhiteBalance(WhiteBalanceGains),
}

struct MockState {
    snapshot: DeviceSnapshot,
    writes: Vec<MockWrite>,
    fail_next_writes: u32,
    fail_next_locks: u32,
    unavailable: bool,
}

/// Mock camera device for testing without real hardware. Failures are
/// scripted per call; settled-value notifications are pushed explicitly.
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    config_lock: Arc<tokio::sync::Mutex<()>>,
    updates: broadcast::Sender<DeviceUpdate>,
}

impl MockDevice {
    /// Create a mock device with typical sensor readings
    pub fn new() -> Self {
        Self::with_snapshot(Self::default_snapshot())
    }

    pub fn with_snapshot(snapshot: DeviceSnapshot) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MockState {
                snapshot,
                writes: Vec::new(),
                fail_next_writes: 0,
                fail_next_locks: 0,
                unavailable: false,
            })),
            config_lock: Arc::new(tokio::sync::Mutex::new(())),
            updates,
        }
    }

    pub fn default_snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: "mock-0".to_string(),
            mode: HardwareExposureMode::Auto,
            iso: 400.0,
            shutter_duration: Duration::from_micros(16_667),
            white_balance: WhiteBalanceGains {
                red: 1.0,
                blue: 1.0,
            },
            frame_rate: 30.0,
            iso_range: ParameterRange {
                min: 100.0,
                max: 6400.0,
            },
            shutter_range: ParameterRange {
                min: Duration::from_micros(125),
                max: Duration::from_millis(250),
            },
        }
    }

    /// Push a settled-value or metering notification to subscribers
    pub fn push_update(&self, update: DeviceUpdate) {
        let _ = self.updates.send(update);
    }

    /// Replace the snapshot wholesale, simulating a sensor swap
    pub fn swap_device(&self, snapshot: DeviceSnapshot) {
        debug!("Mock device swapped to {}", snapshot.device_id);
        self.state.lock().snapshot = snapshot;
    }

    /// Override the hardware-reported exposure mode reading
    pub fn set_mode_reading(&self, mode: HardwareExposureMode) {
        self.state.lock().snapshot.mode = mode;
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_next_writes = count;
    }

    /// Make the next `count` configuration-lock acquisitions fail
    pub fn fail_next_locks(&self, count: u32) {
        self.state.lock().fail_next_locks = count;
    }

    /// Mark the device as permanently gone
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    fn check_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(ExposureError::device_unavailable("mock device removed"));
        }
        if state.fail_next_writes > 0 {
            state.fail_next_writes -= 1;
            return Err(ExposureError::transition_failed("scripted write failure"));
        }
        Ok(())
    }

    fn record(&self, write: MockWrite) {
        let mut state = self.state.lock();
        match &write {
            MockWrite::Mode(mode) => state.snapshot.mode = *mode,
            MockWrite::IsoAndDuration(iso, duration) => {
                state.snapshot.iso = *iso;
                state.snapshot.shutter_duration = *duration;
            }
            MockWrite::WhiteBalance(gains) => state.snapshot.white_balance = *gains,
        }
        state.writes.push(write);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraDevice for MockDevice {
    fn device_id(&self) -> String {
        self.state.lock().snapshot.device_id.clone()
    }

    async fn snapshot(&self) -> Result<DeviceSnapshot> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(ExposureError::device_unavailable("mock device removed"));
        }
        Ok(state.snapshot.clone())
    }

    async fn acquire_config_lock(&self) -> Result<ConfigLockGuard> {
        {
            let mut state = self.state.lock();
            if state.unavailable {
                return Err(ExposureError::device_unavailable("mock device removed"));
            }
            if state.fail_next_locks > 0 {
                state.fail_next_locks -= 1;
                return Err(ExposureError::lock_failed("scripted lock failure"));
            }
        }
        Ok(Arc::clone(&self.config_lock).lock_owned().await)
    }

    async fn set_exposure_mode(&self, mode: HardwareExposureMode) -> Result<()> {
        self.check_write()?;
        self.record(MockWrite::Mode(mode));
        Ok(())
    }

    async fn set_iso_and_duration(&self, iso: f32, duration: Duration) -> Result<()> {
        self.check_write()?;
        self.record(MockWrite::IsoAndDuration(iso, duration));
        Ok(())
    }

    async fn set_white_balance(&self, gains: WhiteBalanceGains) -> Result<()> {
        self.check_write()?;
        self.record(MockWrite::WhiteBalance(gains));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.updates.subscribe()
    }
}
