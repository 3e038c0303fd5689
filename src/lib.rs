pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod events;
pub mod feedback;
pub mod recovery;
pub mod state;

pub use config::{ControllerConfig, ExposureConfig, FeedbackConfig, RecoveryConfig};
pub use controller::{shutter_duration_for_angle, ExposureController, ExposureControllerBuilder};
pub use device::{
    CameraDevice, ConfigLockGuard, DeviceSnapshot, DeviceUpdate, HardwareExposureMode, MockDevice,
    ParameterRange, WhiteBalanceGains,
};
pub use error::{ExposureError, Result};
pub use events::{ExposureUpdate, UpdateBus};
pub use feedback::{ideal_sensitivity, GateDecision, ShutterPriorityLoop};
pub use recovery::{ExposureOperation, OperationKind, RecoveryCoordinator};
pub use state::{transition, ExposureEvent, ExposureState};
