use crate::config::ExposureConfig;
use crate::device::{
    CameraDevice, DeviceSnapshot, DeviceUpdate, HardwareExposureMode, WhiteBalanceGains,
};
use crate::error::{ExposureError, Result};
use crate::events::{ExposureUpdate, UpdateBus};
use crate::feedback::{GateDecision, ShutterPriorityLoop};
use crate::recovery::{ExposureOperation, OperationKind, RecoveryCoordinator};
use crate::state::{transition, ExposureEvent, ExposureState};
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Exposure duration holding a fixed shutter angle at the given frame rate.
/// An angle fraction of 0.5 is the classic 180 degree shutter.
pub fn shutter_duration_for_angle(angle_fraction: f64, frame_rate: f64) -> Duration {
    Duration::from_secs_f64(angle_fraction / frame_rate.max(f64::EPSILON))
}

struct ControllerInner {
    device: Arc<dyn CameraDevice>,
    config: ExposureConfig,
    state: Mutex<ExposureState>,
    feedback: Mutex<ShutterPriorityLoop>,
    recovery: RecoveryCoordinator,
    updates: UpdateBus,
    /// Single serialization point for all hardware writes
    write_serial: tokio::sync::Mutex<()>,
    known_device_id: Mutex<String>,
    /// Angle-correct shutter-priority target after a sensor swap
    suggested_target: Mutex<Option<Duration>>,
    is_running: AtomicBool,
}

/// Owns the hardware handle and turns state-machine decisions into the
/// minimal set of device writes, issued through the recovery coordinator.
/// Settled values reported by the device are relayed outward; metering
/// offsets drive the shutter-priority feedback loop.
pub struct ExposureController {
    inner: Arc<ControllerInner>,
    relay_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExposureController {
    pub fn new(device: Arc<dyn CameraDevice>, config: ExposureConfig) -> Self {
        let feedback = ShutterPriorityLoop::new(config.feedback);
        let recovery = RecoveryCoordinator::new(config.recovery);
        let updates = UpdateBus::new(config.controller.update_bus_capacity);
        let device_id = device.device_id();

        Self {
            inner: Arc::new(ControllerInner {
                device,
                config,
                state: Mutex::new(ExposureState::Auto),
                feedback: Mutex::new(feedback),
                recovery,
                updates,
                write_serial: tokio::sync::Mutex::new(()),
                known_device_id: Mutex::new(device_id),
                suggested_target: Mutex::new(None),
                is_running: AtomicBool::new(false),
            }),
            relay_task: Mutex::new(None),
        }
    }

    /// Start relaying device notifications. Must be called before settled
    /// values or metering offsets are observed.
    pub fn start(&self) -> Result<()> {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            warn!("Exposure controller is already running");
            return Ok(());
        }

        info!(
            "Starting exposure controller for device {}",
            self.inner.device.device_id()
        );

        let mut rx = self.inner.device.subscribe();
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            debug!("Device update relay started");
            while inner.is_running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(update) => handle_device_update(&inner, update).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Device update relay lagged, skipped {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Device update channel closed");
                        break;
                    }
                }
            }
            debug!("Device update relay stopped");
        });

        *self.relay_task.lock() = Some(task);
        Ok(())
    }

    /// Stop the relay task. Pending retries inside the recovery coordinator
    /// run to completion; only notification handling stops.
    pub async fn stop(&self) {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            debug!("Exposure controller is not running");
            return;
        }

        info!("Stopping exposure controller");
        let task = self.relay_task.lock().take();
        if let Some(task) = task {
            // recv() only returns on the next update, so cancel instead of
            // waiting for one
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> ExposureState {
        self.inner.state.lock().clone()
    }

    /// Subscribe to outward notifications (settled values, errors)
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ExposureUpdate> {
        self.inner.updates.subscribe()
    }

    /// Angle-correct shutter-priority target computed at the last device
    /// swap, for the caller to re-pin with
    pub fn recomputed_shutter_target(&self) -> Option<Duration> {
        *self.inner.suggested_target.lock()
    }

    /// Submit a user or system event. Runs the state machine against a
    /// fresh device snapshot, reconciles the result against the hardware,
    /// and returns the new logical state.
    pub async fn submit_event(&self, event: ExposureEvent) -> Result<ExposureState> {
        // Failure funnel: log and notify, never touch the device
        if let ExposureEvent::ErrorOccurred { kind, message } = &event {
            warn!("Exposure error reported: {} ({})", message, kind);
            self.inner.updates.publish(ExposureUpdate::Error {
                kind: kind.clone(),
                message: message.clone(),
            });
            return Ok(self.current_state());
        }

        let inner = &self.inner;
        let _serial = inner.write_serial.lock().await;

        let snapshot = match inner.device.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Device snapshot failed: {}", e);
                inner.updates.publish(ExposureUpdate::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let current = inner.state.lock().clone();
        let new_state = transition(&current, &event, &snapshot);

        if matches!(event, ExposureEvent::DeviceChanged) {
            self.handle_device_changed(&current, &snapshot);
        }

        if new_state != current {
            debug!(
                "Exposure state: {} -> {} ({:?})",
                current.name(),
                new_state.name(),
                event
            );
            reconcile(inner, &new_state, &snapshot).await?;
            *inner.state.lock() = new_state.clone();
        } else {
            trace!("Event {:?} is a no-op in state {}", event, current.name());
        }

        self.update_feedback_lifecycle(&current, &new_state);
        Ok(new_state)
    }

    /// Bracket a hardware-identity swap; submitted operations are deferred
    pub fn begin_device_transition(&self) {
        self.inner.recovery.begin_transition();
    }

    /// End the swap window and replay deferred operations in order.
    /// Failures surface on the update bus rather than aborting the replay.
    pub async fn end_device_transition(&self) {
        let failures = self.inner.recovery.end_transition().await;
        for (kind, error) in failures {
            self.inner.updates.publish(ExposureUpdate::Error {
                kind: error.kind().to_string(),
                message: format!("{} replay failed: {}", kind.name(), error),
            });
        }
    }

    /// Discard deferred operations when the device identity is going away
    pub fn clear_pending_operations(&self) -> usize {
        self.inner.recovery.clear_pending()
    }

    /// Write white-balance gains through the recovery coordinator
    pub async fn set_white_balance(&self, gains: WhiteBalanceGains) -> Result<()> {
        let inner = &self.inner;
        let _serial = inner.write_serial.lock().await;

        let device = Arc::clone(&inner.device);
        let op = ExposureOperation::new(OperationKind::SetWhiteBalance, move || {
            let device = Arc::clone(&device);
            async move {
                let _guard = device.acquire_config_lock().await?;
                device.set_white_balance(gains).await
            }
            .boxed()
        })
        .with_precondition(move || {
            if gains.red > 0.0 && gains.blue > 0.0 {
                Ok(())
            } else {
                Err(ExposureError::invalid_state(
                    "white balance gains must be positive",
                ))
            }
        });

        inner.recovery.execute(op).await
    }

    /// On a sensor swap the pinned duration is recomputed, not carried
    /// over, when the governing semantic is a fixed shutter angle.
    fn handle_device_changed(&self, previous: &ExposureState, snapshot: &DeviceSnapshot) {
        let inner = &self.inner;
        let old_id = {
            let mut known = inner.known_device_id.lock();
            std::mem::replace(&mut *known, snapshot.device_id.clone())
        };
        info!(
            "Hardware identity changed: {} -> {}",
            old_id, snapshot.device_id
        );

        if let ExposureState::ShutterPriority {
            target_duration, ..
        } = previous
        {
            let suggested = match inner.config.controller.shutter_angle {
                Some(angle) => {
                    let recomputed = shutter_duration_for_angle(angle, snapshot.frame_rate);
                    info!(
                        "Shutter target recomputed for {:.1} fps: {:?} -> {:?}",
                        snapshot.frame_rate, target_duration, recomputed
                    );
                    recomputed
                }
                // Same duration stays correct only while the frame rate is
                // unchanged; without an angle policy it is all we have
                None => *target_duration,
            };
            *inner.suggested_target.lock() = Some(suggested);
            inner
                .updates
                .publish(ExposureUpdate::ShutterTargetRecomputed(suggested));
        }
    }

    fn update_feedback_lifecycle(&self, previous: &ExposureState, next: &ExposureState) {
        use ExposureState as S;
        let mut feedback = self.inner.feedback.lock();
        match (previous, next) {
            // Restoring shutter priority after a recording resumes gating
            (S::RecordingLocked { .. }, S::ShutterPriority { .. }) => feedback.unfreeze(),
            (S::ShutterPriority { .. }, S::ShutterPriority { .. }) => {}
            (_, S::ShutterPriority { .. }) => {
                debug!("Feedback loop active");
                feedback.activate();
            }
            (S::ShutterPriority { .. }, S::RecordingLocked { .. }) => {
                if self.inner.config.controller.freeze_during_capture {
                    debug!("Feedback loop frozen for capture");
                    feedback.freeze();
                }
            }
            (_, S::RecordingLocked { .. }) => {}
            (S::ShutterPriority { .. }, _) => {
                debug!("Feedback loop idle");
                feedback.deactivate();
            }
            _ => {}
        }
    }
}

/// Builder following the crate's configuration conventions
pub struct ExposureControllerBuilder {
    device: Option<Arc<dyn CameraDevice>>,
    config: Option<ExposureConfig>,
}

impl ExposureControllerBuilder {
    pub fn new() -> Self {
        Self {
            device: None,
            config: None,
        }
    }

    pub fn device(mut self, device: Arc<dyn CameraDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn config(mut self, config: ExposureConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<ExposureController> {
        let device = self
            .device
            .ok_or_else(|| ExposureError::custom("Camera device must be specified"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(ExposureController::new(device, config))
    }
}

impl Default for ExposureControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_device_update(inner: &Arc<ControllerInner>, update: DeviceUpdate) {
    match update {
        DeviceUpdate::Iso(value) => {
            inner.updates.publish(ExposureUpdate::IsoSettled(value));
        }
        DeviceUpdate::ShutterDuration(duration) => {
            inner
                .updates
                .publish(ExposureUpdate::ShutterDurationSettled(duration));
        }
        DeviceUpdate::WhiteBalance(gains) => {
            inner
                .updates
                .publish(ExposureUpdate::WhiteBalanceSettled(gains));
        }
        DeviceUpdate::MeteringOffset(offset_ev) => {
            handle_metering_offset(inner, offset_ev).await;
        }
    }
}

/// One pass of the shutter-priority control loop: gate the update, compute
/// the clamped ideal sensitivity, and issue a single combined write of the
/// pinned duration and new sensitivity.
async fn handle_metering_offset(inner: &Arc<ControllerInner>, offset_ev: f32) {
    // Shutter priority may still be the governing state underneath a
    // recording lock; the freeze flag decides whether the loop keeps going
    let (target_duration, has_override) = {
        let state = inner.state.lock();
        let governing = match &*state {
            ExposureState::RecordingLocked { previous } => &**previous,
            other => other,
        };
        match governing {
            ExposureState::ShutterPriority {
                target_duration,
                iso_override,
            } => (*target_duration, iso_override.is_some()),
            _ => return,
        }
    };

    if has_override {
        trace!("Metering offset ignored, manual override holds sensitivity");
        return;
    }

    // Cheap gates before any device access
    {
        let feedback = inner.feedback.lock();
        if !feedback.is_active() || feedback.rate_limited(Instant::now()) {
            return;
        }
    }

    let snapshot = match inner.device.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Snapshot failed during metering update: {}", e);
            inner.updates.publish(ExposureUpdate::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    let decision = inner.feedback.lock().evaluate(
        Instant::now(),
        offset_ev,
        snapshot.iso,
        snapshot.iso_range,
    );
    let new_iso = match decision {
        GateDecision::Adjust { iso } => iso,
        other => {
            trace!("Metering update gated: {:?}", other);
            return;
        }
    };

    let _serial = inner.write_serial.lock().await;
    let device = Arc::clone(&inner.device);
    let iso_range = snapshot.iso_range;
    let op = ExposureOperation::new(OperationKind::SetIso, move || {
        let device = Arc::clone(&device);
        async move {
            let _guard = device.acquire_config_lock().await?;
            device.set_iso_and_duration(new_iso, target_duration).await
        }
        .boxed()
    })
    .with_precondition(move || {
        if iso_range.contains(new_iso) {
            Ok(())
        } else {
            Err(ExposureError::invalid_state(
                "computed sensitivity outside device range",
            ))
        }
    });

    match inner.recovery.execute(op).await {
        Ok(()) => {
            inner.feedback.lock().note_applied(Instant::now());
            trace!(
                new_iso,
                offset_ev,
                "Applied shutter-priority sensitivity adjustment"
            );
        }
        Err(e) => {
            warn!("Sensitivity adjustment failed: {}", e);
            inner.updates.publish(ExposureUpdate::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            });
        }
    }
}

/// Issue the minimal batch of writes that makes the hardware match the new
/// logical state, inside one configuration-lock acquisition.
async fn reconcile(
    inner: &Arc<ControllerInner>,
    new_state: &ExposureState,
    snapshot: &DeviceSnapshot,
) -> Result<()> {
    let device = Arc::clone(&inner.device);

    let op = match new_state {
        ExposureState::Auto => {
            if snapshot.mode == HardwareExposureMode::Auto {
                return Ok(());
            }
            ExposureOperation::new(OperationKind::SetExposureMode, move || {
                let device = Arc::clone(&device);
                async move {
                    let _guard = device.acquire_config_lock().await?;
                    device.set_exposure_mode(HardwareExposureMode::Auto).await
                }
                .boxed()
            })
        }

        ExposureState::Manual { iso, duration } => {
            let iso = *iso;
            let duration = *duration;
            let mode = snapshot.mode;
            let unchanged = snapshot.iso == iso && snapshot.shutter_duration == duration;
            if mode == HardwareExposureMode::Manual && unchanged {
                return Ok(());
            }
            let iso_range = snapshot.iso_range;
            ExposureOperation::new(OperationKind::SetExposureMode, move || {
                let device = Arc::clone(&device);
                async move {
                    let _guard = device.acquire_config_lock().await?;
                    if mode != HardwareExposureMode::Manual {
                        device
                            .set_exposure_mode(HardwareExposureMode::Manual)
                            .await?;
                    }
                    device.set_iso_and_duration(iso, duration).await
                }
                .boxed()
            })
            .with_precondition(move || {
                if iso_range.contains(iso) {
                    Ok(())
                } else {
                    Err(ExposureError::invalid_state(
                        "manual sensitivity outside device range",
                    ))
                }
            })
        }

        ExposureState::ShutterPriority {
            target_duration,
            iso_override,
        } => {
            let duration = *target_duration;
            let iso = snapshot
                .iso_range
                .clamp(iso_override.unwrap_or(snapshot.iso));
            let mode = snapshot.mode;
            let shutter_range = snapshot.shutter_range;
            ExposureOperation::new(OperationKind::ApplyShutterPriority, move || {
                let device = Arc::clone(&device);
                async move {
                    let _guard = device.acquire_config_lock().await?;
                    if mode != HardwareExposureMode::Custom {
                        device
                            .set_exposure_mode(HardwareExposureMode::Custom)
                            .await?;
                    }
                    device.set_iso_and_duration(iso, duration).await
                }
                .boxed()
            })
            .with_precondition(move || {
                if duration >= shutter_range.min && duration <= shutter_range.max {
                    Ok(())
                } else {
                    Err(ExposureError::invalid_state(
                        "target duration outside device range",
                    ))
                }
            })
        }

        ExposureState::RecordingLocked { previous }
            if previous.is_shutter_priority()
                && !inner.config.controller.freeze_during_capture =>
        {
            // The loop keeps driving sensitivity through the capture, so the
            // hardware must stay writable
            return Ok(());
        }

        ExposureState::Locked { .. } | ExposureState::RecordingLocked { .. } => {
            if snapshot.mode == HardwareExposureMode::Locked {
                return Ok(());
            }
            ExposureOperation::new(OperationKind::LockExposure, move || {
                let device = Arc::clone(&device);
                async move {
                    let _guard = device.acquire_config_lock().await?;
                    device.set_exposure_mode(HardwareExposureMode::Locked).await
                }
                .boxed()
            })
        }
    };

    inner.recovery.execute(op).await
}
