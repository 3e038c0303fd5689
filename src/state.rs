use crate::device::{DeviceSnapshot, HardwareExposureMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical exposure mode of the controller. Exactly one variant is active
/// at a time; `RecordingLocked` owns the prior state so stopping a recording
/// restores it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExposureState {
    /// Hardware continuously self-meters
    Auto,
    /// Fixed sensitivity and exposure duration
    Manual { iso: f32, duration: Duration },
    /// Duration pinned; sensitivity floats unless an override is present
    ShutterPriority {
        target_duration: Duration,
        iso_override: Option<f32>,
    },
    /// Frozen snapshot of whatever values were active at lock time
    Locked { iso: f32, duration: Duration },
    /// Recording in progress; wraps the state to restore on stop
    RecordingLocked { previous: Box<ExposureState> },
}

impl ExposureState {
    /// Short stable tag for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual { .. } => "manual",
            Self::ShutterPriority { .. } => "shutter_priority",
            Self::Locked { .. } => "locked",
            Self::RecordingLocked { .. } => "recording_locked",
        }
    }

    pub fn is_shutter_priority(&self) -> bool {
        matches!(self, Self::ShutterPriority { .. })
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, Self::RecordingLocked { .. })
    }
}

/// User- and system-driven events submitted to the state machine. Optional
/// fields fall back to the live device's current readings when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExposureEvent {
    EnableAuto,
    EnableManual {
        iso: Option<f32>,
        duration: Option<Duration>,
    },
    EnableShutterPriority {
        duration: Duration,
    },
    OverrideIso {
        iso: f32,
    },
    ClearIsoOverride,
    Lock,
    Unlock,
    StartRecording,
    StopRecording,
    /// The underlying hardware identity changed (e.g. sensor swap)
    DeviceChanged,
    /// Funnels failures through the event channel for logging; never
    /// changes state
    ErrorOccurred {
        kind: String,
        message: String,
    },
}

/// Pure transition function. Total and deterministic: unhandled
/// `(state, event)` pairs return the input state unchanged.
pub fn transition(
    current: &ExposureState,
    event: &ExposureEvent,
    snapshot: &DeviceSnapshot,
) -> ExposureState {
    use ExposureEvent as E;
    use ExposureState as S;

    match (current, event) {
        // Safety fallback when the hardware identity changes, from any state
        (_, E::DeviceChanged) => S::Auto,

        // Failures are logged elsewhere; the machine does not react
        (_, E::ErrorOccurred { .. }) => current.clone(),

        // Recording lock does not stack
        (S::RecordingLocked { .. }, E::StartRecording) => current.clone(),
        (state, E::StartRecording) => S::RecordingLocked {
            previous: Box::new(state.clone()),
        },
        (S::RecordingLocked { previous }, E::StopRecording) => (**previous).clone(),

        // While recording, everything else waits for StopRecording
        (S::RecordingLocked { .. }, _) => current.clone(),

        // A frozen state stays frozen until unlocked; re-locking would
        // clobber the frozen values with a possibly stale live read
        (S::Locked { .. }, E::Lock) => current.clone(),
        (S::Locked { iso, duration }, E::Unlock) => match snapshot.mode {
            // The live device is still self-metering, so there is nothing
            // manual to restore to
            HardwareExposureMode::Auto => S::Auto,
            _ => S::Manual {
                iso: *iso,
                duration: *duration,
            },
        },
        (S::Locked { .. }, _) => current.clone(),

        (_, E::EnableAuto) => S::Auto,
        (_, E::EnableManual { iso, duration }) => S::Manual {
            iso: iso.unwrap_or(snapshot.iso),
            duration: duration.unwrap_or(snapshot.shutter_duration),
        },
        (_, E::EnableShutterPriority { duration }) => S::ShutterPriority {
            target_duration: *duration,
            iso_override: None,
        },

        (
            S::ShutterPriority {
                target_duration, ..
            },
            E::OverrideIso { iso },
        ) => S::ShutterPriority {
            target_duration: *target_duration,
            iso_override: Some(*iso),
        },
        (
            S::ShutterPriority {
                target_duration, ..
            },
            E::ClearIsoOverride,
        ) => S::ShutterPriority {
            target_duration: *target_duration,
            iso_override: None,
        },

        // Freeze the logical values where the state knows them, falling back
        // to live readings only in auto
        (S::Auto, E::Lock) => S::Locked {
            iso: snapshot.iso,
            duration: snapshot.shutter_duration,
        },
        (S::Manual { iso, duration }, E::Lock) => S::Locked {
            iso: *iso,
            duration: *duration,
        },
        (
            S::ShutterPriority {
                target_duration,
                iso_override,
            },
            E::Lock,
        ) => S::Locked {
            iso: iso_override.unwrap_or(snapshot.iso),
            duration: *target_duration,
        },

        // Explicit no-op policy for everything else
        _ => current.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    fn snapshot() -> DeviceSnapshot {
        MockDevice::default_snapshot()
    }

    fn snapshot_with_mode(mode: HardwareExposureMode) -> DeviceSnapshot {
        let mut snap = snapshot();
        snap.mode = mode;
        snap
    }

    fn all_sample_states() -> Vec<ExposureState> {
        vec![
            ExposureState::Auto,
            ExposureState::Manual {
                iso: 200.0,
                duration: Duration::from_millis(10),
            },
            ExposureState::ShutterPriority {
                target_duration: Duration::from_millis(20),
                iso_override: Some(800.0),
            },
            ExposureState::Locked {
                iso: 400.0,
                duration: Duration::from_micros(16_667),
            },
            ExposureState::RecordingLocked {
                previous: Box::new(ExposureState::Auto),
            },
        ]
    }

    #[test]
    fn test_transition_is_deterministic() {
        let snap = snapshot();
        let state = ExposureState::ShutterPriority {
            target_duration: Duration::from_millis(20),
            iso_override: None,
        };
        let event = ExposureEvent::Lock;

        let first = transition(&state, &event, &snap);
        let second = transition(&state, &event, &snap);
        assert_eq!(first, second);
    }

    #[test]
    fn test_device_changed_resets_every_state_to_auto() {
        let snap = snapshot();
        for state in all_sample_states() {
            assert_eq!(
                transition(&state, &ExposureEvent::DeviceChanged, &snap),
                ExposureState::Auto,
                "state {:?} did not reset",
                state
            );
        }
    }

    #[test]
    fn test_error_occurred_never_changes_state() {
        let snap = snapshot();
        let event = ExposureEvent::ErrorOccurred {
            kind: "transition_failed".to_string(),
            message: "busy".to_string(),
        };
        for state in all_sample_states() {
            assert_eq!(transition(&state, &event, &snap), state);
        }
    }

    #[test]
    fn test_start_stop_recording_restores_exactly() {
        let snap = snapshot();
        for state in all_sample_states() {
            if state.is_recording() {
                continue;
            }
            let recording = transition(&state, &ExposureEvent::StartRecording, &snap);
            assert_eq!(
                recording,
                ExposureState::RecordingLocked {
                    previous: Box::new(state.clone())
                }
            );
            let restored = transition(&recording, &ExposureEvent::StopRecording, &snap);
            assert_eq!(restored, state);
        }
    }

    #[test]
    fn test_recording_lock_does_not_stack() {
        let snap = snapshot();
        let recording = ExposureState::RecordingLocked {
            previous: Box::new(ExposureState::Auto),
        };
        assert_eq!(
            transition(&recording, &ExposureEvent::StartRecording, &snap),
            recording
        );
    }

    #[test]
    fn test_events_are_ignored_while_recording() {
        let snap = snapshot();
        let recording = ExposureState::RecordingLocked {
            previous: Box::new(ExposureState::Manual {
                iso: 200.0,
                duration: Duration::from_millis(10),
            }),
        };
        for event in [
            ExposureEvent::EnableAuto,
            ExposureEvent::EnableManual {
                iso: Some(100.0),
                duration: None,
            },
            ExposureEvent::EnableShutterPriority {
                duration: Duration::from_millis(20),
            },
            ExposureEvent::Lock,
            ExposureEvent::Unlock,
        ] {
            assert_eq!(transition(&recording, &event, &snap), recording);
        }
    }

    #[test]
    fn test_enable_manual_falls_back_to_snapshot_readings() {
        let snap = snapshot();
        let state = transition(
            &ExposureState::Auto,
            &ExposureEvent::EnableManual {
                iso: None,
                duration: Some(Duration::from_millis(5)),
            },
            &snap,
        );
        assert_eq!(
            state,
            ExposureState::Manual {
                iso: snap.iso,
                duration: Duration::from_millis(5),
            }
        );
    }

    #[test]
    fn test_shutter_priority_override_and_lock_scenario() {
        let snap = snapshot();
        let duration = Duration::from_millis(20); // 1/50s

        let sp = transition(
            &ExposureState::Auto,
            &ExposureEvent::EnableShutterPriority { duration },
            &snap,
        );
        assert_eq!(
            sp,
            ExposureState::ShutterPriority {
                target_duration: duration,
                iso_override: None,
            }
        );

        let overridden = transition(&sp, &ExposureEvent::OverrideIso { iso: 800.0 }, &snap);
        assert_eq!(
            overridden,
            ExposureState::ShutterPriority {
                target_duration: duration,
                iso_override: Some(800.0),
            }
        );

        let locked = transition(&overridden, &ExposureEvent::Lock, &snap);
        assert_eq!(
            locked,
            ExposureState::Locked {
                iso: 800.0,
                duration,
            }
        );
    }

    #[test]
    fn test_locked_start_recording_wraps_and_restores() {
        let snap = snapshot();
        let locked = ExposureState::Locked {
            iso: 400.0,
            duration: Duration::from_micros(16_667), // 1/60s
        };

        let recording = transition(&locked, &ExposureEvent::StartRecording, &snap);
        assert_eq!(
            recording,
            ExposureState::RecordingLocked {
                previous: Box::new(locked.clone())
            }
        );
        assert_eq!(
            transition(&recording, &ExposureEvent::StopRecording, &snap),
            locked
        );
    }

    #[test]
    fn test_lock_while_locked_keeps_frozen_values() {
        // A second Lock must not clobber the frozen values with a live read
        let snap = snapshot();
        let locked = ExposureState::Locked {
            iso: 1600.0,
            duration: Duration::from_millis(8),
        };
        assert_eq!(transition(&locked, &ExposureEvent::Lock, &snap), locked);
    }

    #[test]
    fn test_unlock_restores_by_live_device_mode() {
        let locked = ExposureState::Locked {
            iso: 800.0,
            duration: Duration::from_millis(10),
        };

        // Device still self-metering: nothing manual to restore to
        let auto_snap = snapshot_with_mode(HardwareExposureMode::Auto);
        assert_eq!(
            transition(&locked, &ExposureEvent::Unlock, &auto_snap),
            ExposureState::Auto
        );

        // Device in a manual-style mode: frozen values become manual
        let manual_snap = snapshot_with_mode(HardwareExposureMode::Manual);
        assert_eq!(
            transition(&locked, &ExposureEvent::Unlock, &manual_snap),
            ExposureState::Manual {
                iso: 800.0,
                duration: Duration::from_millis(10),
            }
        );
    }

    #[test]
    fn test_clear_override_outside_shutter_priority_is_noop() {
        let snap = snapshot();
        for state in [
            ExposureState::Auto,
            ExposureState::Manual {
                iso: 200.0,
                duration: Duration::from_millis(10),
            },
            ExposureState::Locked {
                iso: 400.0,
                duration: Duration::from_millis(10),
            },
        ] {
            assert_eq!(
                transition(&state, &ExposureEvent::ClearIsoOverride, &snap),
                state
            );
        }
    }

    #[test]
    fn test_clear_override_in_shutter_priority() {
        let snap = snapshot();
        let sp = ExposureState::ShutterPriority {
            target_duration: Duration::from_millis(20),
            iso_override: Some(800.0),
        };
        assert_eq!(
            transition(&sp, &ExposureEvent::ClearIsoOverride, &snap),
            ExposureState::ShutterPriority {
                target_duration: Duration::from_millis(20),
                iso_override: None,
            }
        );
    }

    #[test]
    fn test_override_iso_outside_shutter_priority_is_noop() {
        let snap = snapshot();
        let state = ExposureState::Manual {
            iso: 200.0,
            duration: Duration::from_millis(10),
        };
        assert_eq!(
            transition(&state, &ExposureEvent::OverrideIso { iso: 800.0 }, &snap),
            state
        );
    }

    #[test]
    fn test_lock_in_auto_freezes_live_readings() {
        let snap = snapshot();
        assert_eq!(
            transition(&ExposureState::Auto, &ExposureEvent::Lock, &snap),
            ExposureState::Locked {
                iso: snap.iso,
                duration: snap.shutter_duration,
            }
        );
    }

    #[test]
    fn test_unlock_outside_locked_is_noop() {
        let snap = snapshot();
        let state = ExposureState::ShutterPriority {
            target_duration: Duration::from_millis(20),
            iso_override: None,
        };
        assert_eq!(transition(&state, &ExposureEvent::Unlock, &snap), state);
    }
}
