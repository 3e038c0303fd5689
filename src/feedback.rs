use crate::config::FeedbackConfig;
use crate::device::ParameterRange;
use std::time::Instant;
use tracing::trace;

/// Outcome of gating one metering-offset update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    /// Issue a combined (pinned duration, this sensitivity) write
    Adjust { iso: f32 },
    /// Loop idle or frozen for the duration of a capture
    Inactive,
    /// Minimum interval since the last applied adjustment has not elapsed
    RateLimited,
    /// |offset| is within the EV dead band
    WithinEvDeadBand,
    /// Relative sensitivity change is within the percentage dead band
    WithinIsoDeadBand,
}

/// Ideal sensitivity holding exposure constant against a metering offset.
/// A positive offset (over-exposed) lowers sensitivity, one full EV halves it.
pub fn ideal_sensitivity(current_iso: f32, offset_ev: f32) -> f32 {
    current_iso / 2f32.powf(offset_ev)
}

/// Shutter-priority feedback gate. Without the three-stage hysteresis
/// (time, EV, percentage) a loop driven by noisy metering input oscillates
/// visibly.
pub struct ShutterPriorityLoop {
    config: FeedbackConfig,
    active: bool,
    frozen: bool,
    last_adjustment: Option<Instant>,
}

impl ShutterPriorityLoop {
    pub fn new(config: FeedbackConfig) -> Self {
        Self {
            config,
            active: false,
            frozen: false,
            last_adjustment: None,
        }
    }

    /// Enter the Active state on entering shutter priority
    pub fn activate(&mut self) {
        self.active = true;
        self.last_adjustment = None;
    }

    /// Return to Idle on leaving shutter priority
    pub fn deactivate(&mut self) {
        self.active = false;
        self.frozen = false;
        self.last_adjustment = None;
    }

    /// Suspend gating entirely while a capture must hold exposure stable
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_active(&self) -> bool {
        self.active && !self.frozen
    }

    /// Stage-one check alone, for callers that want to skip work before
    /// reading the device
    pub fn rate_limited(&self, now: Instant) -> bool {
        match self.last_adjustment {
            Some(last) => now.duration_since(last) < self.config.min_adjustment_interval(),
            None => false,
        }
    }

    /// Run the gate pipeline for one metering-offset update. Does not
    /// mutate the adjustment timestamp; call `note_applied` once the write
    /// actually succeeded.
    pub fn evaluate(
        &self,
        now: Instant,
        offset_ev: f32,
        current_iso: f32,
        iso_range: ParameterRange<f32>,
    ) -> GateDecision {
        if !self.active || self.frozen {
            return GateDecision::Inactive;
        }

        if self.rate_limited(now) {
            trace!("Metering update rejected: rate limited");
            return GateDecision::RateLimited;
        }

        if offset_ev.abs() <= self.config.ev_offset_threshold {
            trace!(offset_ev, "Metering update rejected: within EV dead band");
            return GateDecision::WithinEvDeadBand;
        }

        let ideal = iso_range.clamp(ideal_sensitivity(current_iso, offset_ev));
        let relative_change = (ideal - current_iso).abs() / current_iso.max(f32::EPSILON);
        if relative_change <= self.config.iso_change_threshold {
            trace!(
                ideal,
                current_iso,
                "Metering update rejected: sensitivity change below threshold"
            );
            return GateDecision::WithinIsoDeadBand;
        }

        GateDecision::Adjust { iso: ideal }
    }

    /// Record the timestamp of a successfully applied adjustment
    pub fn note_applied(&mut self, now: Instant) {
        self.last_adjustment = Some(now);
    }
}
