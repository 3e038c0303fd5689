use crate::device::WhiteBalanceGains;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Outward notifications to the consuming layer (view model, recording
/// subsystem). Settled values arrive after the hardware has actually
/// applied them, not when a write was issued.
#[derive(Debug, Clone)]
pub enum ExposureUpdate {
    IsoSettled(f32),
    ShutterDurationSettled(Duration),
    WhiteBalanceSettled(WhiteBalanceGains),
    /// Angle-correct shutter-priority target for the new sensor after a
    /// device swap; the caller re-pins with it
    ShutterTargetRecomputed(Duration),
    /// Exposure control degraded; consumers fall back to last known-good
    /// values rather than blocking
    Error { kind: String, message: String },
}

impl ExposureUpdate {
    /// Get the update type as a string for filtering
    pub fn update_type(&self) -> &'static str {
        match self {
            ExposureUpdate::IsoSettled(_) => "iso_settled",
            ExposureUpdate::ShutterDurationSettled(_) => "shutter_duration_settled",
            ExposureUpdate::WhiteBalanceSettled(_) => "white_balance_settled",
            ExposureUpdate::ShutterTargetRecomputed(_) => "shutter_target_recomputed",
            ExposureUpdate::Error { .. } => "error",
        }
    }
}

/// Broadcast bus carrying `ExposureUpdate`s to subscribers. Publishing is
/// best-effort: with no subscribers the update is dropped.
pub struct UpdateBus {
    sender: broadcast::Sender<ExposureUpdate>,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to updates and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ExposureUpdate> {
        self.sender.subscribe()
    }

    /// Publish an update to all subscribers, returning how many received it
    pub fn publish(&self, update: ExposureUpdate) -> usize {
        match &update {
            ExposureUpdate::Error { kind, message } => {
                warn!("Exposure error surfaced: {} ({})", message, kind);
            }
            ExposureUpdate::ShutterTargetRecomputed(duration) => {
                debug!("Shutter target recomputed: {:?}", duration);
            }
            _ => {
                trace!("Update: {}", update.update_type());
            }
        }

        match self.sender.send(update) {
            Ok(count) => count,
            Err(_) => {
                trace!("Update dropped, no active subscribers");
                0
            }
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for UpdateBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
