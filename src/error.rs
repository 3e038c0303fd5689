use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExposureError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device unavailable: {details}")]
    DeviceUnavailable { details: String },

    #[error("Invalid state: {details}")]
    InvalidState { details: String },

    #[error("Transition failed: {details}")]
    TransitionFailed { details: String },

    #[error("Configuration lock failed: {details}")]
    LockFailed { details: String },

    #[error("Circuit breaker is open, operation rejected")]
    CircuitBreakerOpen,

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ExposureError>,
    },

    #[error("{0}")]
    Custom(String),
}

impl ExposureError {
    pub fn device_unavailable<S: Into<String>>(details: S) -> Self {
        Self::DeviceUnavailable {
            details: details.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(details: S) -> Self {
        Self::InvalidState {
            details: details.into(),
        }
    }

    pub fn transition_failed<S: Into<String>>(details: S) -> Self {
        Self::TransitionFailed {
            details: details.into(),
        }
    }

    pub fn lock_failed<S: Into<String>>(details: S) -> Self {
        Self::LockFailed {
            details: details.into(),
        }
    }

    pub fn custom<S: Into<String>>(message: S) -> Self {
        Self::Custom(message.into())
    }

    /// Whether retrying the failed operation can succeed. Permanent failures
    /// (device gone, logic errors) abort immediately; everything else is
    /// treated as transient hardware flakiness.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::DeviceUnavailable { .. } | Self::InvalidState { .. }
        )
    }

    /// Short stable tag for telemetry and outward error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::DeviceUnavailable { .. } => "device_unavailable",
            Self::InvalidState { .. } => "invalid_state",
            Self::TransitionFailed { .. } => "transition_failed",
            Self::LockFailed { .. } => "lock_failed",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Custom(_) => "custom",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExposureError>;
