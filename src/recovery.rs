use crate::config::RecoveryConfig;
use crate::error::{ExposureError, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Kind tag of a retryable device operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    SetIso,
    SetShutterDuration,
    SetWhiteBalance,
    SetExposureMode,
    LockExposure,
    ApplyShutterPriority,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetIso => "set_iso",
            Self::SetShutterDuration => "set_shutter_duration",
            Self::SetWhiteBalance => "set_white_balance",
            Self::SetExposureMode => "set_exposure_mode",
            Self::LockExposure => "lock_exposure",
            Self::ApplyShutterPriority => "apply_shutter_priority",
        }
    }
}

type ActionFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type PreconditionFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// A unit of retryable work: a kind tag, a zero-argument async action, and
/// a precondition checked immediately before each attempt.
pub struct ExposureOperation {
    kind: OperationKind,
    precondition: PreconditionFn,
    action: ActionFn,
}

impl ExposureOperation {
    pub fn new<F>(kind: OperationKind, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            kind,
            precondition: Box::new(|| Ok(())),
            action: Box::new(action),
        }
    }

    /// Attach a precondition; failing it aborts the operation without retry
    pub fn with_precondition<P>(mut self, precondition: P) -> Self
    where
        P: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.precondition = Box::new(precondition);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl std::fmt::Debug for ExposureOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureOperation")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Circuit breaker and transition-window state, single-owner behind one
/// short-lived lock. The lock is never held across an await.
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    opened_at: Option<Instant>,
    transition_in_progress: bool,
    pending: VecDeque<ExposureOperation>,
}

/// Executes `ExposureOperation`s with retry, exponential backoff, a circuit
/// breaker, and FIFO queueing across device-reconfiguration windows.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    state: Mutex<BreakerState>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                last_failure: None,
                is_open: false,
                opened_at: None,
                transition_in_progress: false,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Execute an operation with resilience. During a transition window the
    /// operation is queued instead and replayed on `end_transition`.
    pub async fn execute(&self, operation: ExposureOperation) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.transition_in_progress {
                debug!(
                    "Queueing {} during device transition ({} pending)",
                    operation.kind().name(),
                    state.pending.len() + 1
                );
                state.pending.push_back(operation);
                return Ok(());
            }
        }

        self.run_with_retries(&operation).await
    }

    /// Mark the start of a device-reconfiguration window. Operations
    /// submitted until `end_transition` are deferred.
    pub fn begin_transition(&self) {
        let mut state = self.state.lock();
        state.transition_in_progress = true;
        info!("Device transition started, deferring new operations");
    }

    /// End the transition window and replay deferred operations in
    /// submission order. Replay is best-effort: a failed operation does not
    /// block the ones after it. Returns the failures.
    pub async fn end_transition(&self) -> Vec<(OperationKind, ExposureError)> {
        let drained: Vec<ExposureOperation> = {
            let mut state = self.state.lock();
            state.transition_in_progress = false;
            state.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            info!(
                "Device transition ended, replaying {} deferred operations",
                drained.len()
            );
        } else {
            info!("Device transition ended");
        }

        let mut failures = Vec::new();
        for operation in &drained {
            if let Err(e) = self.run_with_retries(operation).await {
                warn!(
                    "Deferred {} failed during replay: {}",
                    operation.kind().name(),
                    e
                );
                failures.push((operation.kind(), e));
            }
        }
        failures
    }

    /// Discard all deferred operations, used when the device identity itself
    /// is about to be discarded. Returns how many were dropped.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            info!("Dropped {} pending operations", dropped);
        }
        dropped
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.state.lock().last_failure
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_transition(&self) -> bool {
        self.state.lock().transition_in_progress
    }

    async fn run_with_retries(&self, operation: &ExposureOperation) -> Result<()> {
        self.check_breaker(operation.kind())?;

        let mut attempt: u32 = 0;
        loop {
            // A failing precondition indicates a logic error, not transient
            // hardware flakiness; abort without retry and without charging
            // the breaker.
            if let Err(e) = (operation.precondition)() {
                error!("Precondition failed for {}: {}", operation.kind().name(), e);
                return Err(e);
            }

            match (operation.action)().await {
                Ok(()) => {
                    self.record_success();
                    return Ok(());
                }
                Err(e) => {
                    self.record_failure();
                    attempt += 1;

                    if !e.is_recoverable() {
                        error!(
                            "{} failed permanently on attempt {}: {}",
                            operation.kind().name(),
                            attempt,
                            e
                        );
                        return Err(e);
                    }

                    if attempt >= self.config.max_retries {
                        warn!(
                            "{} exhausted {} attempts: {}",
                            operation.kind().name(),
                            attempt,
                            e
                        );
                        return Err(ExposureError::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        "Retrying {} in {:?} (attempt {}/{}): {}",
                        operation.kind().name(),
                        delay,
                        attempt + 1,
                        self.config.max_retries,
                        e
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Reject outright while the breaker is open; after the recovery timeout
    /// the next operation goes through as a half-open trial.
    fn check_breaker(&self, kind: OperationKind) -> Result<()> {
        let state = self.state.lock();
        if !state.is_open {
            return Ok(());
        }

        let opened_at = state.opened_at.unwrap_or_else(Instant::now);
        if opened_at.elapsed() >= self.config.recovery_timeout() {
            info!(
                "Circuit breaker half-open, letting {} through as a trial",
                kind.name()
            );
            Ok(())
        } else {
            debug!("Circuit breaker open, rejecting {}", kind.name());
            Err(ExposureError::CircuitBreakerOpen)
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        if state.is_open {
            info!("Circuit breaker closed after successful trial");
        }
        state.consecutive_failures = 0;
        state.last_failure = None;
        state.is_open = false;
        state.opened_at = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());

        if state.is_open {
            // Failed half-open trial restarts the open window
            state.opened_at = Some(Instant::now());
            warn!("Half-open trial failed, circuit breaker re-opened");
        } else if state.consecutive_failures >= self.config.failure_threshold {
            state.is_open = true;
            state.opened_at = Some(Instant::now());
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                state.consecutive_failures
            );
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        // No RNG dependency; the sub-second clock nanos spread concurrent
        // retries apart well enough.
        let jitter = (SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0)
            % 500) as f64
            / 1000.0;
        backoff_delay_with_jitter(
            attempt,
            self.config.base_delay(),
            self.config.max_delay(),
            jitter,
        )
    }
}

/// `min(max_delay, base * 2^attempt * (0.5 + jitter))` with `jitter` in
/// `[0, 0.5)`.
fn backoff_delay_with_jitter(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
) -> Duration {
    let scaled = base_delay.as_millis() as f64 * 2f64.powi(attempt.min(30) as i32) * (0.5 + jitter);
    let capped = scaled.min(max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}
