//! Managed Client state machine (§4.2) — the configured `StartupMode`
//! transition table and the auto-disable protocol, plus the volatile
//! `ConnectionState`.
//!
//! This is THE CORE of the proxy: every other subsystem exists to drive
//! or observe these transitions.

use crate::config::StartupMode;
use crate::error::ProxyError;
use crate::events::now_millis;

/// Volatile per-client state (§3 "ConnectionState"). Lives only in
/// memory — never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Discovering,
    Ready,
    Error,
}

/// Consecutive-failure bookkeeping for the auto-disable protocol
/// (spec.md §4.2 steps 1 and 4).
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    pub consecutive_failures: u32,
    pub first_attempt_time: Option<u64>,
}

impl FailureTracker {
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.first_attempt_time.is_none() {
            self.first_attempt_time = Some(now_millis());
        }
    }

    /// Successful connect: zero the failure count but preserve
    /// `first_attempt_time` (spec.md step 4 — "critical").
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Called between individual retry attempts. Deliberately a no-op on
    /// `consecutive_failures`/`first_attempt_time` — testable property 6
    /// requires both to survive a `reset()` between retries. This exists
    /// so retry machinery has an explicit place to reset *other*
    /// per-attempt state (e.g. a backoff timer) without touching the
    /// counters that drive auto-disable.
    pub fn reset(&mut self) {}
}

pub struct AutoDisableDecision {
    pub reason: String,
    pub consecutive_failures: u32,
}

/// The configured-state machine plus its runtime failure bookkeeping for
/// one managed client.
pub struct StateMachine {
    pub startup_mode: StartupMode,
    pub connection_state: ConnectionState,
    pub failures: FailureTracker,
    /// Set by the scheduler while a bring-up wave is in progress
    /// (spec.md §4.3 step 1); suspends ordinary auto-disable until the
    /// wave clears (step 2), except for the "obvious failure" escalation.
    pub startup_mode_suspended: bool,
    pub threshold: u32,
}

impl StateMachine {
    pub fn new(startup_mode: StartupMode, threshold: u32) -> Self {
        Self {
            startup_mode,
            connection_state: ConnectionState::Disconnected,
            failures: FailureTracker::default(),
            startup_mode_suspended: false,
            threshold,
        }
    }

    /// Deny-by-default transition of the configured state (spec.md's
    /// allowed-transition table). Same-state transitions are no-ops.
    pub fn transition_startup_mode(&mut self, to: StartupMode) -> Result<bool, ProxyError> {
        if self.startup_mode == to {
            return Ok(false);
        }
        if !self.startup_mode.can_transition_to(to) {
            return Err(ProxyError::InvalidTransition {
                from: format!("{:?}", self.startup_mode),
                to: format!("{:?}", to),
            });
        }
        self.startup_mode = to;
        Ok(true)
    }

    /// `Ready` is only reachable from `Discovering` (I5).
    pub fn transition_connection_state(
        &mut self,
        to: ConnectionState,
    ) -> Result<(), ProxyError> {
        if to == ConnectionState::Ready && self.connection_state != ConnectionState::Discovering {
            return Err(ProxyError::Invariant(
                "Ready is only reachable from Discovering".to_string(),
            ));
        }
        self.connection_state = to;
        Ok(())
    }

    /// Threshold that triggers "obvious failure" escalation even during
    /// startup mode (spec.md step 5): 2x the normal threshold.
    fn obvious_failure_threshold(&self) -> u32 {
        self.threshold.saturating_mul(2)
    }

    /// Record a transport failure. Returns `Some` if the caller should
    /// auto-disable this client right now (step 3, or the step-5
    /// escalation); returns `None` if suspended by startup mode or below
    /// threshold.
    pub fn on_failure(&mut self, reason: &str) -> Option<AutoDisableDecision> {
        self.failures.record_failure();

        let obvious = self.failures.consecutive_failures >= self.obvious_failure_threshold();
        if self.startup_mode_suspended && !obvious {
            return None;
        }

        if self.failures.consecutive_failures >= self.threshold
            && matches!(self.startup_mode, StartupMode::Active | StartupMode::LazyLoading)
        {
            return Some(AutoDisableDecision {
                reason: reason.to_string(),
                consecutive_failures: self.failures.consecutive_failures,
            });
        }
        None
    }

    pub fn on_success(&mut self) {
        self.failures.record_success();
    }

    /// Batch finalization when the scheduler clears startup mode after a
    /// wave drains (step 5). Returns `Some` if this client now qualifies
    /// for auto-disable.
    pub fn clear_startup_mode(&mut self) -> Option<AutoDisableDecision> {
        self.startup_mode_suspended = false;
        if self.failures.consecutive_failures >= self.threshold
            && matches!(self.startup_mode, StartupMode::Active | StartupMode::LazyLoading)
        {
            return Some(AutoDisableDecision {
                reason: "threshold exceeded during startup wave".to_string(),
                consecutive_failures: self.failures.consecutive_failures,
            });
        }
        None
    }
}
