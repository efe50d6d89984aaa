//! Graceful shutdown — ordered teardown of the delivery gateway.
//!
//! Shutdown sequence (order matters):
//! 1. Stop accepting new sends (draining)
//! 2. Cancel queued messages that have not started an attempt
//! 3. Wait for in-flight attempts to finish (bounded by the grace period)
//! 4. Abort whatever is still running; its tickets resolve as cancelled
//! 5. Disconnect the REST/event-stream pair
//! 6. Done

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shutdown phase identifiers (in execution order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ShutdownPhase {
    Running = 0,
    Draining = 1,
    CancellingQueued = 2,
    WaitingForInFlight = 3,
    AbortingStragglers = 4,
    Disconnecting = 5,
    Complete = 6,
}

impl ShutdownPhase {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::CancellingQueued,
            3 => Self::WaitingForInFlight,
            4 => Self::AbortingStragglers,
            5 => Self::Disconnecting,
            _ => Self::Complete,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::CancellingQueued => write!(f, "cancelling_queued"),
            Self::WaitingForInFlight => write!(f, "waiting_for_in_flight"),
            Self::AbortingStragglers => write!(f, "aborting_stragglers"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Configuration for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for in-flight attempts.
    pub grace_period: Duration,
    /// Human-readable reason, logged when shutdown starts.
    pub shutdown_reason: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            shutdown_reason: "Gateway shutdown".to_string(),
        }
    }
}

/// Log entry for a completed shutdown phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseLog {
    pub phase: ShutdownPhase,
    /// Milliseconds since shutdown started.
    pub elapsed_ms: u64,
    pub success: bool,
    pub message: Option<String>,
}

/// Shutdown progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownStatus {
    pub is_shutting_down: bool,
    pub current_phase: ShutdownPhase,
    pub elapsed_secs: f64,
    pub reason: String,
    pub phases_completed: Vec<PhaseLog>,
}

/// Tracks the state of a graceful shutdown in progress.
pub struct ShutdownCoordinator {
    is_shutting_down: AtomicBool,
    current_phase: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    config: ShutdownConfig,
    phase_log: Mutex<Vec<PhaseLog>>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            is_shutting_down: AtomicBool::new(false),
            current_phase: AtomicU8::new(ShutdownPhase::Running as u8),
            started_at: Mutex::new(None),
            config,
            phase_log: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Returns `false` if already shutting down.
    pub fn initiate(&self) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        info!(reason = %self.config.shutdown_reason, "Graceful shutdown initiated");
        true
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.current_phase.load(Ordering::SeqCst))
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    /// Advance to the next phase. Records timing for the completed phase.
    pub fn advance_phase(&self, next: ShutdownPhase, success: bool, message: Option<String>) {
        let current = self.current_phase();
        let elapsed_ms = self.elapsed().as_millis() as u64;

        self.phase_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PhaseLog {
                phase: current,
                elapsed_ms,
                success,
                message: message.clone(),
            });
        self.current_phase.store(next as u8, Ordering::SeqCst);

        if success {
            info!(phase = %current, next = %next, elapsed_ms, "Shutdown phase complete");
        } else {
            warn!(phase = %current, next = %next, error = ?message, "Shutdown phase incomplete, continuing");
        }
    }

    pub fn status(&self) -> ShutdownStatus {
        ShutdownStatus {
            is_shutting_down: self.is_shutting_down(),
            current_phase: self.current_phase(),
            elapsed_secs: self.elapsed().as_secs_f64(),
            reason: self.config.shutdown_reason.clone(),
            phases_completed: self
                .phase_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.config.grace_period
    }

    /// Time left in the grace period (zero once exceeded or before start).
    pub fn grace_remaining(&self) -> Duration {
        if !self.is_shutting_down() {
            return self.config.grace_period;
        }
        self.config.grace_period.saturating_sub(self.elapsed())
    }
}
