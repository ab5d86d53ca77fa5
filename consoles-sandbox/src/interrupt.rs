//! Cooperative interrupt controller
//!
//! Backends call [`InterruptController::check`] from their step hook. The
//! controller polls the host's termination predicate and, the first time it
//! reports true, trips: every later check fails until the host resets it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Host-supplied predicate polled during execution.
pub type TerminationPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Internal abort signal raised into the interpreter when the controller trips.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("program stopped: exceeded limits")]
pub struct Terminated;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Armed,
    Tripped,
}

pub struct InterruptController {
    predicate: TerminationPredicate,
    tripped: AtomicBool,
    checks: AtomicU64,
}

impl InterruptController {
    pub fn new(predicate: TerminationPredicate) -> Self {
        Self {
            predicate,
            tripped: AtomicBool::new(false),
            checks: AtomicU64::new(0),
        }
    }

    /// A controller whose predicate never fires.
    pub fn never() -> Self {
        Self::new(Arc::new(|| false))
    }

    /// One step check. Trips (irreversibly for this run) once the predicate fires.
    pub fn check(&self) -> Result<(), Terminated> {
        if self.tripped.load(Ordering::Acquire) {
            return Err(Terminated);
        }
        self.checks.fetch_add(1, Ordering::Relaxed);
        if (self.predicate)() {
            if !self.tripped.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    checks = self.checks.load(Ordering::Relaxed),
                    "Termination requested, aborting script"
                );
            }
            return Err(Terminated);
        }
        Ok(())
    }

    pub fn state(&self) -> InterruptState {
        if self.tripped.load(Ordering::Acquire) {
            InterruptState::Tripped
        } else {
            InterruptState::Armed
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.state() == InterruptState::Tripped
    }

    /// Number of predicate polls since the last reset.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Re-arm for another run on the same instance.
    pub fn reset(&self) {
        self.tripped.store(false, Ordering::Release);
        self.checks.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for InterruptController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptController")
            .field("state", &self.state())
            .field("checks", &self.checks())
            .finish()
    }
}

/// Shared flag a host can trip from any thread to stop a running program.
#[derive(Debug, Clone, Default)]
pub struct TerminationFlag(Arc<AtomicBool>);

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn predicate(&self) -> TerminationPredicate {
        let flag = Arc::clone(&self.0);
        Arc::new(move || flag.load(Ordering::Acquire))
    }
}

/// Fires once `deadline` has passed.
pub fn deadline(deadline: Instant) -> TerminationPredicate {
    Arc::new(move || Instant::now() >= deadline)
}

/// Fires when any of `predicates` fires.
pub fn any_of(predicates: Vec<TerminationPredicate>) -> TerminationPredicate {
    Arc::new(move || predicates.iter().any(|p| p()))
}
