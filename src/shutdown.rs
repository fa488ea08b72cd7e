//! Cooperative cancellation shared by every long-running stage.
//!
//! The [ShutdownCoordinator] is the only process-wide piece of mutable state:
//! a flag that is set once when the hosting process wants to stop.
//! Each backup or restore combines it with its own deadline into a
//! [Cancellation] which the stages poll at their natural suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error};

/// Write-once, read-many shutdown flag.
///
/// Cloning is cheap and every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every in-flight operation to abort.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            log::info!(target: "shutdown", "Shutdown requested, aborting in-flight operations");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Creates the cancellation token of a single operation that may run
    /// for at most `budget`.
    pub fn cancellation(&self, budget: Duration) -> Cancellation {
        Cancellation {
            shutdown: self.clone(),
            deadline: Instant::now().checked_add(budget),
        }
    }
}

/// Why an operation was cancelled.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    #[display("service shutdown was requested")]
    Shutdown,
    #[display("the operation exceeded its time budget")]
    TimedOut,
}

/// Returned by [Cancellation::check] once the operation must stop.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display("operation cancelled: {reason}")]
pub struct Cancelled {
    pub reason: CancelReason,
}

/// Cancellation token of one backup or restore.
#[derive(Debug, Clone)]
pub struct Cancellation {
    shutdown: ShutdownCoordinator,
    /// `None` when the budget overflows [Instant], i.e. never times out.
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn reason(&self) -> Option<CancelReason> {
        if self.shutdown.is_shutdown_requested() {
            Some(CancelReason::Shutdown)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(CancelReason::TimedOut)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        match self.reason() {
            Some(reason) => Err(Cancelled { reason }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_visible_to_all_clones() {
        let coordinator = ShutdownCoordinator::new();
        let cancel = coordinator.cancellation(Duration::from_secs(60));
        assert!(cancel.check().is_ok());

        coordinator.clone().request_shutdown();

        assert!(coordinator.is_shutdown_requested());
        assert_eq!(cancel.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn elapsed_budget_times_out() {
        let coordinator = ShutdownCoordinator::new();
        let cancel = coordinator.cancellation(Duration::ZERO);

        let err = cancel.check().unwrap_err();
        assert_eq!(err.reason, CancelReason::TimedOut);
    }

    #[test]
    fn huge_budget_never_times_out() {
        let cancel = ShutdownCoordinator::new().cancellation(Duration::MAX);
        assert!(!cancel.is_cancelled());
    }
}
