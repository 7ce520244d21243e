//! Clock and Scheduler Ports (Driven Ports)
//!
//! Time sources for the throttle layer, the health monitor and the
//! manager. Production code reads tokio's clock so paused-time tests work
//! unchanged; unit tests can substitute a manually advanced clock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Deferred unit of work handed to a [`Scheduler`].
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for gaps and windows.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for timestamps shown to consumers.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Runs a task once after a delay.
///
/// Tasks are fire-and-forget; callers that need cancellation hold a weak
/// reference or a generation check inside the task.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    fn after(&self, delay: Duration, task: ScheduledTask);
}
