//! Clock Adapters
//!
//! - [`SystemClock`] and [`TokioScheduler`] back production use. Both read
//!   tokio's clock, so `start_paused` tests drive them deterministically.
//! - [`ManualClock`] is a single-threaded virtual clock for synchronous
//!   tests: time moves only when [`ManualClock::advance`] is called, and
//!   due tasks run inline in deadline order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};

use crate::application::ports::{Clock, ScheduledTask, Scheduler};

// =============================================================================
// System Clock
// =============================================================================

/// Wall clock plus tokio's monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Tokio Scheduler
// =============================================================================

/// Schedules tasks as tokio timers on a runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule onto the given runtime.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: ScheduledTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

// =============================================================================
// Manual Clock
// =============================================================================

struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    tasks: BTreeMap<(Duration, u64), ScheduledTask>,
}

/// Virtual clock and scheduler advanced by hand.
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// A clock at elapsed zero with no pending tasks.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            wall_origin: DateTime::UNIX_EPOCH,
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_seq: 0,
                tasks: BTreeMap::new(),
            }),
        })
    }

    /// Move time forward, running every task that falls due.
    ///
    /// Tasks scheduled by a running task are picked up in the same call if
    /// they fall due before the target.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().elapsed + by;

        loop {
            let task = {
                let mut state = self.state.lock();
                let due = state
                    .tasks
                    .first_key_value()
                    .is_some_and(|((deadline, _), _)| *deadline <= target);
                if !due {
                    state.elapsed = target;
                    return;
                }
                match state.tasks.pop_first() {
                    Some(((deadline, _), task)) => {
                        state.elapsed = state.elapsed.max(deadline);
                        task
                    }
                    None => return,
                }
            };
            task();
        }
    }

    /// Time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of tasks not yet run.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.wall_origin + self.elapsed()
    }
}

impl Scheduler for ManualClock {
    fn after(&self, delay: Duration, task: ScheduledTask) {
        let mut state = self.state.lock();
        let deadline = state.elapsed + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert((deadline, seq), task);
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("elapsed", &state.elapsed)
            .field("pending_tasks", &state.tasks.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn tasks_run_in_deadline_order() {
        let clock = ManualClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(30, "c"), (10, "a"), (20, "b"), (10, "a2")] {
            let order = Arc::clone(&order);
            clock.after(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(label)),
            );
        }

        clock.advance(Duration::from_millis(25));
        assert_eq!(*order.lock(), vec!["a", "a2", "b"]);
        assert_eq!(clock.pending_tasks(), 1);

        clock.advance(Duration::from_millis(5));
        assert_eq!(*order.lock(), vec!["a", "a2", "b", "c"]);
    }

    #[test]
    fn task_sees_its_deadline_as_now() {
        let clock = ManualClock::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let inner = Arc::clone(&clock);

        clock.after(
            Duration::from_secs(2),
            Box::new(move || *sink.lock() = Some(inner.elapsed())),
        );
        clock.advance(Duration::from_secs(10));

        assert_eq!(*seen.lock(), Some(Duration::from_secs(2)));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn rescheduled_tasks_run_within_one_advance() {
        fn tick(clock: Arc<ManualClock>, count: Arc<AtomicU32>) {
            let next = Arc::clone(&clock);
            clock.after(
                Duration::from_secs(1),
                Box::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                    tick(next, count);
                }),
            );
        }

        let clock = ManualClock::new();
        let count = Arc::new(AtomicU32::new(0));
        tick(Arc::clone(&clock), Arc::clone(&count));

        clock.advance(Duration::from_millis(3500));

        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(clock.pending_tasks(), 1);
    }

    #[test]
    fn wall_clock_tracks_elapsed() {
        let clock = ManualClock::new();
        let start = clock.wall_clock();
        let instant = clock.now();

        clock.advance(Duration::from_millis(1500));

        assert_eq!((clock.wall_clock() - start).num_milliseconds(), 1500);
        assert_eq!(clock.now() - instant, Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&fired);

        scheduler.after(
            Duration::from_secs(5),
            Box::new(move || {
                flag.fetch_add(1, Ordering::Relaxed);
            }),
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn scheduler_requires_runtime() {
        assert!(TokioScheduler::current().is_err());
    }
}
