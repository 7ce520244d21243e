//! Throttle Layer
//!
//! Wraps a consumer callback so it fires at most once per window:
//!
//! - The first call in a quiet period is delivered immediately and opens a
//!   window.
//! - Calls inside the window overwrite a single pending slot; nothing is
//!   queued.
//! - When the window ends, a pending payload is delivered and a new window
//!   opens. With nothing pending the throttle goes idle.
//!
//! The last payload of a burst is therefore always delivered unless the
//! wrapper is deactivated first. A zero window disables throttling.
//!
//! Handler invocations and [`Throttled::deactivate`] share a reentrant
//! gate. Once `deactivate` returns the handler is not running on any
//! thread and never runs again; a handler may deactivate itself.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};

use crate::application::ports::Scheduler;
use crate::infrastructure::metrics;

/// Consumer callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug)]
enum WindowState<T> {
    Idle,
    Open { pending: Option<Arc<T>> },
}

/// A throttled consumer callback.
pub struct Throttled<T> {
    handler: Handler<T>,
    window: Duration,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<WindowState<T>>,
    gate: ReentrantMutex<()>,
    active: AtomicBool,
    label: String,
}

impl<T: Send + Sync + 'static> Throttled<T> {
    /// Wrap `handler` with a throttle window.
    ///
    /// `label` identifies the subscription in logs.
    pub fn wrap(
        handler: Handler<T>,
        window: Duration,
        scheduler: Arc<dyn Scheduler>,
        label: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            window,
            scheduler,
            state: Mutex::new(WindowState::Idle),
            gate: ReentrantMutex::new(()),
            active: AtomicBool::new(true),
            label: label.into(),
        })
    }

    /// Offer a payload.
    pub fn call(self: &Arc<Self>, payload: Arc<T>) {
        if !self.is_active() {
            return;
        }

        if self.window.is_zero() {
            self.invoke(&payload);
            return;
        }

        let fire_now = {
            let mut state = self.state.lock();
            match &mut *state {
                WindowState::Idle => {
                    *state = WindowState::Open { pending: None };
                    true
                }
                WindowState::Open { pending } => {
                    *pending = Some(payload.clone());
                    false
                }
            }
        };

        if fire_now {
            self.schedule_window_end();
            self.invoke(&payload);
        }
    }

    /// Stop delivering, including any pending trailing payload.
    ///
    /// Waits for an invocation in progress on another thread.
    pub fn deactivate(&self) {
        let _gate = self.gate.lock();
        self.active.store(false, Ordering::Release);
        if let WindowState::Open { pending } = &mut *self.state.lock() {
            pending.take();
        }
    }

    /// Whether the wrapper still delivers.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn schedule_window_end(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.after(
            self.window,
            Box::new(move || {
                if let Some(throttled) = weak.upgrade() {
                    throttled.close_window();
                }
            }),
        );
    }

    fn close_window(self: &Arc<Self>) {
        let trailing = {
            let mut state = self.state.lock();
            let trailing = match &mut *state {
                WindowState::Open { pending } => pending.take(),
                WindowState::Idle => return,
            };
            if trailing.is_none() {
                *state = WindowState::Idle;
            }
            trailing
        };

        if let Some(payload) = trailing {
            self.schedule_window_end();
            self.invoke(&payload);
        }
    }

    fn invoke(&self, payload: &T) {
        let _gate = self.gate.lock();
        if !self.is_active() {
            return;
        }

        let handler = &self.handler;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            tracing::error!(
                subscription = %self.label,
                panic = %panic_message(panic.as_ref()),
                "Consumer handler panicked"
            );
            metrics::record_handler_panic();
        }
    }
}

impl<T> std::fmt::Debug for Throttled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttled")
            .field("label", &self.label)
            .field("window", &self.window)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
