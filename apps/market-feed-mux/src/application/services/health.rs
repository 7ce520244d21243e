//! Connection health monitoring.
//!
//! Tracks the connection lifecycle and the cadence of inbound frames,
//! derives a quality score and publishes [`HealthSnapshot`]s to listeners
//! and a `watch` channel on every status transition and on a fixed
//! interval.
//!
//! Transition methods return a [`HealthUpdate`] instead of calling
//! listeners themselves. Callers invoke [`HealthMonitor::notify`] once they
//! have released their own locks, so a listener may call back into the
//! manager. Updates carry a revision; delivery is serialized and an update
//! older than the last one delivered is dropped, so listeners never see a
//! stale status after a newer one.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;

use crate::application::ports::{Clock, Scheduler};
use crate::domain::health::{
    ConnectionQuality, ConnectionState, ConnectionStatus, DisconnectReason, HealthSnapshot,
    QualityInputs, ScoringRules,
};
use crate::infrastructure::metrics;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for health monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Interval between periodic snapshots (default: 5 seconds).
    pub interval: Duration,
    /// Rolling window for inter-frame gaps (default: 60 seconds).
    pub gap_window: Duration,
    /// Rolling window for reconnects (default: 5 minutes).
    pub reconnect_window: Duration,
    /// Maximum gap samples to keep.
    pub max_gap_samples: usize,
    /// Score penalties and thresholds.
    pub rules: ScoringRules,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            gap_window: Duration::from_secs(60),
            reconnect_window: Duration::from_secs(300),
            max_gap_samples: 1000,
            rules: ScoringRules::default(),
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Health observer callback.
pub type HealthListener = Arc<dyn Fn(&HealthSnapshot) + Send + Sync>;

/// A snapshot produced by a state change, ordered by revision.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthUpdate {
    revision: u64,
    snapshot: HealthSnapshot,
}

impl HealthUpdate {
    /// The published snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &HealthSnapshot {
        &self.snapshot
    }
}

/// Token returned by [`HealthMonitor::on_health`], used to remove the
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HealthListenerHandle(u64);

// ============================================================================
// Monitor State
// ============================================================================

#[derive(Debug)]
struct MonitorState {
    revision: u64,
    status: ConnectionStatus,
    connecting_attempt: u32,
    retries: u32,
    reason: DisconnectReason,
    last_frame: Option<Instant>,
    last_message_at: Option<DateTime<Utc>>,
    gaps: VecDeque<(Instant, Duration)>,
    reconnects: VecDeque<Instant>,
}

impl MonitorState {
    const fn new() -> Self {
        Self {
            revision: 0,
            status: ConnectionStatus::Disconnected,
            connecting_attempt: 0,
            retries: 0,
            reason: DisconnectReason::NeverConnected,
            last_frame: None,
            last_message_at: None,
            gaps: VecDeque::new(),
            reconnects: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: Instant, config: &HealthConfig) {
        while let Some((at, _)) = self.gaps.front() {
            if now.saturating_duration_since(*at) > config.gap_window {
                self.gaps.pop_front();
            } else {
                break;
            }
        }
        while self.gaps.len() > config.max_gap_samples {
            self.gaps.pop_front();
        }
        while let Some(at) = self.reconnects.front() {
            if now.saturating_duration_since(*at) > config.reconnect_window {
                self.reconnects.pop_front();
            } else {
                break;
            }
        }
    }

    fn inputs(&self, now: Instant) -> QualityInputs {
        let silence = self
            .last_frame
            .map(|last| now.saturating_duration_since(last));
        let max_recent_gap = self
            .gaps
            .iter()
            .map(|(_, gap)| *gap)
            .chain(silence)
            .max();

        QualityInputs {
            status: self.status,
            recent_reconnects: self.reconnects.len(),
            max_recent_gap,
        }
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Observes connection lifecycle events and inbound cadence.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<MonitorState>,
    updates: watch::Sender<HealthSnapshot>,
    listeners: Mutex<Vec<(HealthListenerHandle, HealthListener)>>,
    /// Revision most recently handed to listeners.
    delivered: ReentrantMutex<Cell<u64>>,
    next_listener: AtomicU64,
    ticking: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor in the `Disconnected { NeverConnected }` state.
    #[must_use]
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        let (updates, _) = watch::channel(HealthSnapshot::Disconnected {
            reason: DisconnectReason::NeverConnected,
        });
        Self {
            config,
            clock,
            scheduler,
            state: Mutex::new(MonitorState::new()),
            updates,
            listeners: Mutex::new(Vec::new()),
            delivered: ReentrantMutex::new(Cell::new(0)),
            next_listener: AtomicU64::new(0),
            ticking: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// A connection attempt (1-based) has started after `retries` backoff
    /// waits in the current cycle.
    pub fn mark_connecting(&self, attempt: u32, retries: u32) -> Option<HealthUpdate> {
        self.transition(|state| {
            state.status = ConnectionStatus::Connecting;
            state.connecting_attempt = attempt.max(1);
            state.retries = retries;
            state.last_frame = None;
            true
        })
    }

    /// A session is open.
    pub fn mark_connected(&self) -> Option<HealthUpdate> {
        self.transition(|state| {
            state.status = ConnectionStatus::Connected;
            state.connecting_attempt = 0;
            state.retries = 0;
            state.last_frame = None;
            true
        })
    }

    /// The open session has gone quiet. No-op unless connected.
    pub fn mark_degraded(&self) -> Option<HealthUpdate> {
        self.transition(|state| {
            if state.status != ConnectionStatus::Connected {
                return false;
            }
            state.status = ConnectionStatus::Degraded;
            true
        })
    }

    /// The connection is down and not being retried.
    pub fn mark_disconnected(&self, reason: DisconnectReason) -> Option<HealthUpdate> {
        self.transition(|state| {
            if state.status == ConnectionStatus::Disconnected && state.reason == reason {
                return false;
            }
            state.status = ConnectionStatus::Disconnected;
            state.reason = reason;
            state.connecting_attempt = 0;
            state.retries = 0;
            state.last_frame = None;
            true
        })
    }

    /// An established session was lost and will be retried.
    pub fn record_reconnect(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.reconnects.push_back(now);
        state.trim(now, &self.config);
    }

    /// An inbound frame arrived.
    ///
    /// Returns an update when the frame lifts a degraded connection.
    pub fn record_message(&self) -> Option<HealthUpdate> {
        let now = self.clock.now();
        let wall = self.clock.wall_clock();
        self.transition(|state| {
            if let Some(last) = state.last_frame {
                state.gaps.push_back((now, now.saturating_duration_since(last)));
            }
            state.last_frame = Some(now);
            state.last_message_at = Some(wall);

            if state.status == ConnectionStatus::Degraded {
                state.status = ConnectionStatus::Connected;
                return true;
            }
            false
        })
    }

    /// Reset after an explicit disconnect.
    pub fn reset(&self) -> Option<HealthUpdate> {
        self.transition(|state| {
            *state = MonitorState {
                revision: state.revision,
                ..MonitorState::new()
            };
            state.reason = DisconnectReason::Requested;
            true
        })
    }

    fn transition(&self, apply: impl FnOnce(&mut MonitorState) -> bool) -> Option<HealthUpdate> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.trim(now, &self.config);
        if !apply(&mut state) {
            return None;
        }
        let update = self.revise_locked(&mut state, now);
        drop(state);

        let snapshot = &update.snapshot;
        tracing::debug!(
            revision = update.revision,
            status = %snapshot.status(),
            quality = %snapshot.quality(),
            score = snapshot.score(),
            "Connection health transition"
        );
        Some(update)
    }

    fn revise_locked(&self, state: &mut MonitorState, now: Instant) -> HealthUpdate {
        state.revision += 1;
        let snapshot = self.snapshot_locked(state, now);
        self.updates.send_replace(snapshot.clone());
        HealthUpdate {
            revision: state.revision,
            snapshot,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Current health snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.snapshot_locked(&mut state, now)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.trim(now, &self.config);
        let inputs = state.inputs(now);
        ConnectionState {
            status: state.status,
            quality_score: self.config.rules.score(&inputs),
            reconnect_attempts: state.retries,
            last_message_at: state.last_message_at,
        }
    }

    /// Current quality bucket.
    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.snapshot().quality()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    fn snapshot_locked(&self, state: &mut MonitorState, now: Instant) -> HealthSnapshot {
        state.trim(now, &self.config);
        let inputs = state.inputs(now);
        let rules = &self.config.rules;

        match state.status {
            ConnectionStatus::Connected => HealthSnapshot::Connected {
                quality: rules.quality(&inputs),
                score: rules.score(&inputs),
                last_update: state.last_message_at,
            },
            ConnectionStatus::Degraded => HealthSnapshot::Degraded {
                quality: rules.quality(&inputs),
                score: rules.score(&inputs),
                last_update: state.last_message_at,
            },
            ConnectionStatus::Connecting => HealthSnapshot::Connecting {
                attempt: state.connecting_attempt,
            },
            ConnectionStatus::Disconnected => HealthSnapshot::Disconnected {
                reason: state.reason,
            },
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Register a listener for health snapshots.
    pub fn on_health(&self, listener: HealthListener) -> HealthListenerHandle {
        let handle = HealthListenerHandle(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((handle, listener));
        handle
    }

    /// Remove a listener. Returns false if it was already removed.
    pub fn remove_listener(&self, handle: HealthListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle);
        listeners.len() != before
    }

    /// Receiver that always holds the latest snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.updates.subscribe()
    }

    /// Deliver an update to every listener.
    ///
    /// Deliveries from different threads run one at a time. An update older
    /// than the last one delivered is dropped, and an update superseded by
    /// a listener's own reentrant call stops reaching the remaining
    /// listeners. Must be called without holding any lock a listener could
    /// need.
    pub fn notify(&self, update: &HealthUpdate) {
        let delivered = self.delivered.lock();
        if update.revision <= delivered.get() {
            tracing::trace!(revision = update.revision, "Dropping stale health update");
            return;
        }
        delivered.set(update.revision);

        let snapshot = &update.snapshot;
        metrics::record_connection_health(snapshot.status(), snapshot.score());

        let listeners: Vec<HealthListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if delivered.get() != update.revision {
                break;
            }
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                tracing::error!("Health listener panicked");
                metrics::record_handler_panic();
            }
        }
    }

    /// Deliver an update if there is one.
    pub fn publish(&self, update: Option<HealthUpdate>) {
        if let Some(update) = update {
            self.notify(&update);
        }
    }

    // ------------------------------------------------------------------------
    // Periodic Emission
    // ------------------------------------------------------------------------

    /// Start emitting a snapshot every `interval`. Idempotent.
    ///
    /// The ticker stops once the monitor is dropped.
    pub fn start_ticker(self: &Arc<Self>) {
        if self.config.interval.is_zero() || self.ticking.swap(true, Ordering::AcqRel) {
            return;
        }
        Self::schedule_tick(Arc::downgrade(self), self.config.interval, &self.scheduler);
    }

    fn schedule_tick(weak: Weak<Self>, interval: Duration, scheduler: &Arc<dyn Scheduler>) {
        scheduler.after(
            interval,
            Box::new(move || {
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                monitor.tick();
                Self::schedule_tick(weak, interval, &monitor.scheduler);
            }),
        );
    }

    fn tick(&self) {
        let update = {
            let now = self.clock.now();
            let mut state = self.state.lock();
            self.revise_locked(&mut state, now)
        };
        self.notify(&update);
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
