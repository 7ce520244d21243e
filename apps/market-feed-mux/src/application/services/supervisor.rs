//! Connection Supervisor
//!
//! Owns the single upstream connection and drives its lifecycle:
//!
//! - Opens a link through the [`Transport`] port and replays every active
//!   subscription before any other outbound frame of the session
//! - Pumps queued control frames to the link and inbound frames to the
//!   codec and the subscription multiplexer
//! - Sends keep-alive pings, marks a silent session degraded and tears it
//!   down after the silence timeout
//! - Reconnects with capped exponential backoff and gives up after the
//!   configured number of attempts
//!
//! Each run of the loop carries a generation number. State changes made on
//! behalf of a run are applied only while that run is still the current
//! one, so a cancelled run that has not yet noticed its cancellation cannot
//! overwrite the state of its successor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::health::HealthMonitor;
use super::mux::SubscriptionMux;
use super::reconnect::{Backoff, ReconnectConfig};
use crate::application::ports::{
    FrameCodec, FrameSink, Transport, TransportError, TransportLink,
};
use crate::domain::health::DisconnectReason;
use crate::domain::streaming::{ControlFrame, InboundFrame};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Keep-alive and liveness settings for a session.
///
/// A zero duration switches the corresponding check off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Silence after which the session is marked degraded.
    pub degraded_after: Duration,
    /// Silence after which the session is torn down and reconnected.
    pub silence_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            degraded_after: Duration::from_secs(30),
            silence_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Ping ticker for a session, or `None` when pings are off.
    fn ping_ticker(&self) -> Option<Interval> {
        if self.ping_interval.is_zero() {
            return None;
        }
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    /// When the silence watchdog next fires, or `None` if nothing is left
    /// to check.
    fn watchdog(&self, last_inbound: Instant, degraded: bool) -> Option<Instant> {
        let timeout = (!self.silence_timeout.is_zero()).then_some(self.silence_timeout);
        let degrade = (!degraded && !self.degraded_after.is_zero()).then_some(self.degraded_after);
        let wait = match (degrade, timeout) {
            (Some(degrade), Some(timeout)) => degrade.min(timeout),
            (Some(wait), None) | (None, Some(wait)) => wait,
            (None, None) => return None,
        };
        Some(last_inbound + wait)
    }

    fn timed_out(&self, silent: Duration) -> bool {
        !self.silence_timeout.is_zero() && silent >= self.silence_timeout
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorConfig {
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
    /// Keep-alive policy.
    pub heartbeat: HeartbeatConfig,
}

// =============================================================================
// Counters
// =============================================================================

/// Lifetime counters of the feed.
#[derive(Debug, Default)]
pub struct FeedCounters {
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    malformed_frames: AtomicU64,
    frames_sent: AtomicU64,
}

impl FeedCounters {
    /// Inbound frames received.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Established sessions lost and retried.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Inbound frames dropped as malformed.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Control frames written upstream.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Phase
// =============================================================================

#[derive(Debug)]
enum SupervisorPhase {
    /// Never started.
    Idle,
    /// A run loop is active.
    Running {
        generation: u64,
        cancel: CancellationToken,
    },
    /// Stopped by request or after giving up.
    Stopped,
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    OpenFailed(TransportError),
    Lost(TransportError),
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the upstream connection.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn FrameCodec>,
    mux: Arc<SubscriptionMux>,
    health: Arc<HealthMonitor>,
    counters: FeedCounters,
    phase: Mutex<SupervisorPhase>,
    next_generation: AtomicU64,
}

impl ConnectionSupervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn FrameCodec>,
        mux: Arc<SubscriptionMux>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            config,
            transport,
            codec,
            mux,
            health,
            counters: FeedCounters::default(),
            phase: Mutex::new(SupervisorPhase::Idle),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start the connection loop on `runtime`.
    ///
    /// No-op if a loop is already running. The status moves to
    /// `Connecting` before this returns. Returns true if a loop was
    /// started.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> bool {
        let mut phase = self.phase.lock();
        if matches!(*phase, SupervisorPhase::Running { .. }) {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *phase = SupervisorPhase::Running {
            generation,
            cancel: cancel.clone(),
        };
        let update = self.health.mark_connecting(1, 0);
        drop(phase);

        self.health.publish(update);
        tracing::info!(generation, "Starting upstream connection");
        runtime.spawn(Arc::clone(self).run(generation, cancel));
        true
    }

    /// Stop the connection loop and close the link.
    ///
    /// Subscriptions are kept and replayed by the next `start`. Returns
    /// true if a loop was running.
    pub fn stop(&self) -> bool {
        let mut phase = self.phase.lock();
        let previous = std::mem::replace(&mut *phase, SupervisorPhase::Stopped);
        let was_running = match previous {
            SupervisorPhase::Running { cancel, .. } => {
                cancel.cancel();
                true
            }
            SupervisorPhase::Idle | SupervisorPhase::Stopped => false,
        };
        self.mux.detach();
        let update = self.health.reset();
        drop(phase);

        self.health.publish(update);
        if was_running {
            tracing::info!("Upstream connection stopped");
        }
        was_running
    }

    /// Whether the supervisor has never been started or stopped.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(*self.phase.lock(), SupervisorPhase::Idle)
    }

    /// Whether a connection loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.phase.lock(), SupervisorPhase::Running { .. })
    }

    /// Lifetime counters.
    #[must_use]
    pub const fn counters(&self) -> &FeedCounters {
        &self.counters
    }

    /// Run `f` only while `generation` is the current run.
    fn guarded<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let phase = self.phase.lock();
        match &*phase {
            SupervisorPhase::Running {
                generation: current,
                ..
            } if *current == generation => Some(f()),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Run Loop
    // -------------------------------------------------------------------------

    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut attempt: u32 = 1;

        loop {
            let end = self.run_session(generation, &cancel).await;
            let _ = self.guarded(generation, || self.mux.detach());

            match end {
                SessionEnd::Cancelled => return,
                SessionEnd::OpenFailed(error) => {
                    tracing::warn!(attempt, error = %error, "Upstream connect failed");
                    attempt += 1;
                }
                SessionEnd::Lost(error) => {
                    tracing::warn!(error = %error, "Upstream connection lost");
                    backoff.restart();
                    attempt = 1;
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.health.record_reconnect();
                    metrics::record_reconnect();
                }
            }

            if cancel.is_cancelled() {
                return;
            }

            let Some(delay) = backoff.next() else {
                self.give_up(generation, attempt.saturating_sub(1));
                return;
            };

            let retries = backoff.retries();
            if let Some(update) =
                self.guarded(generation, || self.health.mark_connecting(attempt, retries))
            {
                self.health.publish(update);
            }
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to upstream"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn give_up(&self, generation: u64, attempts: u32) {
        let update = {
            let mut phase = self.phase.lock();
            match &*phase {
                SupervisorPhase::Running {
                    generation: current,
                    ..
                } if *current == generation => {
                    *phase = SupervisorPhase::Stopped;
                    self.health
                        .mark_disconnected(DisconnectReason::ReconnectExhausted { attempts })
                }
                _ => None,
            }
        };

        if update.is_some() {
            tracing::error!(attempts, "Giving up on upstream connection");
        }
        self.health.publish(update);
    }

    async fn run_session(&self, generation: u64, cancel: &CancellationToken) -> SessionEnd {
        let session_id = Uuid::new_v4();

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            opened = self.transport.open() => opened,
        };
        let TransportLink {
            mut sink,
            mut stream,
        } = match opened {
            Ok(link) => link,
            Err(error) => return SessionEnd::OpenFailed(error),
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let attached = self.guarded(generation, || {
            let replayed = self.mux.attach(outbound_tx);
            (replayed, self.health.mark_connected())
        });
        let Some((replayed, update)) = attached else {
            close(&mut sink).await;
            return SessionEnd::Cancelled;
        };
        self.health.publish(update);
        tracing::info!(session_id = %session_id, replayed, "Connected to upstream");

        let heartbeat = &self.config.heartbeat;
        let mut ping = heartbeat.ping_ticker();
        let mut last_inbound = Instant::now();
        let mut degraded = false;

        loop {
            let watchdog = heartbeat.watchdog(last_inbound, degraded);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    close(&mut sink).await;
                    tracing::debug!(session_id = %session_id, "Session cancelled");
                    return SessionEnd::Cancelled;
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(error) = self.send_frame(&mut sink, &frame).await {
                        return SessionEnd::Lost(error);
                    }
                }
                () = next_ping(ping.as_mut()) => {
                    if let Err(error) = self.send_frame(&mut sink, &ControlFrame::Ping).await {
                        return SessionEnd::Lost(error);
                    }
                }
                () = sleep_until(watchdog) => {
                    let silent = last_inbound.elapsed();
                    if heartbeat.timed_out(silent) {
                        tracing::warn!(
                            session_id = %session_id,
                            silent_ms = silent.as_millis(),
                            "Heartbeat timeout"
                        );
                        close(&mut sink).await;
                        return SessionEnd::Lost(TransportError::Receive(
                            "heartbeat timeout".to_string(),
                        ));
                    }
                    degraded = true;
                    if let Some(update) = self.guarded(generation, || self.health.mark_degraded()).flatten() {
                        tracing::warn!(session_id = %session_id, "Upstream connection degraded");
                        self.health.notify(&update);
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(text)) => {
                            last_inbound = Instant::now();
                            degraded = false;
                            self.handle_inbound(generation, &text);
                        }
                        Some(Err(error)) => return SessionEnd::Lost(error),
                        None => {
                            return SessionEnd::Lost(TransportError::Closed {
                                code: None,
                                reason: "stream ended".to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn send_frame(
        &self,
        sink: &mut FrameSink,
        frame: &ControlFrame,
    ) -> Result<(), TransportError> {
        let text = match self.codec.encode(frame) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(method = frame.method(), error = %error, "Failed to encode control frame");
                return Ok(());
            }
        };

        sink.send(text).await?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_sent(frame.method());
        Ok(())
    }

    fn handle_inbound(&self, generation: u64, text: &str) {
        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        if let Some(update) = self.guarded(generation, || self.health.record_message()).flatten() {
            tracing::info!("Upstream connection recovered");
            self.health.notify(&update);
        }

        let frames = match self.codec.decode(text) {
            Ok(frames) => frames,
            Err(error) => {
                self.counters
                    .malformed_frames
                    .fetch_add(1, Ordering::Relaxed);
                metrics::record_malformed_frame();
                tracing::warn!(error = %error, "Dropping malformed frame");
                return;
            }
        };

        for frame in frames {
            match frame {
                InboundFrame::Market(event) => {
                    let channel = event.channel_type();
                    metrics::record_frame_received(channel.wire_name());
                    let started = std::time::Instant::now();
                    let handlers = self.mux.dispatch(event);
                    metrics::record_dispatch(channel.wire_name(), handlers, started.elapsed());
                }
                InboundFrame::SubscriptionAck { method, key } => {
                    tracing::debug!(method = ?method, key = %key, "Subscription acknowledged");
                }
                InboundFrame::Pong => {
                    tracing::trace!("Pong received");
                }
                InboundFrame::UpstreamError(message) => {
                    tracing::warn!(error = %message, "Upstream reported an error");
                }
                InboundFrame::Ignored(channel) => {
                    tracing::trace!(channel = %channel, "Ignoring frame");
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("config", &self.config)
            .field("phase", &*self.phase.lock())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

async fn next_ping(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn close(sink: &mut FrameSink) {
    if let Err(error) = sink.close().await {
        tracing::debug!(error = %error, "Error closing upstream link");
    }
}

// =============================================================================
// Tests
// =============================================================================
