//! Connection health model.
//!
//! Connection status, quality buckets and the health snapshots published to
//! observers. Scoring is a pure function of the connection status, the
//! number of recent reconnects and the largest recent gap between inbound
//! frames, so it can be tested without a clock.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Status & Quality
// ============================================================================

/// Lifecycle status of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No session and none being attempted.
    Disconnected,
    /// Opening a session (first attempt or reconnect).
    Connecting,
    /// Session open and frames arriving.
    Connected,
    /// Session open but silent past the degrade threshold.
    Degraded,
}

impl ConnectionStatus {
    /// Whether a session is currently open.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Get status as a string for logging and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse connection quality bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Fresh messages, no recent reconnects.
    Excellent,
    /// Occasional gaps or a recent reconnect.
    Good,
    /// Degraded or reconnecting often.
    Poor,
    /// No open session.
    Disconnected,
}

impl ConnectionQuality {
    /// Get quality as a string for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `connect()` has not been called yet.
    NeverConnected,
    /// `disconnect()` was called.
    Requested,
    /// Reconnection gave up.
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

// ============================================================================
// Connection State
// ============================================================================

/// Point-in-time view of the connection, as read through the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Lifecycle status.
    pub status: ConnectionStatus,
    /// Quality score, 0 to 100.
    pub quality_score: u8,
    /// Consecutive failed attempts in the current reconnect cycle.
    pub reconnect_attempts: u32,
    /// Wall-clock time of the last inbound frame.
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            quality_score: 0,
            reconnect_attempts: 0,
            last_message_at: None,
        }
    }
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Health event published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthSnapshot {
    /// Session open and healthy enough to trust.
    Connected {
        /// Quality bucket.
        quality: ConnectionQuality,
        /// Quality score, 0 to 100.
        score: u8,
        /// Time of the last inbound frame.
        last_update: Option<DateTime<Utc>>,
    },
    /// Session open but silent.
    Degraded {
        /// Quality bucket (always `Poor`).
        quality: ConnectionQuality,
        /// Quality score, capped.
        score: u8,
        /// Time of the last inbound frame.
        last_update: Option<DateTime<Utc>>,
    },
    /// Opening a session.
    Connecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// No session.
    Disconnected {
        /// Why the connection is down.
        reason: DisconnectReason,
    },
}

impl HealthSnapshot {
    /// Whether a session is open.
    #[must_use]
    pub const fn connected(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Degraded { .. })
    }

    /// Quality bucket of the snapshot.
    #[must_use]
    pub const fn quality(&self) -> ConnectionQuality {
        match self {
            Self::Connected { quality, .. } | Self::Degraded { quality, .. } => *quality,
            Self::Connecting { .. } | Self::Disconnected { .. } => ConnectionQuality::Disconnected,
        }
    }

    /// Time of the last inbound frame, if connected.
    #[must_use]
    pub const fn last_update(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Connected { last_update, .. } | Self::Degraded { last_update, .. } => {
                *last_update
            }
            Self::Connecting { .. } | Self::Disconnected { .. } => None,
        }
    }

    /// Quality score of the snapshot.
    #[must_use]
    pub const fn score(&self) -> u8 {
        match self {
            Self::Connected { score, .. } | Self::Degraded { score, .. } => *score,
            Self::Connecting { .. } | Self::Disconnected { .. } => 0,
        }
    }

    /// Connection status the snapshot describes.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        match self {
            Self::Connected { .. } => ConnectionStatus::Connected,
            Self::Degraded { .. } => ConnectionStatus::Degraded,
            Self::Connecting { .. } => ConnectionStatus::Connecting,
            Self::Disconnected { .. } => ConnectionStatus::Disconnected,
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Penalties and thresholds used to score a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringRules {
    /// Points deducted per reconnect inside the reconnect window.
    pub reconnect_penalty: u8,
    /// Recent gap considered slow.
    pub slow_gap: Duration,
    /// Points deducted when the largest recent gap is slow.
    pub slow_gap_penalty: u8,
    /// Recent gap considered a stall.
    pub stall_gap: Duration,
    /// Points deducted when the largest recent gap is a stall.
    pub stall_gap_penalty: u8,
    /// Ceiling applied while degraded.
    pub degraded_cap: u8,
    /// Recent reconnects at which quality is forced to poor.
    pub poor_reconnects: usize,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self {
            reconnect_penalty: 25,
            slow_gap: Duration::from_secs(2),
            slow_gap_penalty: 25,
            stall_gap: Duration::from_secs(10),
            stall_gap_penalty: 60,
            degraded_cap: 40,
            poor_reconnects: 3,
        }
    }
}

/// Inputs observed over the rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityInputs {
    /// Current status.
    pub status: ConnectionStatus,
    /// Reconnects inside the reconnect window.
    pub recent_reconnects: usize,
    /// Largest inter-frame gap inside the gap window.
    pub max_recent_gap: Option<Duration>,
}

impl ScoringRules {
    /// Numeric score, 0 to 100.
    #[must_use]
    pub fn score(&self, inputs: &QualityInputs) -> u8 {
        if !inputs.status.is_connected() {
            return 0;
        }

        let reconnects = u32::try_from(inputs.recent_reconnects).unwrap_or(u32::MAX);
        let mut penalty = u32::from(self.reconnect_penalty).saturating_mul(reconnects);

        if let Some(gap) = inputs.max_recent_gap {
            if gap >= self.stall_gap {
                penalty += u32::from(self.stall_gap_penalty);
            } else if gap >= self.slow_gap {
                penalty += u32::from(self.slow_gap_penalty);
            }
        }

        let score = u8::try_from(100_u32.saturating_sub(penalty)).unwrap_or(0);
        if inputs.status == ConnectionStatus::Degraded {
            score.min(self.degraded_cap)
        } else {
            score
        }
    }

    /// Quality bucket for the inputs.
    #[must_use]
    pub fn quality(&self, inputs: &QualityInputs) -> ConnectionQuality {
        match inputs.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                ConnectionQuality::Disconnected
            }
            ConnectionStatus::Degraded => ConnectionQuality::Poor,
            ConnectionStatus::Connected if inputs.recent_reconnects >= self.poor_reconnects => {
                ConnectionQuality::Poor
            }
            ConnectionStatus::Connected => match self.score(inputs) {
                80.. => ConnectionQuality::Excellent,
                50..=79 => ConnectionQuality::Good,
                _ => ConnectionQuality::Poor,
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn connected(recent_reconnects: usize, gap_secs: Option<u64>) -> QualityInputs {
        QualityInputs {
            status: ConnectionStatus::Connected,
            recent_reconnects,
            max_recent_gap: gap_secs.map(Duration::from_secs),
        }
    }

    #[test_case(0, None => (100, ConnectionQuality::Excellent); "fresh")]
    #[test_case(0, Some(1) => (100, ConnectionQuality::Excellent); "short gap")]
    #[test_case(1, None => (75, ConnectionQuality::Good); "one reconnect")]
    #[test_case(0, Some(3) => (75, ConnectionQuality::Good); "slow gap")]
    #[test_case(1, Some(3) => (50, ConnectionQuality::Good); "reconnect and slow gap")]
    #[test_case(0, Some(12) => (40, ConnectionQuality::Poor); "stall")]
    #[test_case(3, None => (25, ConnectionQuality::Poor); "frequent reconnects")]
    #[test_case(5, Some(30) => (0, ConnectionQuality::Poor); "floor at zero")]
    fn connected_scoring(reconnects: usize, gap: Option<u64>) -> (u8, ConnectionQuality) {
        let rules = ScoringRules::default();
        let inputs = connected(reconnects, gap);
        (rules.score(&inputs), rules.quality(&inputs))
    }

    #[test]
    fn degraded_is_capped_and_poor() {
        let rules = ScoringRules::default();
        let inputs = QualityInputs {
            status: ConnectionStatus::Degraded,
            recent_reconnects: 0,
            max_recent_gap: None,
        };

        assert_eq!(rules.score(&inputs), 40);
        assert_eq!(rules.quality(&inputs), ConnectionQuality::Poor);
    }

    #[test_case(ConnectionStatus::Disconnected)]
    #[test_case(ConnectionStatus::Connecting)]
    fn not_connected_scores_zero(status: ConnectionStatus) {
        let rules = ScoringRules::default();
        let inputs = QualityInputs {
            status,
            recent_reconnects: 0,
            max_recent_gap: None,
        };

        assert_eq!(rules.score(&inputs), 0);
        assert_eq!(rules.quality(&inputs), ConnectionQuality::Disconnected);
    }

    #[test]
    fn snapshot_accessors() {
        let now = Utc::now();
        let snapshot = HealthSnapshot::Connected {
            quality: ConnectionQuality::Good,
            score: 75,
            last_update: Some(now),
        };
        assert!(snapshot.connected());
        assert_eq!(snapshot.quality(), ConnectionQuality::Good);
        assert_eq!(snapshot.last_update(), Some(now));
        assert_eq!(snapshot.status(), ConnectionStatus::Connected);

        let snapshot = HealthSnapshot::Connecting { attempt: 2 };
        assert!(!snapshot.connected());
        assert_eq!(snapshot.quality(), ConnectionQuality::Disconnected);
        assert_eq!(snapshot.last_update(), None);
        assert_eq!(snapshot.score(), 0);
    }

    #[test]
    fn snapshot_serializes_with_status_tag() {
        let snapshot = HealthSnapshot::Disconnected {
            reason: DisconnectReason::ReconnectExhausted { attempts: 10 },
        };
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["reason"]["reconnect_exhausted"]["attempts"], 10);

        let snapshot = HealthSnapshot::Degraded {
            quality: ConnectionQuality::Poor,
            score: 40,
            last_update: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["quality"], "poor");
    }

    #[test]
    fn connected_statuses() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(ConnectionStatus::Degraded.is_connected());
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(!ConnectionStatus::Disconnected.is_connected());
    }
}
