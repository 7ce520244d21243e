//! Health Endpoint
//!
//! Small axum app reporting the state of the upstream feed to probes and
//! scrapers.
//!
//! | Route      | Body                                          | Non-200 when        |
//! |------------|-----------------------------------------------|---------------------|
//! | `/health`  | JSON: connection snapshot, counters, keys     | feed disconnected   |
//! | `/healthz` | `OK`                                          | never               |
//! | `/readyz`  | `READY` / `NOT READY`                         | no open session     |
//! | `/metrics` | Prometheus text exposition                    | recorder not set up |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ManagerMetrics, MarketFeedManager};
use crate::domain::health::{ConnectionQuality, HealthSnapshot};
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Coarse service status derived from the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Session open with excellent or good quality.
    Healthy,
    /// Session open but poor or silent, or a connect is in progress.
    Degraded,
    /// No session and none being attempted.
    Unhealthy,
}

impl HealthStatus {
    /// Classify a connection snapshot.
    #[must_use]
    pub const fn from_snapshot(snapshot: &HealthSnapshot) -> Self {
        match snapshot {
            HealthSnapshot::Connected {
                quality: ConnectionQuality::Excellent | ConnectionQuality::Good,
                ..
            } => Self::Healthy,
            HealthSnapshot::Connected { .. }
            | HealthSnapshot::Degraded { .. }
            | HealthSnapshot::Connecting { .. } => Self::Degraded,
            HealthSnapshot::Disconnected { .. } => Self::Unhealthy,
        }
    }

    const fn http_status(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Coarse status.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// Seconds since the endpoint state was created.
    pub uptime_secs: u64,
    /// Time the report was built.
    pub generated_at: DateTime<Utc>,
    /// Upstream connection snapshot.
    pub connection: HealthSnapshot,
    /// Feed counters.
    pub metrics: ManagerMetrics,
    /// Active subscription keys, rendered as `channel:symbol`.
    pub subscriptions: Vec<String>,
}

/// State shared by the handlers.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    manager: MarketFeedManager,
}

impl HealthServerState {
    /// State reporting on `manager`.
    #[must_use]
    pub fn new(version: impl Into<String>, manager: MarketFeedManager) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            manager,
        }
    }

    fn report(&self) -> HealthReport {
        let connection = self.manager.health();
        HealthReport {
            status: HealthStatus::from_snapshot(&connection),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            generated_at: Utc::now(),
            connection,
            metrics: self.manager.metrics(),
            subscriptions: self
                .manager
                .active_keys()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Serves [`router`] until its cancellation token fires.
pub struct HealthServer {
    addr: SocketAddr,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Server bound to `addr` once run.
    #[must_use]
    pub const fn new(
        addr: SocketAddr,
        state: Arc<HealthServerState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HealthServerError::Bind`] if the address is unavailable and
    /// [`HealthServerError::Serve`] if the server stops with an I/O error.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| HealthServerError::Bind {
                addr: self.addr,
                source,
            })?;
        tracing::info!(addr = %self.addr, "Health endpoint listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!("Health endpoint stopped");
        Ok(())
    }
}

/// Routes of the health endpoint.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(ready))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthServerState>>) -> Response {
    let report = state.report();
    (report.status.http_status(), Json(report)).into_response()
}

async fn ready(State(state): State<Arc<HealthServerState>>) -> Response {
    if state.manager.connection_status() {
        "READY".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY").into_response()
    }
}

async fn prometheus() -> Response {
    let Some(handle) = get_metrics_handle() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response();
    };
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], handle.render()).into_response()
}

/// Health endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listen address could not be bound.
    #[error("failed to bind health endpoint to {addr}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("health endpoint failed")]
    Serve(#[source] std::io::Error),
}
