//! Health check HTTP server for container orchestration
//!
//! Endpoints:
//! - `GET /health`: overall status with per-check detail, 503 when degraded
//! - `GET /live`: liveness probe, always 200 while the process serves
//! - `GET /ready`: 200 once at least one broker connection is live
//! - `GET /status`: every connection with state, last error and subscriptions
//! - `GET /metrics`: metrics snapshot

use crate::observability::metrics::MetricsSnapshot;
use crate::supervisor::ConnectionState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::Filter;

/// Share of a bounded channel above which the channel check degrades
const CHANNEL_PRESSURE_RATIO: f64 = 0.9;

/// One connection as reported by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub identity: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub subscriptions: Vec<String>,
    pub messages_received: u64,
}

/// Queue depth of the message channel
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelReport {
    pub queued: usize,
    pub capacity: Option<usize>,
    pub dropped: u64,
}

/// What the health server reports on
pub trait StatusSource: Send + Sync {
    fn connections(&self) -> Vec<ConnectionReport>;

    fn channel(&self) -> ChannelReport;

    fn metrics(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(healthy: bool, degraded_status: &str, message: String) -> Self {
        Self {
            status: if healthy { "healthy" } else { degraded_status }.to_string(),
            message: Some(message),
            last_check: current_timestamp(),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub connected: usize,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connections: Vec<ConnectionReport>,
    pub channel: ChannelReport,
    pub timestamp: u64,
}

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    source: Arc<dyn StatusSource>,
}

impl HealthServer {
    pub fn new(port: u16, source: Arc<dyn StatusSource>) -> Self {
        Self { port, source }
    }

    pub fn health_status(&self) -> HealthStatus {
        let mut checks = BTreeMap::new();
        checks.insert("mqtt".to_string(), self.check_connections());
        checks.insert("channel".to_string(), self.check_channel());

        let healthy = checks.values().all(HealthCheck::is_healthy);
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            uptime_seconds: self.source.metrics().uptime_seconds,
            checks,
        }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let connected = self
            .source
            .connections()
            .iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .count();
        ReadinessResponse {
            ready: connected > 0,
            connected,
            timestamp: current_timestamp(),
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            connections: self.source.connections(),
            channel: self.source.channel(),
            timestamp: current_timestamp(),
        }
    }

    fn check_connections(&self) -> HealthCheck {
        let connections = self.source.connections();
        let failing: Vec<&str> = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Error)
            .map(|c| c.identity.as_str())
            .collect();

        if failing.is_empty() {
            let connected = connections
                .iter()
                .filter(|c| c.state == ConnectionState::Connected)
                .count();
            HealthCheck::new(
                true,
                "unhealthy",
                format!("{connected} of {} connections live", connections.len()),
            )
        } else {
            HealthCheck::new(
                false,
                "unhealthy",
                format!("Connections in error: {}", failing.join(", ")),
            )
        }
    }

    fn check_channel(&self) -> HealthCheck {
        let channel = self.source.channel();
        match channel.capacity {
            Some(capacity) if channel.queued as f64 >= capacity as f64 * CHANNEL_PRESSURE_RATIO => {
                HealthCheck::new(
                    false,
                    "backpressure",
                    format!("{} of {capacity} slots used", channel.queued),
                )
            }
            _ => HealthCheck::new(true, "backpressure", format!("{} queued", channel.queued)),
        }
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();
        let status_server = self.clone();
        let metrics_server = self;

        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let readiness = server.readiness();
                    let code = if readiness.ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&readiness),
                        code,
                    ))
                }
            });

        let status_route = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&status_server.status()));

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&metrics_server.source.metrics()));

        health_route
            .or(live_route)
            .or(ready_route)
            .or(status_route)
            .or(metrics_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until `shutdown` fires
    pub async fn start(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<(), warp::Error> {
        let port = self.port;
        let (addr, server): (SocketAddr, _) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
                shutdown.cancelled().await
            })?;

        tracing::info!(%addr, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
