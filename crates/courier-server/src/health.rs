//! Health endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use courier_db::Database;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub database: Option<HealthStatus>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct HealthState {
    pub started_at: Instant,
    pub db: Option<Database>,
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub async fn health(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let database = match &state.db {
        Some(db) => Some(match db.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(err) => {
                tracing::warn!(error = %err, "Database health check failed");
                HealthStatus::Unhealthy
            }
        }),
        None => None,
    };

    let status = if database == Some(HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Healthy
    };

    let report = HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        database,
        timestamp: chrono::Utc::now(),
    };
    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}
