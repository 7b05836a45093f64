use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    control_loop: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_cycle_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// GET /api/v1/healthz
///
/// 200 while the control loop task accepts commands. Telemetry or dispatch
/// trouble does not make the service unhealthy, the status document reports it.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let last_cycle_at = state.status.borrow().stats.last_cycle_at;
    let control_loop = if state.admin.is_closed() {
        ComponentHealth {
            status: "unhealthy",
            last_cycle_at,
            error: Some("control loop stopped".to_string()),
        }
    } else {
        ComponentHealth {
            status: "healthy",
            last_cycle_at,
            error: None,
        }
    };

    let healthy = control_loop.error.is_none();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        timestamp: chrono::Utc::now(),
        checks: HealthChecks { control_loop },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}
