use axum::{
    routing::{get, put},
    Router,
};

use crate::api::{feed, health, status};
use crate::controller::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status::get_status))
        .route("/feed/:channel", put(feed::put_value))
        .route("/healthz", get(health::health_check))
        .with_state(state)
}
