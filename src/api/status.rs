use axum::{
    extract::{Query, State},
    Json,
};

use crate::api::error::ApiError;
use crate::controller::{AdminCommand, AppState, StatusSnapshot};

/// GET /api/v1/status
///
/// Without parameters, returns the last published snapshot. Query pairs are
/// administrative commands (`debug`, `setpoint`, `reset`, `<load>`, `all`),
/// applied in order by the control loop before the snapshot is taken.
pub async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    let commands = AdminCommand::parse_query(&params);
    if commands.is_empty() {
        return Ok(Json(state.snapshot()));
    }
    let snapshot = state.submit(commands).await?;
    Ok(Json(snapshot))
}
