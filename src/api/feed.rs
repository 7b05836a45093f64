use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use tracing::debug;

use crate::api::error::ApiError;
use crate::controller::AppState;
use crate::hardware::FeedChannel;

/// PUT /api/v1/feed/:channel
///
/// Body is the bare number, the way a message bus bridge forwards a topic
/// payload.
pub async fn put_value(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let publisher = state
        .feed
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("grid source is not the push feed".to_string()))?;
    let channel: FeedChannel = channel
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown feed channel {channel:?}")))?;
    let value: f64 = body
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{:?} is not a number", body.trim())))?;
    if !value.is_finite() {
        return Err(ApiError::BadRequest(format!("{value} is not finite")));
    }

    debug!(%channel, value, "feed value received");
    publisher.publish(channel, value);
    Ok(StatusCode::NO_CONTENT)
}
