use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::server::error::{ApiError, ApiResult};
use crate::shared::models::AppState;
use crate::state::InstanceRecord;

pub async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(volume_id): Path<String>,
) -> ApiResult<Json<InstanceRecord>> {
    let record = app
        .states
        .get(&volume_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("No state for instance {volume_id}")))?;
    Ok(Json(record))
}
