use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

use crate::deploy::{self, CreateAccepted, CreateRequest, EditRequest};
use crate::server::error::{ApiError, ApiResult};
use crate::shared::models::AppState;
use crate::state::{InstanceRecord, StateDocument};

pub async fn create_instance(
    State(app): State<Arc<AppState>>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<CreateAccepted>)> {
    let accepted = deploy::create_instance(app, req).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn delete_instance(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    deploy::delete_instance(app, &id).await?;
    Ok(Json(json!({ "message": "Instance deleted" })))
}

pub async fn redeploy_instance(
    State(app): State<Arc<AppState>>,
    Path((id, container_id)): Path<(String, String)>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<CreateAccepted>)> {
    let accepted = deploy::redeploy_instance(app, id, container_id, req, false).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn reinstall_instance(
    State(app): State<Arc<AppState>>,
    Path((id, container_id)): Path<(String, String)>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<CreateAccepted>)> {
    let accepted = deploy::redeploy_instance(app, id, container_id, req, true).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn edit_instance(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> ApiResult<Json<InstanceRecord>> {
    let record = deploy::edit_instance(app, &id, req).await?;
    Ok(Json(record))
}

pub async fn list_instances(
    State(app): State<Arc<AppState>>,
) -> ApiResult<Json<StateDocument>> {
    let document = app.states.read().await.map_err(ApiError::Internal)?;
    Ok(Json(document))
}
