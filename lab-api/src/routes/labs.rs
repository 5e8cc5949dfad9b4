use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lab_orchestrator::{CreateLabRequest, DeploymentLogRecord, Lab};
use tracing::info;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/labs", get(list_labs).post(create_lab))
        .route("/api/v1/labs/{id}", get(get_lab).delete(delete_lab))
        .route("/api/v1/labs/{id}/deploy", post(deploy_lab))
        .route("/api/v1/labs/{id}/destroy", post(destroy_lab))
        .route("/api/v1/labs/{id}/logs", get(get_lab_logs))
}

#[utoipa::path(
    post,
    path = "/api/v1/labs",
    request_body = CreateLabRequest,
    responses(
        (status = 201, description = "Lab created", body = Lab),
        (status = 400, description = "Invalid lab definition")
    ),
    tag = "labs"
)]
pub async fn create_lab(
    State(state): State<AppState>,
    Json(req): Json<CreateLabRequest>,
) -> ApiResult<(StatusCode, Json<Lab>)> {
    let lab = state.store.create_lab(req).await?;
    Ok((StatusCode::CREATED, Json(lab)))
}

#[utoipa::path(
    get,
    path = "/api/v1/labs",
    responses((status = 200, description = "All labs, newest first", body = [Lab])),
    tag = "labs"
)]
pub async fn list_labs(State(state): State<AppState>) -> ApiResult<Json<Vec<Lab>>> {
    Ok(Json(state.store.list_labs().await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/labs/{id}",
    params(("id" = String, Path, description = "Lab id")),
    responses(
        (status = 200, description = "Lab with its VMs", body = Lab),
        (status = 404, description = "Lab not found")
    ),
    tag = "labs"
)]
pub async fn get_lab(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Lab>> {
    Ok(Json(state.store.get_lab(&id).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/labs/{id}",
    params(("id" = String, Path, description = "Lab id")),
    responses(
        (status = 200, description = "Lab record deleted"),
        (status = 404, description = "Lab not found"),
        (status = 409, description = "Lab is busy or still deployed")
    ),
    tag = "labs"
)]
pub async fn delete_lab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let lab = state.orchestrator.delete(&id).await?;

    for vm in &lab.vms {
        state.tunnel.registry().close_sessions_for(&vm.id);
    }
    let released = state.ports.release_owner(&id);
    info!(lab_id = %id, released = released.len(), "Released lab ports");

    Ok(Json(serde_json::json!({ "message": "Lab deleted" })))
}

#[utoipa::path(
    post,
    path = "/api/v1/labs/{id}/deploy",
    params(("id" = String, Path, description = "Lab id")),
    responses(
        (status = 202, description = "Deployment started; follow the lab status and logs", body = Lab),
        (status = 404, description = "Lab not found"),
        (status = 409, description = "Lab is already deploying or deleted")
    ),
    tag = "labs"
)]
pub async fn deploy_lab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Lab>)> {
    let lab = state.orchestrator.deploy(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(lab)))
}

#[utoipa::path(
    post,
    path = "/api/v1/labs/{id}/destroy",
    params(("id" = String, Path, description = "Lab id")),
    responses(
        (status = 200, description = "Infrastructure torn down", body = Lab),
        (status = 404, description = "Lab not found"),
        (status = 409, description = "Lab is deploying or already deleted"),
        (status = 500, description = "Teardown failed; see the lab logs")
    ),
    tag = "labs"
)]
pub async fn destroy_lab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Lab>> {
    let lab = state.orchestrator.destroy(&id).await?;
    for vm in &lab.vms {
        state.tunnel.registry().close_sessions_for(&vm.id);
    }
    Ok(Json(lab))
}

#[utoipa::path(
    get,
    path = "/api/v1/labs/{id}/logs",
    params(("id" = String, Path, description = "Lab id")),
    responses(
        (status = 200, description = "Deployment log records in append order", body = [DeploymentLogRecord]),
        (status = 404, description = "Lab not found")
    ),
    tag = "labs"
)]
pub async fn get_lab_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DeploymentLogRecord>>> {
    Ok(Json(state.store.list_logs(&id).await?))
}
