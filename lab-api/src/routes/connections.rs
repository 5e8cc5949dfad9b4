use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use lab_tunnel::SessionInfo;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/connections/{vm_id}", get(list_connections))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    pub session_id: Uuid,
    #[schema(example = "ssh")]
    pub protocol: String,
    pub opened_at: DateTime<Utc>,
}

impl From<SessionInfo> for ConnectionInfo {
    fn from(info: SessionInfo) -> Self {
        Self {
            session_id: info.session_id,
            protocol: info.protocol.to_string(),
            opened_at: info.opened_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    pub vm_id: String,
    pub count: usize,
    pub sessions: Vec<ConnectionInfo>,
}

#[utoipa::path(
    get,
    path = "/api/v1/connections/{vm_id}",
    params(("vm_id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "Open remote-access sessions for the VM", body = ConnectionsResponse),
        (status = 404, description = "VM not found")
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<ConnectionsResponse>> {
    let vm = state.store.get_vm(&vm_id).await?;
    let sessions: Vec<ConnectionInfo> = state
        .tunnel
        .registry()
        .active_sessions_for(&vm.id)
        .into_iter()
        .map(ConnectionInfo::from)
        .collect();

    Ok(Json(ConnectionsResponse {
        vm_id: vm.id,
        count: sessions.len(),
        sessions,
    }))
}
