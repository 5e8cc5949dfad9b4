use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use lab_orchestrator::{Vm, VmStatus};
use lab_provider::{domain_name, DomainState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms", get(list_vms))
        .route("/api/v1/vms/{id}", get(get_vm))
        .route("/api/v1/vms/{id}/start", post(start_vm))
        .route("/api/v1/vms/{id}/stop", post(stop_vm))
        .route("/api/v1/vms/{id}/restart", post(restart_vm))
        .route("/api/v1/vms/{id}/status", get(vm_status))
        .route("/api/v1/vms/{id}/ssh_access", get(ssh_access))
        .route("/api/v1/vms/{id}/vnc_access", get(vnc_access))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct VmFilters {
    /// Only VMs of this lab.
    pub lab_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VmStatusResponse {
    pub vm_id: String,
    /// Status as last recorded.
    pub status: VmStatus,
    /// Power state reported by the hypervisor.
    #[schema(value_type = String, example = "running")]
    pub domain_state: DomainState,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SshAccess {
    pub vm_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VncAccess {
    pub vm_id: String,
    pub host: String,
    pub port: u16,
}

/// Load a VM that still has infrastructure behind it.
async fn live_vm(state: &AppState, id: &str) -> ApiResult<Vm> {
    let vm = state.store.get_vm(id).await?;
    if vm.status == VmStatus::Deleted {
        return Err(ApiError::Conflict(format!("VM {} has been destroyed", id)));
    }
    Ok(vm)
}

#[utoipa::path(
    get,
    path = "/api/v1/vms",
    params(VmFilters),
    responses((status = 200, description = "VMs ordered by lab and position", body = [Vm])),
    tag = "vms"
)]
pub async fn list_vms(
    State(state): State<AppState>,
    Query(filters): Query<VmFilters>,
) -> ApiResult<Json<Vec<Vm>>> {
    Ok(Json(state.store.list_vms(filters.lab_id.as_deref()).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "VM", body = Vm),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
pub async fn get_vm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vm>> {
    Ok(Json(state.store.get_vm(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/start",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "VM started", body = Vm),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM has been destroyed")
    ),
    tag = "vms"
)]
pub async fn start_vm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vm>> {
    let vm = live_vm(&state, &id).await?;
    state.vm_control.start(&domain_name(&vm.lab_id, &vm.name)).await?;
    state.store.mark_vm_running(&id).await?;
    info!(vm_id = %id, "VM started");
    Ok(Json(state.store.get_vm(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/stop",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "VM stopped and its sessions closed", body = Vm),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM has been destroyed")
    ),
    tag = "vms"
)]
pub async fn stop_vm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Vm>> {
    let vm = live_vm(&state, &id).await?;
    state.vm_control.stop(&domain_name(&vm.lab_id, &vm.name)).await?;
    let closed = state.tunnel.registry().close_sessions_for(&id);
    state.store.mark_vm_stopped(&id).await?;
    info!(vm_id = %id, closed_sessions = closed, "VM stopped");
    Ok(Json(state.store.get_vm(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/restart",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "VM restarted", body = Vm),
        (status = 404, description = "VM not found"),
        (status = 409, description = "VM has been destroyed")
    ),
    tag = "vms"
)]
pub async fn restart_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vm>> {
    let vm = live_vm(&state, &id).await?;
    state.vm_control.restart(&domain_name(&vm.lab_id, &vm.name)).await?;
    state.store.mark_vm_running(&id).await?;
    Ok(Json(state.store.get_vm(&id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/status",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "Recorded and hypervisor state", body = VmStatusResponse),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
pub async fn vm_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VmStatusResponse>> {
    let vm = state.store.get_vm(&id).await?;
    if vm.status == VmStatus::Deleted {
        return Ok(Json(VmStatusResponse {
            vm_id: vm.id,
            status: vm.status,
            domain_state: DomainState::Unknown,
            info: BTreeMap::new(),
        }));
    }

    let domain = domain_name(&vm.lab_id, &vm.name);
    let domain_state = state.vm_control.state(&domain).await?;
    let info = state.vm_control.info(&domain).await?;
    Ok(Json(VmStatusResponse {
        vm_id: vm.id,
        status: vm.status,
        domain_state,
        info,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/ssh_access",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "Terminal connection details", body = SshAccess),
        (status = 400, description = "No terminal port assigned yet"),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
pub async fn ssh_access(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SshAccess>> {
    let vm = state.store.get_vm(&id).await?;
    let port = vm
        .ssh_port
        .ok_or_else(|| ApiError::BadRequest(format!("VM {} has no SSH port assigned", vm.name)))?;

    Ok(Json(SshAccess {
        vm_id: vm.id,
        host: state.access.host.clone(),
        port,
        username: state.access.ssh_user.clone(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/vnc_access",
    params(("id" = String, Path, description = "VM id")),
    responses(
        (status = 200, description = "Graphical console connection details", body = VncAccess),
        (status = 400, description = "No VNC port assigned yet"),
        (status = 404, description = "VM not found")
    ),
    tag = "vms"
)]
pub async fn vnc_access(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VncAccess>> {
    let vm = state.store.get_vm(&id).await?;
    let port = vm
        .vnc_port
        .ok_or_else(|| ApiError::BadRequest(format!("VM {} has no VNC port assigned", vm.name)))?;

    Ok(Json(VncAccess {
        vm_id: vm.id,
        host: state.access.host.clone(),
        port,
    }))
}
