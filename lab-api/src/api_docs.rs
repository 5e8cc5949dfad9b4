use crate::routes::connections::{ConnectionInfo, ConnectionsResponse};
use crate::routes::vms::{SshAccess, VmStatusResponse, VncAccess};
use lab_orchestrator::{
    CreateLabRequest, CreateVmRequest, DeploymentLogRecord, Lab, LabStatus, Vm, VmStatus,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::labs::create_lab,
        crate::routes::labs::list_labs,
        crate::routes::labs::get_lab,
        crate::routes::labs::delete_lab,
        crate::routes::labs::deploy_lab,
        crate::routes::labs::destroy_lab,
        crate::routes::labs::get_lab_logs,
        crate::routes::vms::list_vms,
        crate::routes::vms::get_vm,
        crate::routes::vms::start_vm,
        crate::routes::vms::stop_vm,
        crate::routes::vms::restart_vm,
        crate::routes::vms::vm_status,
        crate::routes::vms::ssh_access,
        crate::routes::vms::vnc_access,
        crate::routes::connections::list_connections,
    ),
    components(
        schemas(
            Lab,
            LabStatus,
            CreateLabRequest,
            CreateVmRequest,
            Vm,
            VmStatus,
            DeploymentLogRecord,
            VmStatusResponse,
            SshAccess,
            VncAccess,
            ConnectionInfo,
            ConnectionsResponse
        )
    ),
    tags(
        (name = "lab-api", description = "Virtual lab deployment and remote access API")
    )
)]
pub struct ApiDoc;
