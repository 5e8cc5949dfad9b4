use std::sync::Arc;

use anyhow::Context;
use lab_orchestrator::{DeploymentOrchestrator, LabStore};
use lab_ports::PortPool;
use lab_provider::{AnsibleConfigurator, TerraformProvisioner, VirshControl, VmControl};
use lab_tunnel::{SessionRegistry, TunnelService};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;

/// Where clients reach a VM's terminal and graphical ports.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub host: String,
    pub ssh_user: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: LabStore,
    pub orchestrator: DeploymentOrchestrator,
    pub tunnel: TunnelService,
    pub vm_control: Arc<dyn VmControl>,
    pub ports: Arc<PortPool>,
    pub access: AccessConfig,
}

impl AppState {
    pub fn new(
        orchestrator: DeploymentOrchestrator,
        tunnel: TunnelService,
        vm_control: Arc<dyn VmControl>,
        ports: Arc<PortPool>,
        access: AccessConfig,
    ) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            tunnel,
            vm_control,
            ports,
            access,
        }
    }

    /// Wire the production adapters: Terraform, Ansible, virsh and a TCP tunnel.
    ///
    /// Ports already persisted for VMs are re-leased to their labs so that a restart never
    /// hands out a port twice.
    pub async fn from_config(pool: SqlitePool, config: &Config) -> anyhow::Result<Self> {
        let store = LabStore::new(pool);

        let range = config
            .port_range()
            .context("Invalid VLAB_SSH_PORT_RANGE")?;
        let ports = Arc::new(PortPool::new(range));
        for (lab_id, port) in store.used_ports().await? {
            if let Err(e) = ports.reserve(port, &lab_id) {
                warn!(lab_id = %lab_id, port, error = %e, "Persisted port could not be re-leased");
            }
        }
        info!(range = %range, leased = ports.leased(), "Port pool ready");

        for tool in [config.terraform_bin.as_str(), config.ansible_bin.as_str(), "virsh"] {
            if !lab_core::is_tool_installed(tool) {
                warn!(tool, "External tool not found on PATH");
            }
        }

        let orchestrator = DeploymentOrchestrator::new(
            store,
            Arc::new(TerraformProvisioner::new(config.terraform(), ports.clone())),
            Arc::new(AnsibleConfigurator::new(config.ansible())),
            config.pipeline(),
        );
        let tunnel = TunnelService::new(SessionRegistry::new(), config.tunnel());

        Ok(Self::new(
            orchestrator,
            tunnel,
            Arc::new(VirshControl::new(config.libvirt_uri.clone())),
            ports,
            AccessConfig {
                host: config.terminal_host.clone(),
                ssh_user: config.ansible_user.clone(),
            },
        ))
    }
}
