//! Terraform-over-libvirt provisioner.
//!
//! Each lab gets an isolated workspace `<work_root>/terraform_lab_<id>` holding the rendered
//! descriptor and Terraform's own state, so concurrent labs never share tool state.

// Standard library
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// External crates
use async_trait::async_trait;
use lab_core::CommandSpec;
use lab_ports::PortPool;
use serde_json::json;
use tracing::{info, instrument, warn};

// Internal imports
use crate::exec::run_logged;
use crate::{
    domain_name, DeploymentLogSink, LabSpec, LogCategory, ProvisionedVm, Provisioner, Result,
};

pub mod descriptor;
pub mod outputs;

pub use descriptor::{render_descriptor, resolve_image, DEFAULT_OS_IMAGE, OS_IMAGES};

const PLAN_FILE: &str = "lab.tfplan";

#[derive(Debug, Clone)]
pub struct TerraformConfig {
    pub binary: String,
    pub work_root: PathBuf,
    pub libvirt_uri: String,
    pub storage_pool: String,
    pub network_cidr: String,
    /// Upper bound for any single Terraform invocation.
    pub command_timeout: Option<Duration>,
    /// Extra or replacement entries for the OS image table.
    pub image_overrides: BTreeMap<String, String>,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            work_root: std::env::temp_dir().join("virtual-labs"),
            libvirt_uri: "qemu:///system".to_string(),
            storage_pool: "default".to_string(),
            network_cidr: "192.168.100.0/24".to_string(),
            command_timeout: Some(Duration::from_secs(30 * 60)),
            image_overrides: BTreeMap::new(),
        }
    }
}

pub struct TerraformProvisioner {
    config: TerraformConfig,
    ports: Arc<PortPool>,
}

impl TerraformProvisioner {
    pub fn new(config: TerraformConfig, ports: Arc<PortPool>) -> Self {
        Self { config, ports }
    }

    pub fn workspace_for(&self, lab_id: &str) -> PathBuf {
        self.config
            .work_root
            .join(format!("terraform_lab_{}", lab_id))
    }

    fn command(&self, workspace: &Path) -> CommandSpec {
        CommandSpec::new(self.config.binary.as_str())
            .dir(workspace)
            .env("TF_IN_AUTOMATION", "1")
            .timeout(self.config.command_timeout)
    }

    /// Lease a terminal port for every VM, keeping ports VMs already hold.
    ///
    /// Returns the assignment by VM id and the ports newly leased by this call.
    fn assign_ports(&self, lab: &LabSpec) -> Result<(BTreeMap<String, u16>, Vec<u16>)> {
        let mut assigned = BTreeMap::new();
        let mut fresh = Vec::new();

        for vm in &lab.vms {
            let kept = vm
                .ssh_port
                .filter(|port| self.ports.reserve(*port, &lab.id).is_ok());

            let port = match kept {
                Some(port) => port,
                None => match self.ports.allocate(&lab.id) {
                    Ok(port) => {
                        fresh.push(port);
                        port
                    }
                    Err(e) => {
                        for port in &fresh {
                            self.ports.release(*port);
                        }
                        return Err(e.into());
                    }
                },
            };
            assigned.insert(vm.id.clone(), port);
        }

        Ok((assigned, fresh))
    }

    async fn apply(
        &self,
        lab: &LabSpec,
        workspace: &Path,
        ssh_ports: &BTreeMap<String, u16>,
        log: &dyn DeploymentLogSink,
    ) -> Result<Vec<ProvisionedVm>> {
        let rendered = render_descriptor(&self.config, lab, ssh_ports)?;
        tokio::fs::write(workspace.join(descriptor::DESCRIPTOR_FILE), rendered).await?;

        let steps: [&[&str]; 3] = [
            &["init", "-input=false", "-no-color"],
            &["plan", "-input=false", "-no-color", "-out", PLAN_FILE],
            &["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE],
        ];
        for args in steps {
            run_logged(
                self.command(workspace).args(args.iter().copied()),
                &lab.id,
                LogCategory::Provisioning,
                log,
            )
            .await?;
        }

        let raw = run_logged(
            self.command(workspace).args(["output", "-json"]),
            &lab.id,
            LogCategory::Provisioning,
            log,
        )
        .await?;
        let outputs = outputs::parse_outputs(&raw)?;

        lab.vms
            .iter()
            .map(|vm| {
                let domain = domain_name(&lab.id, &vm.name);
                let state = json!({
                    "domain": &domain,
                    "address": outputs::address(&outputs, &domain),
                    "workspace": workspace.display().to_string(),
                });
                Ok(ProvisionedVm {
                    vm_id: vm.id.clone(),
                    ssh_port: ssh_ports.get(&vm.id).copied().unwrap_or_default(),
                    vnc_port: outputs::vnc_port(&outputs, &domain)?,
                    provision_state: Some(state.to_string()),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    fn name(&self) -> &'static str {
        "terraform"
    }

    #[instrument(skip(self, lab, log), fields(lab_id = %lab.id))]
    async fn provision(
        &self,
        lab: &LabSpec,
        log: &dyn DeploymentLogSink,
    ) -> Result<Vec<ProvisionedVm>> {
        if lab.vms.is_empty() {
            return Ok(Vec::new());
        }

        let workspace = self.workspace_for(&lab.id);
        tokio::fs::create_dir_all(&workspace).await?;

        let (ssh_ports, fresh) = self.assign_ports(lab)?;
        match self.apply(lab, &workspace, &ssh_ports, log).await {
            Ok(vms) => {
                info!(vm_count = vms.len(), "Lab infrastructure provisioned");
                Ok(vms)
            }
            Err(e) => {
                for port in fresh {
                    self.ports.release(port);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, lab, log), fields(lab_id = %lab.id))]
    async fn teardown(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()> {
        let workspace = self.workspace_for(&lab.id);

        if tokio::fs::try_exists(&workspace).await? {
            run_logged(
                self.command(&workspace).args([
                    "destroy",
                    "-input=false",
                    "-no-color",
                    "-auto-approve",
                ]),
                &lab.id,
                LogCategory::Provisioning,
                log,
            )
            .await?;

            if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
                warn!(workspace = %workspace.display(), error = %e, "Failed to remove lab workspace");
            }
        } else {
            log.append(
                &lab.id,
                LogCategory::Provisioning,
                "No provisioning workspace found; nothing to destroy",
            )
            .await?;
        }

        let released = self.ports.release_owner(&lab.id);
        info!(released = released.len(), "Lab infrastructure destroyed");
        Ok(())
    }
}
