//! Ansible configurator.
//!
//! Writes an inventory, the selected playbook and an `ansible.cfg` into a per-lab workspace,
//! waits for every VM's terminal port to accept connections, then runs `ansible-playbook`
//! once against the whole inventory.

// Standard library
use std::path::PathBuf;
use std::time::Duration;

// External crates
use async_trait::async_trait;
use lab_core::CommandSpec;
use tracing::{info, instrument};

// Internal imports
use crate::exec::run_logged;
use crate::readiness::{wait_until_reachable, ProbeTarget, ReadinessConfig};
use crate::{Configurator, DeploymentLogSink, LabSpec, LogCategory, Result};

pub mod inventory;
pub mod playbook;

pub use inventory::render_inventory;
pub use playbook::validate_playbook;

#[derive(Debug, Clone)]
pub struct AnsibleConfig {
    pub binary: String,
    pub work_root: PathBuf,
    /// Host the VMs' terminal ports are reachable on.
    pub terminal_host: String,
    pub remote_user: String,
    pub readiness: ReadinessConfig,
    pub command_timeout: Option<Duration>,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            binary: "ansible-playbook".to_string(),
            work_root: std::env::temp_dir().join("virtual-labs"),
            terminal_host: "localhost".to_string(),
            remote_user: "ubuntu".to_string(),
            readiness: ReadinessConfig::default(),
            command_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

pub struct AnsibleConfigurator {
    config: AnsibleConfig,
}

impl AnsibleConfigurator {
    pub fn new(config: AnsibleConfig) -> Self {
        Self { config }
    }

    pub fn workspace_for(&self, lab_id: &str) -> PathBuf {
        self.config.work_root.join(format!("ansible_lab_{}", lab_id))
    }

    fn probe_targets(&self, lab: &LabSpec) -> Vec<ProbeTarget> {
        lab.vms
            .iter()
            .map(|vm| ProbeTarget {
                name: vm.name.clone(),
                host: self.config.terminal_host.clone(),
                port: vm.ssh_port,
            })
            .collect()
    }
}

#[async_trait]
impl Configurator for AnsibleConfigurator {
    fn name(&self) -> &'static str {
        "ansible"
    }

    #[instrument(skip(self, lab, log), fields(lab_id = %lab.id))]
    async fn configure(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()> {
        let Some(payload) = lab.configuration_payload() else {
            log.append(
                &lab.id,
                LogCategory::Configuration,
                "INFO: No configuration payload provided; configuration skipped",
            )
            .await?;
            return Ok(());
        };

        let workspace = self.workspace_for(&lab.id);
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::write(
            workspace.join(inventory::INVENTORY_FILE),
            render_inventory(lab, &self.config.terminal_host, &self.config.remote_user),
        )
        .await?;
        tokio::fs::write(workspace.join(inventory::PLAYBOOK_FILE), payload).await?;
        tokio::fs::write(workspace.join(inventory::CONFIG_FILE), inventory::ANSIBLE_CFG).await?;

        log.append(
            &lab.id,
            LogCategory::Configuration,
            &format!(
                "INFO: Waiting up to {}s for {} VM(s) to accept connections",
                self.config.readiness.timeout.as_secs(),
                lab.vms.len()
            ),
        )
        .await?;

        if let Err(e) = wait_until_reachable(&self.probe_targets(lab), &self.config.readiness).await
        {
            log.append(&lab.id, LogCategory::Configuration, &format!("ERROR: {}", e))
                .await?;
            return Err(e);
        }

        log.append(
            &lab.id,
            LogCategory::Configuration,
            "INFO: All VMs are reachable; applying configuration",
        )
        .await?;

        let command = CommandSpec::new(self.config.binary.as_str())
            .args([
                "-i",
                inventory::INVENTORY_FILE,
                inventory::PLAYBOOK_FILE,
                "-v",
            ])
            .dir(&workspace)
            .env(
                "ANSIBLE_CONFIG",
                workspace.join(inventory::CONFIG_FILE).display().to_string(),
            )
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .timeout(self.config.command_timeout);

        run_logged(command, &lab.id, LogCategory::Configuration, log).await?;
        info!("Lab configuration applied");
        Ok(())
    }
}
