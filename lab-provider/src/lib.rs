//! Adapter layer between the deployment pipeline and the external tools that do the work.
//!
//! The orchestrator only sees the traits defined here: a [`Provisioner`] allocates
//! infrastructure for a lab, a [`Configurator`] sets up the running VMs, and a [`VmControl`]
//! maps start/stop/restart intents onto the hypervisor. Every external command's output is
//! written through a [`DeploymentLogSink`] so that failures can be diagnosed from the
//! persisted log trail alone.

// Standard library
use std::fmt;
use std::str::FromStr;

// External crates
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod ansible;
pub mod error;
mod exec;
pub mod readiness;
pub mod terraform;
pub mod virsh;

// When the `test-helpers` feature is enabled, include the scripted adapters.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use ansible::{validate_playbook, AnsibleConfig, AnsibleConfigurator};
pub use error::{ProviderError, Result};
pub use readiness::{ProbeTarget, ReadinessConfig};
pub use terraform::{TerraformConfig, TerraformProvisioner};
pub use virsh::{DomainState, VirshControl, VmControl};

/// Category of a persisted deployment log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Provisioning,
    Configuration,
    Pipeline,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Provisioning => "provisioning",
            LogCategory::Configuration => "configuration",
            LogCategory::Pipeline => "pipeline",
            LogCategory::Error => "error",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(LogCategory::Provisioning),
            "configuration" => Ok(LogCategory::Configuration),
            "pipeline" => Ok(LogCategory::Pipeline),
            "error" => Ok(LogCategory::Error),
            other => Err(format!("unknown log category '{}'", other)),
        }
    }
}

/// Everything an adapter needs to know about a lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSpec {
    pub id: String,
    pub name: String,
    pub vms: Vec<VmSpec>,
}

impl LabSpec {
    /// The first non-empty configuration payload across the lab's VMs, in VM order.
    ///
    /// This one payload is applied to every VM; per-VM playbooks are not supported.
    pub fn configuration_payload(&self) -> Option<&str> {
        self.vms
            .iter()
            .filter_map(|vm| vm.config_payload.as_deref())
            .find(|payload| !payload.trim().is_empty())
    }

    pub fn needs_configuration(&self) -> bool {
        self.configuration_payload().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub id: String,
    pub name: String,
    pub vcpu: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub os_image: String,
    pub config_payload: Option<String>,
    pub ssh_port: Option<u16>,
    pub vnc_port: Option<u16>,
    /// Opaque to everything except the provisioner that wrote it.
    pub provision_state: Option<String>,
}

/// Result of provisioning one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVm {
    pub vm_id: String,
    pub ssh_port: u16,
    pub vnc_port: Option<u16>,
    pub provision_state: Option<String>,
}

/// Append-only destination for deployment log records.
#[async_trait]
pub trait DeploymentLogSink: Send + Sync {
    async fn append(&self, lab_id: &str, category: LogCategory, content: &str) -> Result<()>;
}

/// Allocates and releases the infrastructure backing a lab.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provision every VM of the lab, returning one entry per VM.
    ///
    /// Each external command is recorded as one `provisioning` log record.
    async fn provision(
        &self,
        lab: &LabSpec,
        log: &dyn DeploymentLogSink,
    ) -> Result<Vec<ProvisionedVm>>;

    /// Release everything `provision` created for the lab.
    async fn teardown(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()>;
}

/// Applies the lab's configuration payload to its provisioned VMs.
#[async_trait]
pub trait Configurator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn configure(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()>;
}

/// Hypervisor domain name for a VM: `lab_<lab-id>_<vm-name>` with `-` and spaces replaced.
pub fn domain_name(lab_id: &str, vm_name: &str) -> String {
    format!("lab_{}_{}", lab_id.replace(['-', ' '], "_"), domain_suffix(vm_name))
}

/// The part of [`domain_name`] contributed by the VM name. Two VMs of one lab must not share it.
pub fn domain_suffix(vm_name: &str) -> String {
    vm_name.replace(['-', ' '], "_")
}

/// Whether a VM name can be embedded in a domain name and in generated tool descriptors.
pub fn is_valid_vm_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, payload: Option<&str>) -> VmSpec {
        VmSpec {
            id: format!("id-{}", name),
            name: name.to_string(),
            vcpu: 1,
            ram_mb: 1024,
            disk_gb: 10,
            os_image: "ubuntu-22.04".to_string(),
            config_payload: payload.map(str::to_string),
            ssh_port: None,
            vnc_port: None,
            provision_state: None,
        }
    }

    #[test]
    fn test_domain_name_sanitizes() {
        assert_eq!(
            domain_name("3f2a-11", "web server-1"),
            "lab_3f2a_11_web_server_1"
        );
        assert_eq!(domain_suffix("web-1"), domain_suffix("web_1"));
    }

    #[test]
    fn test_vm_name_charset() {
        for name in ["web-1", "db_primary", "Client 2"] {
            assert!(is_valid_vm_name(name), "{}", name);
        }
        for name in ["", "db\"x", "a}b", "web.1", "name\n", "ünï"] {
            assert!(!is_valid_vm_name(name), "{:?}", name);
        }
    }

    #[test]
    fn test_first_non_empty_payload_wins() {
        let lab = LabSpec {
            id: "lab".to_string(),
            name: "lab".to_string(),
            vms: vec![
                vm("a", None),
                vm("b", Some("   \n")),
                vm("c", Some("- hosts: all")),
                vm("d", Some("- hosts: other")),
            ],
        };
        assert_eq!(lab.configuration_payload(), Some("- hosts: all"));
        assert!(lab.needs_configuration());
    }

    #[test]
    fn test_no_payload_means_no_configuration() {
        let lab = LabSpec {
            id: "lab".to_string(),
            name: "lab".to_string(),
            vms: vec![vm("a", None)],
        };
        assert!(!lab.needs_configuration());
    }

    #[test]
    fn test_log_category_round_trip_through_str() {
        for category in [
            LogCategory::Provisioning,
            LogCategory::Configuration,
            LogCategory::Pipeline,
            LogCategory::Error,
        ] {
            assert_eq!(category.as_str().parse::<LogCategory>(), Ok(category));
        }
        assert!("debug".parse::<LogCategory>().is_err());
    }
}
