use lab_orchestrator::PipelineConfig;
use lab_ports::PortRange;
use lab_provider::{AnsibleConfig, ReadinessConfig, TerraformConfig};
use lab_tunnel::TunnelConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Parent of the per-lab Terraform and Ansible workspaces.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,

    #[serde(default = "default_ansible_bin")]
    pub ansible_bin: String,

    #[serde(default = "default_ansible_user")]
    pub ansible_user: String,

    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,

    /// Host on which VM terminal and graphical ports are reachable.
    #[serde(default = "default_terminal_host")]
    pub terminal_host: String,

    #[serde(default = "default_ssh_port_range")]
    pub ssh_port_range: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_secs: u64,

    #[serde(default = "default_max_deployments")]
    pub max_deployments: usize,

    #[serde(default = "default_tunnel_chunk_size")]
    pub tunnel_chunk_size: usize,

    #[serde(default = "default_tunnel_connect_timeout")]
    pub tunnel_connect_timeout_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("VLAB_API_BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VLAB_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".virtual-labs").join("labs.db")
}

fn default_work_root() -> PathBuf {
    std::env::var("VLAB_WORK_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("virtual-labs"))
}

fn default_terraform_bin() -> String {
    std::env::var("VLAB_TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string())
}

fn default_ansible_bin() -> String {
    std::env::var("VLAB_ANSIBLE_BIN").unwrap_or_else(|_| "ansible-playbook".to_string())
}

fn default_ansible_user() -> String {
    std::env::var("VLAB_ANSIBLE_USER").unwrap_or_else(|_| "ubuntu".to_string())
}

fn default_libvirt_uri() -> String {
    std::env::var("VLAB_LIBVIRT_URI").unwrap_or_else(|_| "qemu:///system".to_string())
}

fn default_terminal_host() -> String {
    std::env::var("VLAB_TERMINAL_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn default_ssh_port_range() -> String {
    std::env::var("VLAB_SSH_PORT_RANGE").unwrap_or_else(|_| "22000-22999".to_string())
}

fn default_command_timeout() -> u64 {
    env_or("VLAB_COMMAND_TIMEOUT", 1800) // 30 minutes
}

fn default_readiness_timeout() -> u64 {
    env_or("VLAB_READINESS_TIMEOUT", 300)
}

fn default_readiness_interval() -> u64 {
    env_or("VLAB_READINESS_INTERVAL", 10)
}

fn default_max_deployments() -> usize {
    env_or("VLAB_MAX_DEPLOYMENTS", 4)
}

fn default_tunnel_chunk_size() -> usize {
    env_or("VLAB_TUNNEL_CHUNK_SIZE", 1024)
}

fn default_tunnel_connect_timeout() -> u64 {
    env_or("VLAB_TUNNEL_CONNECT_TIMEOUT", 10)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            work_root: default_work_root(),
            terraform_bin: default_terraform_bin(),
            ansible_bin: default_ansible_bin(),
            ansible_user: default_ansible_user(),
            libvirt_uri: default_libvirt_uri(),
            terminal_host: default_terminal_host(),
            ssh_port_range: default_ssh_port_range(),
            command_timeout_secs: default_command_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_secs: default_readiness_interval(),
            max_deployments: default_max_deployments(),
            tunnel_chunk_size: default_tunnel_chunk_size(),
            tunnel_connect_timeout_secs: default_tunnel_connect_timeout(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn port_range(&self) -> lab_ports::Result<PortRange> {
        PortRange::parse(&self.ssh_port_range)
    }

    fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn terraform(&self) -> TerraformConfig {
        TerraformConfig {
            binary: self.terraform_bin.clone(),
            work_root: self.work_root.clone(),
            libvirt_uri: self.libvirt_uri.clone(),
            command_timeout: self.command_timeout(),
            ..TerraformConfig::default()
        }
    }

    pub fn ansible(&self) -> AnsibleConfig {
        AnsibleConfig {
            binary: self.ansible_bin.clone(),
            work_root: self.work_root.clone(),
            terminal_host: self.terminal_host.clone(),
            remote_user: self.ansible_user.clone(),
            readiness: ReadinessConfig {
                interval: Duration::from_secs(self.readiness_interval_secs),
                timeout: Duration::from_secs(self.readiness_timeout_secs),
                ..ReadinessConfig::default()
            },
            command_timeout: self.command_timeout(),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrent_deployments: self.max_deployments,
        }
    }

    pub fn tunnel(&self) -> TunnelConfig {
        TunnelConfig {
            chunk_size: self.tunnel_chunk_size,
            connect_timeout: Duration::from_secs(self.tunnel_connect_timeout_secs),
            ..TunnelConfig::default()
        }
    }
}
