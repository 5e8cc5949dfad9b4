//! VM power control through `virsh`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lab_core::{run_captured, CommandSpec};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ProviderError, Result};

/// Hypervisor view of a domain's power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Stopped,
    Unknown,
}

/// Start/stop/inspect a VM by its hypervisor domain name.
#[async_trait]
pub trait VmControl: Send + Sync {
    async fn start(&self, domain: &str) -> Result<()>;
    async fn stop(&self, domain: &str) -> Result<()>;
    async fn restart(&self, domain: &str) -> Result<()>;
    async fn state(&self, domain: &str) -> Result<DomainState>;
    async fn info(&self, domain: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone)]
pub struct VirshControl {
    binary: String,
    connect_uri: Option<String>,
    timeout: Option<Duration>,
}

impl Default for VirshControl {
    fn default() -> Self {
        Self {
            binary: "virsh".to_string(),
            connect_uri: None,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl VirshControl {
    pub fn new(connect_uri: impl Into<String>) -> Self {
        Self {
            connect_uri: Some(connect_uri.into()),
            ..Default::default()
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn virsh(&self, subcommand: &str, domain: &str) -> Result<String> {
        let mut spec = CommandSpec::new(self.binary.as_str()).timeout(self.timeout);
        if let Some(uri) = &self.connect_uri {
            spec = spec.args(["-c", uri.as_str()]);
        }
        let spec = spec.args([subcommand, domain]);

        let output = tokio::task::spawn_blocking(move || run_captured(&spec)).await??;
        debug!(command = %output.command_line, exit_code = ?output.exit_code, "virsh finished");

        if output.success() {
            Ok(output.output)
        } else {
            Err(ProviderError::CommandFailed {
                command: output.command_line,
                exit_code: output.exit_code,
                output: output.output,
            })
        }
    }
}

#[async_trait]
impl VmControl for VirshControl {
    async fn start(&self, domain: &str) -> Result<()> {
        self.virsh("start", domain).await.map(|_| ())
    }

    async fn stop(&self, domain: &str) -> Result<()> {
        self.virsh("shutdown", domain).await.map(|_| ())
    }

    async fn restart(&self, domain: &str) -> Result<()> {
        self.virsh("reboot", domain).await.map(|_| ())
    }

    async fn state(&self, domain: &str) -> Result<DomainState> {
        Ok(parse_domstate(&self.virsh("domstate", domain).await?))
    }

    async fn info(&self, domain: &str) -> Result<BTreeMap<String, String>> {
        Ok(parse_dominfo(&self.virsh("dominfo", domain).await?))
    }
}

pub fn parse_domstate(output: &str) -> DomainState {
    match output.trim() {
        "running" => DomainState::Running,
        "shut off" | "shutoff" => DomainState::Stopped,
        _ => DomainState::Unknown,
    }
}

/// Parse `virsh dominfo` `Key: value` lines.
pub fn parse_dominfo(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domstate() {
        assert_eq!(parse_domstate("running\n\n"), DomainState::Running);
        assert_eq!(parse_domstate("shut off\n"), DomainState::Stopped);
        assert_eq!(parse_domstate("paused"), DomainState::Unknown);
    }

    #[test]
    fn test_parse_dominfo() {
        let output = "Id:             3\nName:           lab_x_web\nState:          running\nMax memory:     2097152 KiB\n\n";
        let info = parse_dominfo(output);
        assert_eq!(info.get("Name").map(String::as_str), Some("lab_x_web"));
        assert_eq!(info.get("Max memory").map(String::as_str), Some("2097152 KiB"));
        assert_eq!(info.len(), 4);
    }

    #[tokio::test]
    async fn test_failing_virsh_reports_output() {
        let control = VirshControl::default().with_binary("false");
        match control.start("lab_x_web").await {
            Err(ProviderError::CommandFailed { command, .. }) => {
                assert_eq!(command, "false start lab_x_web");
            }
            other => panic!("Expected command failure, got {:?}", other),
        }
    }
}
