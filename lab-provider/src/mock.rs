//! Scripted adapters for exercising the deployment pipeline without external tools.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    Configurator, DeploymentLogSink, DomainState, LabSpec, LogCategory, ProviderError,
    ProvisionedVm, Provisioner, Result, VmControl,
};

/// Log sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<(String, LogCategory, String)>>,
}

impl MemoryLogSink {
    pub fn records(&self) -> Vec<(String, LogCategory, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, category: LogCategory) -> usize {
        self.records()
            .iter()
            .filter(|(_, c, _)| *c == category)
            .count()
    }
}

#[async_trait]
impl DeploymentLogSink for MemoryLogSink {
    async fn append(&self, lab_id: &str, category: LogCategory, content: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((lab_id.to_string(), category, content.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeed,
    Fail(String),
    Panic,
}

/// A provisioner that writes one `provisioning` record per call and then does what it was told.
pub struct ScriptedProvisioner {
    outcome: Outcome,
    teardown_failure: Option<String>,
    gate: Option<Arc<Notify>>,
    teardown_gate: Option<Arc<Notify>>,
    next_port: AtomicU16,
    provision_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
}

impl ScriptedProvisioner {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            teardown_failure: None,
            gate: None,
            teardown_gate: None,
            next_port: AtomicU16::new(40000),
            provision_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_outcome(Outcome::Succeed)
    }

    /// Fails as if the tool exited non-zero printing `output`.
    pub fn failing(output: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Fail(output.into()))
    }

    pub fn panicking() -> Self {
        Self::with_outcome(Outcome::Panic)
    }

    /// Block `provision` until the gate is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Block `teardown` until the gate is notified.
    pub fn gated_teardown(mut self, gate: Arc<Notify>) -> Self {
        self.teardown_gate = Some(gate);
        self
    }

    pub fn failing_teardown(mut self, output: impl Into<String>) -> Self {
        self.teardown_failure = Some(output.into());
        self
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn provision(
        &self,
        lab: &LabSpec,
        log: &dyn DeploymentLogSink,
    ) -> Result<Vec<ProvisionedVm>> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match &self.outcome {
            Outcome::Succeed => {
                log.append(
                    &lab.id,
                    LogCategory::Provisioning,
                    "Command: scripted apply\nApply complete!",
                )
                .await?;
                Ok(lab
                    .vms
                    .iter()
                    .map(|vm| {
                        let port = self.next_port.fetch_add(2, Ordering::SeqCst);
                        ProvisionedVm {
                            vm_id: vm.id.clone(),
                            ssh_port: port,
                            vnc_port: Some(port + 1),
                            provision_state: Some(format!("{{\"domain\":\"scripted_{}\"}}", vm.name)),
                        }
                    })
                    .collect())
            }
            Outcome::Fail(output) => {
                log.append(
                    &lab.id,
                    LogCategory::Provisioning,
                    &format!("Command: scripted apply\n{}", output),
                )
                .await?;
                Err(ProviderError::CommandFailed {
                    command: "scripted apply".to_string(),
                    exit_code: Some(1),
                    output: output.clone(),
                })
            }
            Outcome::Panic => panic!("scripted provisioner panicked"),
        }
    }

    async fn teardown(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.teardown_gate {
            gate.notified().await;
        }

        match &self.teardown_failure {
            None => {
                log.append(&lab.id, LogCategory::Provisioning, "Command: scripted destroy\nDestroy complete!")
                    .await?;
                Ok(())
            }
            Some(output) => {
                log.append(
                    &lab.id,
                    LogCategory::Provisioning,
                    &format!("Command: scripted destroy\n{}", output),
                )
                .await?;
                Err(ProviderError::CommandFailed {
                    command: "scripted destroy".to_string(),
                    exit_code: Some(1),
                    output: output.clone(),
                })
            }
        }
    }
}

/// A configurator that records the payload it was asked to apply.
pub struct ScriptedConfigurator {
    failure: Option<String>,
    applied: Mutex<Vec<String>>,
}

impl ScriptedConfigurator {
    pub fn succeeding() -> Self {
        Self {
            failure: None,
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(output: impl Into<String>) -> Self {
        Self {
            failure: Some(output.into()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.applied().len()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Configurator for ScriptedConfigurator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn configure(&self, lab: &LabSpec, log: &dyn DeploymentLogSink) -> Result<()> {
        let payload = lab.configuration_payload().unwrap_or_default().to_string();
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);

        match &self.failure {
            None => {
                log.append(&lab.id, LogCategory::Configuration, "Command: scripted playbook\nok=1")
                    .await?;
                Ok(())
            }
            Some(output) => {
                log.append(
                    &lab.id,
                    LogCategory::Configuration,
                    &format!("Command: scripted playbook\n{}", output),
                )
                .await?;
                Err(ProviderError::CommandFailed {
                    command: "scripted playbook".to_string(),
                    exit_code: Some(2),
                    output: output.clone(),
                })
            }
        }
    }
}

/// In-memory hypervisor: domains start out stopped.
#[derive(Debug, Default)]
pub struct MockVmControl {
    states: Mutex<BTreeMap<String, DomainState>>,
}

impl MockVmControl {
    fn set(&self, domain: &str, state: DomainState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_string(), state);
    }
}

#[async_trait]
impl VmControl for MockVmControl {
    async fn start(&self, domain: &str) -> Result<()> {
        self.set(domain, DomainState::Running);
        Ok(())
    }

    async fn stop(&self, domain: &str) -> Result<()> {
        self.set(domain, DomainState::Stopped);
        Ok(())
    }

    async fn restart(&self, domain: &str) -> Result<()> {
        self.set(domain, DomainState::Running);
        Ok(())
    }

    async fn state(&self, domain: &str) -> Result<DomainState> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .copied()
            .unwrap_or(DomainState::Stopped))
    }

    async fn info(&self, domain: &str) -> Result<BTreeMap<String, String>> {
        let state = self.state(domain).await?;
        let mut info = BTreeMap::new();
        info.insert("Name".to_string(), domain.to_string());
        info.insert(
            "State".to_string(),
            match state {
                DomainState::Running => "running",
                DomainState::Stopped => "shut off",
                DomainState::Unknown => "unknown",
            }
            .to_string(),
        );
        Ok(info)
    }
}
