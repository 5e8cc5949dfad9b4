//! The deployment pipeline: provisioning, then optional configuration, then a terminal status.
//!
//! `deploy` claims the lab in-process, flips its persisted status to `deploying` together with
//! the start record, and hands the pipeline to a supervised background task. The supervisor
//! runs the pipeline in its own task so that a panic anywhere inside it is observed as a
//! `JoinError` and still settles the lab in `error`.

use std::any::Any;
use std::sync::Arc;

use lab_provider::{Configurator, LabSpec, LogCategory, Provisioner};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn, Instrument};

use crate::error::{OrchestratorError, Result};
use crate::lab::{Lab, LabStatus, LabStore};
use crate::single_flight::{LabClaim, LabLocks};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pipelines allowed to run at once across all labs.
    pub max_concurrent_deployments: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: 4,
        }
    }
}

#[derive(Clone)]
pub struct DeploymentOrchestrator {
    store: LabStore,
    provisioner: Arc<dyn Provisioner>,
    configurator: Arc<dyn Configurator>,
    locks: LabLocks,
    workers: Arc<Semaphore>,
}

impl DeploymentOrchestrator {
    pub fn new(
        store: LabStore,
        provisioner: Arc<dyn Provisioner>,
        configurator: Arc<dyn Configurator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            provisioner,
            configurator,
            locks: LabLocks::new(),
            workers: Arc::new(Semaphore::new(config.max_concurrent_deployments.max(1))),
        }
    }

    pub fn store(&self) -> &LabStore {
        &self.store
    }

    /// Whether a deploy or destroy currently holds the lab.
    pub fn is_busy(&self, lab_id: &str) -> bool {
        self.locks.is_claimed(lab_id)
    }

    /// Start deploying a lab in the background.
    ///
    /// Returns as soon as the lab is marked `deploying`; progress is observed through the lab's
    /// status and log records. Fails with `AlreadyDeploying` if a pipeline holds the lab.
    #[instrument(skip(self))]
    pub async fn deploy(&self, lab_id: &str) -> Result<Lab> {
        let claim = self
            .locks
            .try_claim(lab_id)
            .ok_or_else(|| OrchestratorError::AlreadyDeploying(lab_id.to_string()))?;

        let lab = self.store.begin_deployment(lab_id).await?;
        info!(vm_count = lab.vms.len(), "Deployment accepted");

        let supervisor = self.clone();
        let spec = LabSpec::from(&lab);
        tokio::spawn(
            async move { supervisor.supervise(spec, claim).await }
                .instrument(tracing::info_span!("deployment", lab_id = %lab.id)),
        );

        Ok(lab)
    }

    async fn supervise(self, lab: LabSpec, claim: LabClaim) {
        let _claim = claim;
        let _permit = self.workers.clone().acquire_owned().await.ok();
        let lab_id = lab.id.clone();

        let runner = self.clone();
        let outcome = tokio::spawn(async move { runner.run_pipeline(&lab).await }.in_current_span()).await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => {
                format!("pipeline panicked: {}", panic_message(join.into_panic()))
            }
            Err(join) => format!("pipeline task was cancelled: {}", join),
        };

        error!(lab_id = %lab_id, reason = %failure, "Deployment failed");
        let message = format!("Deployment failed: {}", failure);
        if let Err(e) = self
            .store
            .finish_deployment(&lab_id, LabStatus::Error, LogCategory::Error, &message)
            .await
        {
            error!(lab_id = %lab_id, error = %e, "Could not record deployment failure");
            if let Err(e) = self.store.force_lab_status(&lab_id, LabStatus::Error).await {
                error!(lab_id = %lab_id, error = %e, "Lab status could not be reset");
            }
        }
    }

    async fn run_pipeline(&self, lab: &LabSpec) -> Result<()> {
        let store = &self.store;

        if lab.vms.is_empty() {
            store
                .finish_deployment(
                    &lab.id,
                    LabStatus::Deployed,
                    LogCategory::Pipeline,
                    "Lab has no VMs; nothing to provision. Deployment complete",
                )
                .await?;
            return Ok(());
        }

        info!(provisioner = self.provisioner.name(), "Provisioning lab");
        let provisioned = self
            .provisioner
            .provision(lab, store)
            .await
            .map_err(|source| OrchestratorError::StageFailed {
                stage: "Provisioning",
                source,
            })?;
        store.record_provisioned(&lab.id, &provisioned).await?;

        if !lab.needs_configuration() {
            store
                .finish_deployment(
                    &lab.id,
                    LabStatus::Deployed,
                    LogCategory::Pipeline,
                    "No configuration payload on any VM; configuration skipped. Deployment complete",
                )
                .await?;
            return Ok(());
        }

        // Reload so the configurator sees the endpoints just assigned.
        let lab = LabSpec::from(&store.get_lab(&lab.id).await?);
        store
            .append_log(
                &lab.id,
                LogCategory::Pipeline,
                &format!("Configuring lab with {}", self.configurator.name()),
            )
            .await?;

        info!(configurator = self.configurator.name(), "Configuring lab");
        self.configurator
            .configure(&lab, store)
            .await
            .map_err(|source| OrchestratorError::StageFailed {
                stage: "Configuration",
                source,
            })?;

        store
            .finish_deployment(
                &lab.id,
                LabStatus::Deployed,
                LogCategory::Pipeline,
                "Deployment complete",
            )
            .await?;
        Ok(())
    }

    /// Tear down a lab's infrastructure and mark it `deleted`.
    ///
    /// On teardown failure an `error` record is appended and the lab keeps its status, so the
    /// call can be retried.
    #[instrument(skip(self))]
    pub async fn destroy(&self, lab_id: &str) -> Result<Lab> {
        let _claim = self
            .locks
            .try_claim(lab_id)
            .ok_or_else(|| OrchestratorError::AlreadyDeploying(lab_id.to_string()))?;

        let lab = self.store.get_lab(lab_id).await?;
        match lab.status {
            LabStatus::Deploying => return Err(OrchestratorError::AlreadyDeploying(lab.id)),
            LabStatus::Deleted => {
                return Err(OrchestratorError::InvalidState(format!(
                    "Lab {} is already deleted",
                    lab.id
                )))
            }
            LabStatus::Created | LabStatus::Deployed | LabStatus::Error => {}
        }

        if let Err(e) = self.provisioner.teardown(&LabSpec::from(&lab), &self.store).await {
            warn!(error = %e, "Teardown failed");
            self.store
                .append_log(lab_id, LogCategory::Error, &format!("Destroy failed: {}", e))
                .await?;
            return Err(e.into());
        }

        self.store.mark_destroyed(lab_id).await?;
        info!("Lab destroyed");
        self.store.get_lab(lab_id).await
    }

    /// Remove a lab record along with its VMs and logs.
    ///
    /// Holds the same claim as deploy and destroy. Only labs without live infrastructure
    /// (`created`, `error` or `deleted`) can be removed; a deployed lab must be destroyed first.
    #[instrument(skip(self))]
    pub async fn delete(&self, lab_id: &str) -> Result<Lab> {
        let _claim = self
            .locks
            .try_claim(lab_id)
            .ok_or_else(|| OrchestratorError::AlreadyDeploying(lab_id.to_string()))?;

        let lab = self.store.get_lab(lab_id).await?;
        match lab.status {
            LabStatus::Deploying => return Err(OrchestratorError::AlreadyDeploying(lab.id)),
            LabStatus::Deployed => {
                return Err(OrchestratorError::InvalidState(format!(
                    "Lab {} is deployed; destroy it before deleting",
                    lab.id
                )))
            }
            LabStatus::Created | LabStatus::Error | LabStatus::Deleted => {}
        }

        self.store.delete_lab(lab_id).await?;
        Ok(lab)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::{CreateLabRequest, CreateVmRequest};
    use crate::test_utils::create_test_db;
    use lab_provider::mock::{ScriptedConfigurator, ScriptedProvisioner};
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn settle(orchestrator: &DeploymentOrchestrator, lab_id: &str) -> Lab {
        for _ in 0..250 {
            let lab = orchestrator.store().get_lab(lab_id).await.unwrap();
            if lab.status != LabStatus::Deploying && !orchestrator.is_busy(lab_id) {
                return lab;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("lab {} never left deploying", lab_id);
    }

    async fn setup(
        provisioner: ScriptedProvisioner,
        vms: Vec<CreateVmRequest>,
    ) -> (DeploymentOrchestrator, Arc<ScriptedProvisioner>, Lab) {
        let store = LabStore::new(create_test_db().await);
        let lab = store
            .create_lab(CreateLabRequest {
                name: "unit".to_string(),
                description: None,
                config_payload: None,
                vms,
            })
            .await
            .unwrap();
        let provisioner = Arc::new(provisioner);
        let orchestrator = DeploymentOrchestrator::new(
            store,
            provisioner.clone(),
            Arc::new(ScriptedConfigurator::succeeding()),
            PipelineConfig::default(),
        );
        (orchestrator, provisioner, lab)
    }

    fn vm(name: &str) -> CreateVmRequest {
        CreateVmRequest {
            name: name.to_string(),
            vcpu: 1,
            ram_mb: 1024,
            disk_gb: 10,
            os_image: None,
            config_payload: None,
        }
    }

    #[tokio::test]
    async fn test_panicking_provisioner_still_settles_in_error() {
        let (orchestrator, _, lab) = setup(ScriptedProvisioner::panicking(), vec![vm("a")]).await;

        orchestrator.deploy(&lab.id).await.unwrap();
        let lab = settle(&orchestrator, &lab.id).await;

        assert_eq!(lab.status, LabStatus::Error);
        let logs = orchestrator.store().list_logs(&lab.id).await.unwrap();
        let last = logs.last().unwrap();
        assert_eq!(last.category, LogCategory::Error);
        assert!(last.content.contains("pipeline panicked"));
    }

    #[tokio::test]
    async fn test_zero_vm_lab_skips_provisioner() {
        let (orchestrator, provisioner, lab) = setup(ScriptedProvisioner::succeeding(), vec![]).await;

        orchestrator.deploy(&lab.id).await.unwrap();
        let lab = settle(&orchestrator, &lab.id).await;

        assert_eq!(lab.status, LabStatus::Deployed);
        assert_eq!(provisioner.provision_calls(), 0);
    }

    #[tokio::test]
    async fn test_destroy_refuses_deleted_lab() {
        let (orchestrator, provisioner, lab) =
            setup(ScriptedProvisioner::succeeding(), vec![vm("a")]).await;

        let destroyed = orchestrator.destroy(&lab.id).await.unwrap();
        assert_eq!(destroyed.status, LabStatus::Deleted);
        assert!(matches!(
            orchestrator.destroy(&lab.id).await,
            Err(OrchestratorError::InvalidState(_))
        ));
        assert!(matches!(
            orchestrator.deploy(&lab.id).await,
            Err(OrchestratorError::InvalidState(_))
        ));
        assert_eq!(provisioner.teardown_calls(), 1);
        assert!(!orchestrator.is_busy(&lab.id));
    }

    #[tokio::test]
    async fn test_delete_waits_out_running_destroy() {
        let gate = Arc::new(Notify::new());
        let (orchestrator, _, lab) = setup(
            ScriptedProvisioner::succeeding().gated_teardown(gate.clone()),
            vec![vm("a")],
        )
        .await;

        let destroying = {
            let orchestrator = orchestrator.clone();
            let lab_id = lab.id.clone();
            tokio::spawn(async move { orchestrator.destroy(&lab_id).await })
        };
        while !orchestrator.is_busy(&lab.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            orchestrator.delete(&lab.id).await,
            Err(OrchestratorError::AlreadyDeploying(_))
        ));

        gate.notify_one();
        let destroyed = destroying.await.unwrap().unwrap();
        assert_eq!(destroyed.status, LabStatus::Deleted);

        orchestrator.delete(&lab.id).await.unwrap();
        assert!(matches!(
            orchestrator.store().get_lab(&lab.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_refuses_deployed_lab() {
        let (orchestrator, provisioner, lab) =
            setup(ScriptedProvisioner::succeeding(), vec![vm("a")]).await;

        orchestrator.deploy(&lab.id).await.unwrap();
        assert_eq!(settle(&orchestrator, &lab.id).await.status, LabStatus::Deployed);

        assert!(matches!(
            orchestrator.delete(&lab.id).await,
            Err(OrchestratorError::InvalidState(_))
        ));
        assert!(orchestrator.store().get_lab(&lab.id).await.is_ok());
        assert_eq!(provisioner.teardown_calls(), 0);
    }
}
