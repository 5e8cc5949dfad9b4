//! Lab lifecycle business logic
//!
//! This crate owns the lab record store and the deployment pipeline that drives a lab from
//! `created` through provisioning and configuration to `deployed` or `error`. It is consumed
//! by the lab-api HTTP service.

pub mod db;
pub mod deployment_log;
pub mod error;
pub mod lab;
pub mod pipeline;
pub mod single_flight;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use deployment_log::DeploymentLogRecord;
pub use error::{OrchestratorError, Result};
pub use lab::{CreateLabRequest, CreateVmRequest, Lab, LabStatus, LabStore, Vm, VmStatus};
pub use lab_provider::LogCategory;
pub use pipeline::{DeploymentOrchestrator, PipelineConfig};
pub use single_flight::{LabClaim, LabLocks};
