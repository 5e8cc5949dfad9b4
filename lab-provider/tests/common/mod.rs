#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use lab_provider::{DeploymentLogSink, LabSpec, LogCategory, Result, VmSpec};

#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<(LogCategory, String)>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<(LogCategory, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentLogSink for RecordingSink {
    async fn append(&self, _lab_id: &str, category: LogCategory, content: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((category, content.to_string()));
        Ok(())
    }
}

/// Write an executable shell script standing in for an external tool.
pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn vm(id: &str, name: &str) -> VmSpec {
    VmSpec {
        id: id.to_string(),
        name: name.to_string(),
        vcpu: 2,
        ram_mb: 2048,
        disk_gb: 20,
        os_image: "ubuntu-22.04".to_string(),
        config_payload: None,
        ssh_port: None,
        vnc_port: None,
        provision_state: None,
    }
}

pub fn lab(id: &str, vms: Vec<VmSpec>) -> LabSpec {
    LabSpec {
        id: id.to_string(),
        name: format!("lab {}", id),
        vms,
    }
}
