use crate::deployment_log::insert_log;
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use lab_provider::terraform::DEFAULT_OS_IMAGE;
use lab_provider::{domain_suffix, is_valid_vm_name, LabSpec, LogCategory, ProvisionedVm, VmSpec};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const VCPU_RANGE: RangeInclusive<u32> = 1..=16;
pub const RAM_MB_RANGE: RangeInclusive<u32> = 512..=32768;
pub const DISK_GB_RANGE: RangeInclusive<u32> = 10..=500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    Created,
    Deploying,
    Deployed,
    Error,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Running,
    Stopped,
    Error,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Lab {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: LabStatus,
    pub vms: Vec<Vm>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Vm {
    pub id: String,
    pub lab_id: String,
    pub name: String,
    pub vcpu: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub os_image: String,
    pub status: VmStatus,
    pub ssh_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub config_payload: Option<String>,
    /// Owned by the provisioner; never exposed.
    #[serde(skip)]
    pub provision_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateLabRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Applied to every VM that does not carry its own payload.
    #[serde(default)]
    pub config_payload: Option<String>,
    #[serde(default)]
    pub vms: Vec<CreateVmRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateVmRequest {
    pub name: String,
    pub vcpu: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    #[serde(default)]
    pub os_image: Option<String>,
    #[serde(default)]
    pub config_payload: Option<String>,
}

impl From<&Vm> for VmSpec {
    fn from(vm: &Vm) -> Self {
        Self {
            id: vm.id.clone(),
            name: vm.name.clone(),
            vcpu: vm.vcpu,
            ram_mb: vm.ram_mb,
            disk_gb: vm.disk_gb,
            os_image: vm.os_image.clone(),
            config_payload: vm.config_payload.clone(),
            ssh_port: vm.ssh_port,
            vnc_port: vm.vnc_port,
            provision_state: vm.provision_state.clone(),
        }
    }
}

impl From<&Lab> for LabSpec {
    fn from(lab: &Lab) -> Self {
        Self {
            id: lab.id.clone(),
            name: lab.name.clone(),
            vms: lab.vms.iter().map(VmSpec::from).collect(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn check_range(field: &str, vm: &str, value: u32, range: &RangeInclusive<u32>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "VM '{}': {} must be between {} and {}, got {}",
            vm,
            field,
            range.start(),
            range.end(),
            value
        )))
    }
}

fn validate_create(req: &CreateLabRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(OrchestratorError::InvalidInput(
            "Lab name must not be empty".to_string(),
        ));
    }

    let mut names = HashSet::new();
    let mut domains = HashMap::new();
    for vm in &req.vms {
        let name = vm.name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "VM name must not be empty".to_string(),
            ));
        }
        if !is_valid_vm_name(name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "VM name '{}' may only contain letters, digits, spaces, '_' and '-'",
                name
            )));
        }
        if !names.insert(name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "Duplicate VM name '{}'",
                name
            )));
        }
        if let Some(other) = domains.insert(domain_suffix(name), name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "VM names '{}' and '{}' map to the same domain name",
                other, name
            )));
        }
        check_range("vcpu", name, vm.vcpu, &VCPU_RANGE)?;
        check_range("ram_mb", name, vm.ram_mb, &RAM_MB_RANGE)?;
        check_range("disk_gb", name, vm.disk_gb, &DISK_GB_RANGE)?;
    }

    Ok(())
}

fn name_conflict(err: sqlx::Error, name: &str) -> OrchestratorError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            OrchestratorError::InvalidInput(format!("A lab named '{}' already exists", name))
        }
        _ => err.into(),
    }
}

/// Durable record store for labs, VMs and their deployment logs.
#[derive(Clone)]
pub struct LabStore {
    pool: SqlitePool,
}

impl LabStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a lab together with its VMs in one transaction.
    #[instrument(skip(self, req), fields(lab_name = %req.name))]
    pub async fn create_lab(&self, req: CreateLabRequest) -> Result<Lab> {
        validate_create(&req)?;

        let name = req.name.trim().to_string();
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM labs WHERE name = ?")
            .bind(&name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(OrchestratorError::InvalidInput(format!(
                "A lab named '{}' already exists",
                name
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let lab_payload = non_empty(req.config_payload);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO labs (id, name, description, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&name)
        .bind(req.description.unwrap_or_default())
        .bind(LabStatus::Created)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| name_conflict(e, &name))?;

        for (position, vm) in req.vms.into_iter().enumerate() {
            let payload = non_empty(vm.config_payload).or_else(|| lab_payload.clone());
            let os_image = non_empty(vm.os_image).unwrap_or_else(|| DEFAULT_OS_IMAGE.to_string());

            sqlx::query(
                r#"
                INSERT INTO vms (id, lab_id, position, name, vcpu, ram_mb, disk_gb, os_image, status, config_payload, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(position as i64)
            .bind(vm.name.trim())
            .bind(i64::from(vm.vcpu))
            .bind(i64::from(vm.ram_mb))
            .bind(i64::from(vm.disk_gb))
            .bind(os_image)
            .bind(VmStatus::Pending)
            .bind(payload)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(lab_id = %id, "Lab created");

        self.get_lab(&id).await
    }

    /// Get a single lab with its VMs
    pub async fn get_lab(&self, id: &str) -> Result<Lab> {
        let row = sqlx::query_as::<_, LabRow>("SELECT * FROM labs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Lab {}", id)))?;

        let vms = sqlx::query_as::<_, VmRow>("SELECT * FROM vms WHERE lab_id = ? ORDER BY position")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(row.into_lab(vms.into_iter().map(Vm::from).collect()))
    }

    /// List all labs, newest first
    pub async fn list_labs(&self) -> Result<Vec<Lab>> {
        let rows = sqlx::query_as::<_, LabRow>(
            "SELECT * FROM labs ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let vm_rows = sqlx::query_as::<_, VmRow>("SELECT * FROM vms ORDER BY lab_id, position")
            .fetch_all(&self.pool)
            .await?;

        let mut by_lab: HashMap<String, Vec<Vm>> = HashMap::new();
        for vm in vm_rows {
            by_lab.entry(vm.lab_id.clone()).or_default().push(vm.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let vms = by_lab.remove(&row.id).unwrap_or_default();
                row.into_lab(vms)
            })
            .collect())
    }

    /// Delete a lab record. VMs and logs go with it; refused while deploying.
    #[instrument(skip(self))]
    pub async fn delete_lab(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM labs WHERE id = ? AND status != 'deploying'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Either missing (NotFound) or mid-deployment.
            let lab = self.get_lab(id).await?;
            return Err(OrchestratorError::AlreadyDeploying(lab.id));
        }

        info!(lab_id = %id, "Lab deleted");
        Ok(())
    }

    pub async fn get_vm(&self, id: &str) -> Result<Vm> {
        let row = sqlx::query_as::<_, VmRow>("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("VM {}", id)))?;

        Ok(row.into())
    }

    /// List VMs, optionally restricted to one lab
    pub async fn list_vms(&self, lab_id: Option<&str>) -> Result<Vec<Vm>> {
        let mut query = "SELECT vms.* FROM vms JOIN labs ON labs.id = vms.lab_id".to_string();
        if lab_id.is_some() {
            query.push_str(" WHERE vms.lab_id = ?");
        }
        query.push_str(" ORDER BY labs.created_at, vms.position");

        let mut q = sqlx::query_as::<_, VmRow>(&query);
        if let Some(lab_id) = lab_id {
            q = q.bind(lab_id);
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Assign a VM's terminal-access port.
    pub async fn set_vm_endpoint(&self, vm_id: &str, ssh_port: u16) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET ssh_port = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(ssh_port))
            .bind(now_millis())
            .bind(vm_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    OrchestratorError::InvalidInput(format!("Port {} is already assigned", ssh_port))
                }
                _ => e.into(),
            })?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("VM {}", vm_id)));
        }
        Ok(())
    }

    pub async fn set_vm_status(&self, vm_id: &str, status: VmStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_millis())
            .bind(vm_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("VM {}", vm_id)));
        }
        Ok(())
    }

    pub async fn mark_vm_running(&self, vm_id: &str) -> Result<()> {
        self.set_vm_status(vm_id, VmStatus::Running).await
    }

    pub async fn mark_vm_stopped(&self, vm_id: &str) -> Result<()> {
        self.set_vm_status(vm_id, VmStatus::Stopped).await
    }

    /// Terminal ports currently persisted, with their owning lab.
    pub async fn used_ports(&self) -> Result<Vec<(String, u16)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT lab_id, ssh_port FROM vms WHERE ssh_port IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(lab_id, port)| u16::try_from(port).ok().map(|port| (lab_id, port)))
            .collect())
    }

    /// Atomically move a lab into `deploying` and record the pipeline start.
    ///
    /// This is the persisted half of the single-flight guard: the status check and the status
    /// change are one conditional UPDATE, committed together with the start record.
    #[instrument(skip(self))]
    pub async fn begin_deployment(&self, lab_id: &str) -> Result<Lab> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE labs SET status = 'deploying', updated_at = ?
             WHERE id = ? AND status NOT IN ('deploying', 'deleted')",
        )
        .bind(now_millis())
        .bind(lab_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current: Option<(LabStatus,)> =
                sqlx::query_as("SELECT status FROM labs WHERE id = ?")
                    .bind(lab_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match current {
                None => OrchestratorError::NotFound(format!("Lab {}", lab_id)),
                Some((LabStatus::Deploying,)) => {
                    OrchestratorError::AlreadyDeploying(lab_id.to_string())
                }
                Some((status,)) => OrchestratorError::InvalidState(format!(
                    "Lab {} cannot be deployed from status {:?}",
                    lab_id, status
                )),
            });
        }

        insert_log(&mut *tx, lab_id, LogCategory::Pipeline, "Deployment started").await?;
        tx.commit().await?;

        self.get_lab(lab_id).await
    }

    /// Persist provisioning results: endpoints, state blobs, and `running` status per VM.
    #[instrument(skip(self, vms))]
    pub async fn record_provisioned(&self, lab_id: &str, vms: &[ProvisionedVm]) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        // Clear first so ports can move between VMs of the same lab on redeploy.
        sqlx::query("UPDATE vms SET ssh_port = NULL, vnc_port = NULL WHERE lab_id = ?")
            .bind(lab_id)
            .execute(&mut *tx)
            .await?;

        for vm in vms {
            sqlx::query(
                "UPDATE vms
                 SET ssh_port = ?, vnc_port = ?, provision_state = ?, status = ?, updated_at = ?
                 WHERE id = ? AND lab_id = ?",
            )
            .bind(i64::from(vm.ssh_port))
            .bind(vm.vnc_port.map(i64::from))
            .bind(&vm.provision_state)
            .bind(VmStatus::Running)
            .bind(now)
            .bind(&vm.vm_id)
            .bind(lab_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Settle a deployment: set the lab's final status and append the closing record together.
    ///
    /// On `error`, VMs that never got provisioned are marked `error` as well.
    #[instrument(skip(self, message))]
    pub async fn finish_deployment(
        &self,
        lab_id: &str,
        status: LabStatus,
        category: LogCategory,
        message: &str,
    ) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE labs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now)
            .bind(lab_id)
            .execute(&mut *tx)
            .await?;

        if status == LabStatus::Error {
            sqlx::query(
                "UPDATE vms SET status = ?, updated_at = ? WHERE lab_id = ? AND status = 'pending'",
            )
            .bind(VmStatus::Error)
            .bind(now)
            .bind(lab_id)
            .execute(&mut *tx)
            .await?;
        }

        insert_log(&mut *tx, lab_id, category, message).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Status-only update, used when even the closing log record cannot be written.
    pub async fn force_lab_status(&self, lab_id: &str, status: LabStatus) -> Result<()> {
        sqlx::query("UPDATE labs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_millis())
            .bind(lab_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a torn-down lab and all its VMs `deleted`, releasing their ports.
    #[instrument(skip(self))]
    pub async fn mark_destroyed(&self, lab_id: &str) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE vms SET status = ?, ssh_port = NULL, vnc_port = NULL, updated_at = ?
             WHERE lab_id = ?",
        )
        .bind(VmStatus::Deleted)
        .bind(now)
        .bind(lab_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE labs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(LabStatus::Deleted)
            .bind(now)
            .bind(lab_id)
            .execute(&mut *tx)
            .await?;

        insert_log(&mut *tx, lab_id, LogCategory::Pipeline, "Lab destroyed").await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move labs left `deploying` by a previous process into `error`.
    ///
    /// Only valid at startup, before any pipeline of this process can be running.
    #[instrument(skip(self))]
    pub async fn reset_interrupted_deployments(&self) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM labs WHERE status = 'deploying'")
            .fetch_all(&self.pool)
            .await?;

        let mut reset = Vec::with_capacity(ids.len());
        for (id,) in ids {
            warn!(lab_id = %id, "Deployment was interrupted; marking lab as error");
            self.finish_deployment(
                &id,
                LabStatus::Error,
                LogCategory::Error,
                "Deployment interrupted: the service restarted before the pipeline finished",
            )
            .await?;
            reset.push(id);
        }
        Ok(reset)
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct LabRow {
    id: String,
    name: String,
    description: String,
    status: LabStatus,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct VmRow {
    id: String,
    lab_id: String,
    name: String,
    vcpu: i64,
    ram_mb: i64,
    disk_gb: i64,
    os_image: String,
    status: VmStatus,
    ssh_port: Option<i64>,
    vnc_port: Option<i64>,
    config_payload: Option<String>,
    provision_state: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl LabRow {
    fn into_lab(self, vms: Vec<Vm>) -> Lab {
        Lab {
            id: self.id,
            name: self.name,
            description: self.description,
            status: self.status,
            vms,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

impl From<VmRow> for Vm {
    fn from(row: VmRow) -> Self {
        Self {
            id: row.id,
            lab_id: row.lab_id,
            name: row.name,
            vcpu: u32::try_from(row.vcpu).unwrap_or_default(),
            ram_mb: u32::try_from(row.ram_mb).unwrap_or_default(),
            disk_gb: u32::try_from(row.disk_gb).unwrap_or_default(),
            os_image: row.os_image,
            status: row.status,
            ssh_port: row.ssh_port.and_then(|p| u16::try_from(p).ok()),
            vnc_port: row.vnc_port.and_then(|p| u16::try_from(p).ok()),
            config_payload: row.config_payload,
            provision_state: row.provision_state,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    fn vm(name: &str) -> CreateVmRequest {
        CreateVmRequest {
            name: name.to_string(),
            vcpu: 2,
            ram_mb: 2048,
            disk_gb: 20,
            os_image: None,
            config_payload: None,
        }
    }

    fn request(name: &str, vms: Vec<CreateVmRequest>) -> CreateLabRequest {
        CreateLabRequest {
            name: name.to_string(),
            description: None,
            config_payload: None,
            vms,
        }
    }

    #[tokio::test]
    async fn test_create_lab_with_vms() {
        let store = LabStore::new(create_test_db().await);
        let lab = store
            .create_lab(request("networking-101", vec![vm("router"), vm("client")]))
            .await
            .unwrap();

        assert_eq!(lab.status, LabStatus::Created);
        assert_eq!(lab.vms.len(), 2);
        assert_eq!(lab.vms[0].name, "router");
        assert_eq!(lab.vms[1].name, "client");
        assert!(lab.vms.iter().all(|vm| vm.status == VmStatus::Pending));
        assert_eq!(lab.vms[0].os_image, DEFAULT_OS_IMAGE);
    }

    #[tokio::test]
    async fn test_lab_payload_is_copied_to_vms_without_one() {
        let store = LabStore::new(create_test_db().await);
        let mut own = vm("own");
        own.config_payload = Some("- hosts: own\n  tasks: [ping: {}]".to_string());
        let mut req = request("payloads", vec![vm("inherits"), own]);
        req.config_payload = Some("- hosts: all\n  tasks: [ping: {}]".to_string());

        let lab = store.create_lab(req).await.unwrap();
        assert_eq!(
            lab.vms[0].config_payload.as_deref(),
            Some("- hosts: all\n  tasks: [ping: {}]")
        );
        assert_eq!(
            lab.vms[1].config_payload.as_deref(),
            Some("- hosts: own\n  tasks: [ping: {}]")
        );
    }

    #[tokio::test]
    async fn test_create_lab_validation() {
        let store = LabStore::new(create_test_db().await);

        let mut too_big = vm("big");
        too_big.vcpu = 17;
        let cases = vec![
            request("  ", vec![]),
            request("dupes", vec![vm("a"), vm("a")]),
            request("bounds", vec![too_big]),
            request("small-disk", vec![CreateVmRequest { disk_gb: 5, ..vm("d") }]),
            request("small-ram", vec![CreateVmRequest { ram_mb: 256, ..vm("r") }]),
        ];
        for req in cases {
            assert!(matches!(
                store.create_lab(req).await,
                Err(OrchestratorError::InvalidInput(_))
            ));
        }
        assert!(store.list_labs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vm_names_must_fit_domain_names() {
        let store = LabStore::new(create_test_db().await);

        let err = store
            .create_lab(request("clash", vec![vm("web-1"), vm("web_1")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same domain name"), "{}", err);

        for bad in ["db\"x", "a\" { }", "web.1", "x}y"] {
            let err = store
                .create_lab(request("charset", vec![vm(bad)]))
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidInput(_)), "{:?}", bad);
        }
        assert!(store.list_labs().await.unwrap().is_empty());

        let lab = store
            .create_lab(request("ok", vec![vm("web-1"), vm("Web 2"), vm("db_1")]))
            .await
            .unwrap();
        assert_eq!(lab.vms.len(), 3);
    }

    #[tokio::test]
    async fn test_lab_names_are_unique() {
        let store = LabStore::new(create_test_db().await);
        store.create_lab(request("same", vec![])).await.unwrap();
        let err = store.create_lab(request("same", vec![])).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_begin_deployment_is_single_flight() {
        let store = LabStore::new(create_test_db().await);
        let lab = store.create_lab(request("sf", vec![vm("a")])).await.unwrap();

        let deploying = store.begin_deployment(&lab.id).await.unwrap();
        assert_eq!(deploying.status, LabStatus::Deploying);

        assert!(matches!(
            store.begin_deployment(&lab.id).await,
            Err(OrchestratorError::AlreadyDeploying(_))
        ));
        assert!(matches!(
            store.begin_deployment("missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_lab(&lab.id).await,
            Err(OrchestratorError::AlreadyDeploying(_))
        ));

        let logs = store.list_logs(&lab.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].category, LogCategory::Pipeline);
    }

    #[tokio::test]
    async fn test_reset_interrupted_deployments() {
        let store = LabStore::new(create_test_db().await);
        let stuck = store.create_lab(request("stuck", vec![vm("a")])).await.unwrap();
        let idle = store.create_lab(request("idle", vec![])).await.unwrap();
        store.begin_deployment(&stuck.id).await.unwrap();

        let reset = store.reset_interrupted_deployments().await.unwrap();

        assert_eq!(reset, vec![stuck.id.clone()]);
        let stuck = store.get_lab(&stuck.id).await.unwrap();
        assert_eq!(stuck.status, LabStatus::Error);
        assert_eq!(stuck.vms[0].status, VmStatus::Error);
        assert_eq!(store.get_lab(&idle.id).await.unwrap().status, LabStatus::Created);
        let logs = store.list_logs(&stuck.id).await.unwrap();
        assert_eq!(logs.last().unwrap().category, LogCategory::Error);
    }

    #[tokio::test]
    async fn test_vm_setters_and_used_ports() {
        let store = LabStore::new(create_test_db().await);
        let lab = store.create_lab(request("ports", vec![vm("a"), vm("b")])).await.unwrap();
        let (a, b) = (&lab.vms[0], &lab.vms[1]);

        store.set_vm_endpoint(&a.id, 22001).await.unwrap();
        store.mark_vm_running(&a.id).await.unwrap();
        assert!(matches!(
            store.set_vm_endpoint(&b.id, 22001).await,
            Err(OrchestratorError::InvalidInput(_))
        ));
        store.mark_vm_stopped(&b.id).await.unwrap();

        let a = store.get_vm(&a.id).await.unwrap();
        assert_eq!(a.ssh_port, Some(22001));
        assert_eq!(a.status, VmStatus::Running);
        assert_eq!(store.get_vm(&b.id).await.unwrap().status, VmStatus::Stopped);
        assert_eq!(store.used_ports().await.unwrap(), vec![(lab.id.clone(), 22001)]);
        assert!(matches!(
            store.mark_vm_running("missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_lab_cascades() {
        let store = LabStore::new(create_test_db().await);
        let lab = store.create_lab(request("gone", vec![vm("a")])).await.unwrap();
        store
            .append_log(&lab.id, LogCategory::Pipeline, "hello")
            .await
            .unwrap();

        store.delete_lab(&lab.id).await.unwrap();

        assert!(store.list_vms(None).await.unwrap().is_empty());
        let (logs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deployment_logs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(logs, 0);
        assert!(matches!(
            store.delete_lab(&lab.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
