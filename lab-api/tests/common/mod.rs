//! Common test utilities and helpers for lab-api tests
//!
//! Builds an application state over an in-memory database with scripted provisioning,
//! configuration and VM control, so the HTTP surface can be exercised without a hypervisor.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use lab_api::{create_app, AccessConfig, AppState};
use lab_orchestrator::test_utils::create_test_db;
use lab_orchestrator::{
    CreateLabRequest, CreateVmRequest, DeploymentOrchestrator, Lab, LabStatus, LabStore,
    PipelineConfig,
};
use lab_ports::{PortPool, PortRange};
use lab_provider::mock::{MockVmControl, ScriptedConfigurator, ScriptedProvisioner};
use lab_tunnel::{SessionRegistry, TunnelConfig, TunnelService};

pub const PLAYBOOK: &str = "- hosts: lab_vms\n  tasks:\n    - ping:\n";

pub async fn create_test_state(provisioner: ScriptedProvisioner) -> AppState {
    let store = LabStore::new(create_test_db().await);
    let orchestrator = DeploymentOrchestrator::new(
        store,
        Arc::new(provisioner),
        Arc::new(ScriptedConfigurator::succeeding()),
        PipelineConfig::default(),
    );
    let tunnel = TunnelService::new(
        SessionRegistry::new(),
        TunnelConfig {
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(1),
            ..TunnelConfig::default()
        },
    );
    let range = PortRange::parse("22000-22099").expect("valid range");

    AppState::new(
        orchestrator,
        tunnel,
        Arc::new(MockVmControl::default()),
        Arc::new(PortPool::new(range)),
        AccessConfig {
            host: "127.0.0.1".to_string(),
            ssh_user: "student".to_string(),
        },
    )
}

pub fn vm_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        vcpu: 2,
        ram_mb: 2048,
        disk_gb: 20,
        os_image: None,
        config_payload: None,
    }
}

pub fn lab_request(name: &str, vms: Vec<CreateVmRequest>) -> CreateLabRequest {
    CreateLabRequest {
        name: name.to_string(),
        description: Some("test lab".to_string()),
        config_payload: None,
        vms,
    }
}

/// Fixture: a lab created directly through the store
pub async fn fixture_lab(state: &AppState, name: &str, vm_names: &[&str]) -> Lab {
    state
        .store
        .create_lab(lab_request(
            name,
            vm_names.iter().map(|n| vm_request(n)).collect(),
        ))
        .await
        .expect("Failed to create fixture lab")
}

/// Poll until a deployment has settled.
pub async fn wait_for_settled(state: &AppState, lab_id: &str) -> Lab {
    for _ in 0..250 {
        let lab = state.store.get_lab(lab_id).await.unwrap();
        if lab.status != LabStatus::Deploying && !state.orchestrator.is_busy(lab_id) {
            return lab;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("lab {} never left deploying", lab_id);
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub state: AppState,
}

impl TestClient {
    pub async fn new() -> Self {
        Self::with_provisioner(ScriptedProvisioner::succeeding()).await
    }

    pub async fn with_provisioner(provisioner: ScriptedProvisioner) -> Self {
        let state = create_test_state(provisioner).await;
        Self {
            app: create_app(state.clone()),
            state,
        }
    }

    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap();
        self.send_request(request).await
    }

    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}
