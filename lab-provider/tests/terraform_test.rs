mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fake_tool, lab, vm, RecordingSink};
use lab_ports::{PortPool, PortRange};
use lab_provider::{
    domain_name, LogCategory, ProviderError, Provisioner, TerraformConfig, TerraformProvisioner,
};
use tempfile::TempDir;

const FAKE_TERRAFORM: &str = r#"
echo "$@" >> "$(dirname "$0")/calls.log"
case "$1" in
  output) cat "$(dirname "$0")/outputs.json" ;;
  apply)
    if [ -f "$(dirname "$0")/fail_apply" ]; then
      echo "Error: failed to connect to libvirt"
      exit 1
    fi
    echo "Apply complete! Resources: 5 added, 0 changed, 0 destroyed." ;;
  *) echo "terraform $1 ok" ;;
esac
"#;

struct Fixture {
    tools: TempDir,
    work: TempDir,
    ports: Arc<PortPool>,
    provisioner: TerraformProvisioner,
}

fn fixture() -> Fixture {
    let tools = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let binary = fake_tool(tools.path(), "terraform", FAKE_TERRAFORM);
    let ports = Arc::new(PortPool::new(PortRange::new(22000, 22099).unwrap()));

    let config = TerraformConfig {
        binary: binary.display().to_string(),
        work_root: work.path().to_path_buf(),
        command_timeout: Some(Duration::from_secs(20)),
        ..Default::default()
    };
    let provisioner = TerraformProvisioner::new(config, ports.clone());

    Fixture {
        tools,
        work,
        ports,
        provisioner,
    }
}

fn write_outputs(fixture: &Fixture, lab_id: &str, names: &[&str]) {
    let entries: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let domain = domain_name(lab_id, name);
            format!(
                r#""{d}_vnc_port": {{"value": {p}}}, "{d}_ip": {{"value": "192.168.100.{i}"}}"#,
                d = domain,
                p = 5900 + i,
                i = 10 + i
            )
        })
        .collect();
    std::fs::write(
        fixture.tools.path().join("outputs.json"),
        format!("{{{}}}", entries.join(", ")),
    )
    .unwrap();
}

#[tokio::test]
async fn test_provision_runs_tool_sequence_and_parses_outputs() {
    let fixture = fixture();
    let lab = lab("lab-1", vec![vm("vm-a", "web"), vm("vm-b", "db")]);
    write_outputs(&fixture, "lab-1", &["web", "db"]);
    let sink = RecordingSink::default();

    let vms = fixture.provisioner.provision(&lab, &sink).await.unwrap();

    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].vm_id, "vm-a");
    assert_eq!(vms[0].vnc_port, Some(5900));
    assert_eq!(vms[1].vnc_port, Some(5901));
    assert_ne!(vms[0].ssh_port, vms[1].ssh_port);
    assert_eq!(fixture.ports.owner_of(vms[0].ssh_port).as_deref(), Some("lab-1"));

    let state: serde_json::Value =
        serde_json::from_str(vms[0].provision_state.as_deref().unwrap()).unwrap();
    assert_eq!(state["domain"], "lab_lab_1_web");
    assert_eq!(state["address"], "192.168.100.10");

    let records = sink.records();
    assert_eq!(records.len(), 4, "one record per command");
    assert!(records.iter().all(|(c, _)| *c == LogCategory::Provisioning));
    assert!(records[0].1.contains(" init -input=false"));
    assert!(records[2].1.contains("Apply complete!"));
    assert!(records[3].1.starts_with("Command: "));

    let workspace = fixture.provisioner.workspace_for("lab-1");
    let descriptor = std::fs::read_to_string(workspace.join("main.tf")).unwrap();
    assert!(descriptor.contains("lab_lab_1_db"));

    let calls = std::fs::read_to_string(fixture.tools.path().join("calls.log")).unwrap();
    let verbs: Vec<&str> = calls
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .collect();
    assert_eq!(verbs, vec!["init", "plan", "apply", "output"]);
}

#[tokio::test]
async fn test_apply_failure_carries_output_and_releases_ports() {
    let fixture = fixture();
    std::fs::write(fixture.tools.path().join("fail_apply"), "").unwrap();
    let lab = lab("lab-2", vec![vm("vm-a", "web")]);
    let sink = RecordingSink::default();

    let err = fixture.provisioner.provision(&lab, &sink).await.unwrap_err();

    match err {
        ProviderError::CommandFailed { output, exit_code, .. } => {
            assert!(output.contains("failed to connect to libvirt"));
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("Expected command failure, got {:?}", other),
    }
    assert_eq!(fixture.ports.leased(), 0);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(records[2].1.contains("failed to connect to libvirt"));
}

#[tokio::test]
async fn test_malformed_outputs_fail_provisioning() {
    let fixture = fixture();
    std::fs::write(fixture.tools.path().join("outputs.json"), "not json at all").unwrap();
    let lab = lab("lab-3", vec![vm("vm-a", "web")]);
    let sink = RecordingSink::default();

    let err = fixture.provisioner.provision(&lab, &sink).await.unwrap_err();
    assert!(matches!(err, ProviderError::MalformedOutput(_)));
}

#[tokio::test]
async fn test_existing_ports_are_kept_on_redeploy() {
    let fixture = fixture();
    let mut web = vm("vm-a", "web");
    web.ssh_port = Some(22050);
    let lab = lab("lab-4", vec![web]);
    write_outputs(&fixture, "lab-4", &["web"]);
    let sink = RecordingSink::default();

    let vms = fixture.provisioner.provision(&lab, &sink).await.unwrap();
    assert_eq!(vms[0].ssh_port, 22050);
}

#[tokio::test]
async fn test_teardown_destroys_and_releases() {
    let fixture = fixture();
    let lab = lab("lab-5", vec![vm("vm-a", "web")]);
    write_outputs(&fixture, "lab-5", &["web"]);
    let sink = RecordingSink::default();
    fixture.provisioner.provision(&lab, &sink).await.unwrap();
    assert_eq!(fixture.ports.leased(), 1);

    fixture.provisioner.teardown(&lab, &sink).await.unwrap();

    assert_eq!(fixture.ports.leased(), 0);
    assert!(!fixture.provisioner.workspace_for("lab-5").exists());
    let calls = std::fs::read_to_string(fixture.tools.path().join("calls.log")).unwrap();
    assert!(calls.lines().last().unwrap().starts_with("destroy"));
    assert!(fixture.work.path().exists());
}

#[tokio::test]
async fn test_teardown_without_workspace_is_a_noop() {
    let fixture = fixture();
    let lab = lab("never-deployed", vec![vm("vm-a", "web")]);
    let sink = RecordingSink::default();

    fixture.provisioner.teardown(&lab, &sink).await.unwrap();

    assert!(!fixture.tools.path().join("calls.log").exists());
    assert!(sink.records()[0].1.contains("nothing to destroy"));
}
