//! Rendering of the per-lab Terraform descriptor.

// Standard library
use std::collections::BTreeMap;
use std::sync::OnceLock;

// External crates
use serde::Serialize;
use tera::{Context as TeraContext, Tera};

// Internal imports
use super::TerraformConfig;
use crate::{domain_name, LabSpec, Result};

pub const DESCRIPTOR_FILE: &str = "main.tf";

/// Image used for any OS identifier missing from [`OS_IMAGES`].
pub const DEFAULT_OS_IMAGE: &str = "ubuntu-22.04";

/// Known OS identifiers and the cloud image each boots from.
pub const OS_IMAGES: &[(&str, &str)] = &[
    (
        "ubuntu-22.04",
        "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
    ),
    (
        "ubuntu-20.04",
        "https://cloud-images.ubuntu.com/focal/current/focal-server-cloudimg-amd64.img",
    ),
    (
        "centos-stream-9",
        "https://cloud.centos.org/centos/9-stream/x86_64/images/CentOS-Stream-GenericCloud-9-latest.x86_64.qcow2",
    ),
    (
        "debian-12",
        "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
    ),
    (
        "fedora-39",
        "https://download.fedoraproject.org/pub/fedora/linux/releases/39/Cloud/x86_64/images/Fedora-Cloud-Base-39-1.5.x86_64.qcow2",
    ),
];

static DESCRIPTOR_TERA: OnceLock<Tera> = OnceLock::new();

fn descriptor_tera() -> &'static Tera {
    DESCRIPTOR_TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template(DESCRIPTOR_FILE, include_str!("main.tf.j2"))
            .expect("Failed to add Terraform descriptor template");
        tera
    })
}

/// Resolve an OS identifier to its image source. Overrides win over the built-in table, and
/// unknown identifiers fall back to [`DEFAULT_OS_IMAGE`].
pub fn resolve_image(os_image: &str, overrides: &BTreeMap<String, String>) -> String {
    if let Some(url) = overrides.get(os_image) {
        return url.clone();
    }
    let lookup = |id: &str| {
        OS_IMAGES
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, url)| (*url).to_string())
    };
    lookup(os_image)
        .or_else(|| overrides.get(DEFAULT_OS_IMAGE).cloned())
        .or_else(|| lookup(DEFAULT_OS_IMAGE))
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct DescriptorVm {
    domain: String,
    hostname: String,
    image_url: String,
    vcpu: u32,
    ram_mb: u32,
    disk_bytes: u64,
    ssh_port: u16,
}

fn hostname(vm_name: &str) -> String {
    vm_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Render the descriptor for `lab`. `ssh_ports` maps VM id to its leased terminal port.
///
/// Output depends only on the inputs, so re-rendering an unchanged lab is a no-op for the tool.
pub fn render_descriptor(
    config: &TerraformConfig,
    lab: &LabSpec,
    ssh_ports: &BTreeMap<String, u16>,
) -> Result<String> {
    let vms: Vec<DescriptorVm> = lab
        .vms
        .iter()
        .map(|vm| DescriptorVm {
            domain: domain_name(&lab.id, &vm.name),
            hostname: hostname(&vm.name),
            image_url: resolve_image(&vm.os_image, &config.image_overrides),
            vcpu: vm.vcpu,
            ram_mb: vm.ram_mb,
            disk_bytes: u64::from(vm.disk_gb) * 1024 * 1024 * 1024,
            ssh_port: ssh_ports.get(&vm.id).copied().unwrap_or(22),
        })
        .collect();

    let mut context = TeraContext::new();
    context.insert("libvirt_uri", &config.libvirt_uri);
    context.insert("storage_pool", &config.storage_pool);
    context.insert("network_cidr", &config.network_cidr);
    context.insert(
        "network_name",
        &format!("lab_{}_net", lab.id).replace(['-', ' '], "_"),
    );
    context.insert("vms", &vms);

    Ok(descriptor_tera().render(DESCRIPTOR_FILE, &context)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmSpec;

    fn lab(os_image: &str) -> LabSpec {
        LabSpec {
            id: "ab-12".to_string(),
            name: "demo".to_string(),
            vms: vec![VmSpec {
                id: "vm-1".to_string(),
                name: "web 1".to_string(),
                vcpu: 2,
                ram_mb: 2048,
                disk_gb: 20,
                os_image: os_image.to_string(),
                config_payload: None,
                ssh_port: None,
                vnc_port: None,
                provision_state: None,
            }],
        }
    }

    #[test]
    fn test_unknown_image_falls_back_to_default() {
        let none = BTreeMap::new();
        assert_eq!(
            resolve_image("plan9", &none),
            resolve_image(DEFAULT_OS_IMAGE, &none)
        );
        assert!(resolve_image("debian-12", &none).contains("debian-12"));
    }

    #[test]
    fn test_image_overrides_extend_the_table() {
        let mut overrides = BTreeMap::new();
        overrides.insert("alpine-3.19".to_string(), "file:///images/alpine.qcow2".to_string());
        assert_eq!(
            resolve_image("alpine-3.19", &overrides),
            "file:///images/alpine.qcow2"
        );
    }

    #[test]
    fn test_descriptor_contains_vm_resources() {
        let mut ports = BTreeMap::new();
        ports.insert("vm-1".to_string(), 22042);

        let rendered = render_descriptor(&TerraformConfig::default(), &lab("ubuntu-22.04"), &ports)
            .unwrap();

        assert!(rendered.contains("resource \"libvirt_domain\" \"lab_ab_12_web_1\""));
        assert!(rendered.contains("memory    = 2048"));
        assert!(rendered.contains("vcpu      = 2"));
        assert!(rendered.contains(&format!("size           = {}", 20u64 * 1024 * 1024 * 1024)));
        assert!(rendered.contains("Port 22042"));
        assert!(rendered.contains("hostname: web-1"));
        assert!(rendered.contains("output \"lab_ab_12_web_1_vnc_port\""));
        assert!(rendered.contains("name      = \"lab_ab_12_net\""));
    }

    #[test]
    fn test_descriptor_is_deterministic() {
        let ports = BTreeMap::new();
        let config = TerraformConfig::default();
        let first = render_descriptor(&config, &lab("fedora-39"), &ports).unwrap();
        let second = render_descriptor(&config, &lab("fedora-39"), &ports).unwrap();
        assert_eq!(first, second);
    }
}
