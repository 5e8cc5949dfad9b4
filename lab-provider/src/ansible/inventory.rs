use std::fmt::Write as _;

use crate::LabSpec;

pub const INVENTORY_FILE: &str = "inventory.ini";
pub const PLAYBOOK_FILE: &str = "playbook.yml";
pub const CONFIG_FILE: &str = "ansible.cfg";
pub const HOST_GROUP: &str = "lab_vms";

pub const ANSIBLE_CFG: &str = "[defaults]
host_key_checking = False
retry_files_enabled = False
stdout_callback = default
timeout = 30

[ssh_connection]
pipelining = True
";

/// Inventory host alias for a VM name.
fn host_alias(vm_name: &str) -> String {
    vm_name.replace(char::is_whitespace, "_")
}

/// Render the `[lab_vms]` inventory from each VM's terminal endpoint.
///
/// VMs without an assigned terminal port are left out; readiness fails for them before the
/// inventory is ever used. A lab without VMs renders an empty but valid group.
pub fn render_inventory(lab: &LabSpec, host: &str, user: &str) -> String {
    let mut inventory = format!("[{}]\n", HOST_GROUP);
    for vm in &lab.vms {
        if let Some(port) = vm.ssh_port {
            let _ = writeln!(
                inventory,
                "{} ansible_host={} ansible_port={} ansible_user={}",
                host_alias(&vm.name),
                host,
                port,
                user
            );
        }
    }

    let _ = write!(
        inventory,
        "\n[{}:vars]\nansible_ssh_common_args='-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null'\n",
        HOST_GROUP
    );
    inventory
}
