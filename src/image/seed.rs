//! cloud-init NoCloud documents for the seed volume.

use crate::store::VmConfig;

/// The `user-data` / `meta-data` pair handed to the seed tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDocuments {
    pub user_data: String,
    pub meta_data: String,
}

/// Render the documents for `config`. `password_hash` must already be in
/// crypt(3) form; the clear-text password never reaches the seed.
pub fn render(config: &VmConfig, password_hash: &str, instance_id: &str) -> SeedDocuments {
    let guest = &config.guest;

    let user_data = format!(
        "#cloud-config
hostname: {hostname}
manage_etc_hosts: true
users:
  - name: {username}
    groups: [sudo]
    sudo: \"ALL=(ALL) NOPASSWD:ALL\"
    shell: /bin/bash
    lock_passwd: false
    passwd: {hash}
ssh_pwauth: true
growpart:
  mode: auto
  devices: [\"/\"]
resize_rootfs: true
",
        hostname = yaml_str(&guest.hostname),
        username = yaml_str(&guest.username),
        hash = yaml_str(password_hash),
    );

    let meta_data = format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        yaml_str(instance_id),
        yaml_str(&guest.hostname)
    );

    SeedDocuments {
        user_data,
        meta_data,
    }
}

// JSON string literals are valid YAML double-quoted scalars.
fn yaml_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
