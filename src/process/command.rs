//! Hypervisor command line for a VM.
//!
//! ```text
//! qemu-system-x86_64 -name web1 -enable-kvm -cpu host -m 2048 -smp 2
//!     -drive file=/vms/web1.qcow2,if=virtio,format=qcow2
//!     -drive file=/vms/web1-seed.iso,if=virtio,format=raw,readonly=on
//!     -netdev user,id=net0,hostfwd=tcp::2222-:22 -device virtio-net-pci,netdev=net0
//!     -netdev user,id=net1,hostfwd=tcp::8080-:80 -device virtio-net-pci,netdev=net1
//!     -display none -device virtio-rng-pci -device virtio-balloon-pci
//! ```

use std::fs::OpenOptions;
use std::path::Path;

use crate::store::VmConfig;

const GUEST_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    Kvm,
    Hvf,
    Software,
}

impl Acceleration {
    /// KVM when `/dev/kvm` can be opened read-write, HVF on macOS,
    /// plain emulation otherwise.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux")
            && OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/kvm")
                .is_ok()
        {
            Acceleration::Kvm
        } else if cfg!(target_os = "macos") {
            Acceleration::Hvf
        } else {
            Acceleration::Software
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            Acceleration::Kvm => &["-enable-kvm", "-cpu", "host"],
            Acceleration::Hvf => &["-accel", "hvf", "-cpu", "host"],
            Acceleration::Software => &[],
        }
    }
}

/// Substring of the hypervisor command line that identifies `config`'s VM.
pub fn correlation_pattern(config: &VmConfig) -> String {
    format!("file={},", drive_path(&config.artifacts.image))
}

pub fn build_args(config: &VmConfig, accel: Acceleration) -> Vec<String> {
    let mut args: Vec<String> = vec!["-name".into(), config.name.to_string()];
    args.extend(accel.args().iter().map(|a| a.to_string()));

    args.push("-m".into());
    args.push(config.resources.memory_mb.to_string());
    args.push("-smp".into());
    args.push(config.resources.cpus.to_string());

    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=qcow2",
        drive_path(&config.artifacts.image)
    ));
    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=raw,readonly=on",
        drive_path(&config.artifacts.seed)
    ));

    // Each forward gets its own user-mode NIC; ids must not collide.
    let forwards = std::iter::once((config.network.ssh_port, GUEST_SSH_PORT)).chain(
        config
            .network
            .forwards
            .iter()
            .map(|f| (f.host, f.guest)),
    );
    for (index, (host, guest)) in forwards.enumerate() {
        args.push("-netdev".into());
        args.push(format!("user,id=net{},hostfwd=tcp::{}-:{}", index, host, guest));
        args.push("-device".into());
        args.push(format!("virtio-net-pci,netdev=net{}", index));
    }

    if config.gui {
        args.extend(["-vga", "virtio", "-display", gui_backend()].map(String::from));
    } else {
        args.extend(["-display", "none"].map(String::from));
    }

    args.extend(["-device", "virtio-rng-pci", "-device", "virtio-balloon-pci"].map(String::from));
    args
}

fn gui_backend() -> &'static str {
    if cfg!(target_os = "macos") {
        "cocoa"
    } else {
        "gtk"
    }
}

// QEMU option values treat ',' as a separator; a literal comma is doubled.
fn drive_path(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}
