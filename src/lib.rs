//! Local lifecycle manager for QEMU virtual machines built from cloud
//! images and cloud-init seeds.
//!
//! One `{name}.conf` record per VM lives in a store directory next to the
//! VM's disk image and seed. Running state is never stored; it is derived
//! from the host's process table on every call.

pub mod image;
pub mod lifecycle;
pub mod process;
pub mod settings;
pub mod store;

pub use image::{Preparer, QemuImagePreparer};
pub use lifecycle::{Lifecycle, VmError};
pub use process::{Controller, QemuController};
pub use settings::Settings;
pub use store::{ConfigStore, VmConfig, VmName};
