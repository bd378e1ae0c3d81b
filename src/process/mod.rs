// Re-export all public items from submodules
pub mod command;
pub mod controller;
pub mod errors;
pub mod registry;
pub mod stats;

pub use self::command::Acceleration;
pub use self::controller::QemuController;
pub use self::errors::ProcessError;
pub use self::stats::ProcessStats;

use crate::store::VmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    pub pid: u32,
    pub accel: Acceleration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    /// The grace period ran out and the hypervisor was killed.
    Forced,
}

/// Starts, stops and observes the hypervisor process of a VM.
#[allow(async_fn_in_trait)]
pub trait Controller {
    /// Whether a hypervisor for `config` exists. An error means the process
    /// table could not be read and the state is unknown.
    async fn running(&self, config: &VmConfig) -> Result<bool, ProcessError>;

    /// Launch detached. Fails if the process cannot be spawned or exits
    /// right away.
    async fn start(&self, config: &VmConfig) -> Result<Launched, ProcessError>;

    /// Terminate gracefully, then forcibly. Stopping a stopped VM succeeds.
    async fn stop(&self, config: &VmConfig) -> Result<StopOutcome, ProcessError>;

    async fn resource_usage(&self, config: &VmConfig) -> Option<ProcessStats>;
}
