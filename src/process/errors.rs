use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch hypervisor for VM '{name}': {reason}")]
    Launch { name: String, reason: String },

    #[error("failed to signal process {pid} of VM '{name}': {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("VM '{name}' is still running (pids {pids:?})")]
    StillRunning { name: String, pids: Vec<u32> },

    #[error("process discovery failed: {0}")]
    Discovery(String),
}
