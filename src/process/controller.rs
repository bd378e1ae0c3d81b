use backon::{ConstantBuilder, Retryable};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::process::command::{self, Acceleration};
use crate::process::errors::ProcessError;
use crate::process::registry::ProcessRegistry;
use crate::process::stats::{self, ProcessStats};
use crate::process::{Controller, Launched, StopOutcome};
use crate::settings::Settings;
use crate::store::VmConfig;

/// A hypervisor that dies within this window never came up.
const EXIT_WINDOW: Duration = Duration::from_millis(500);

/// Drives `qemu-system-*` processes. Launched hypervisors are detached from
/// the manager and outlive it; later invocations find them again through
/// their command line.
#[derive(Debug)]
pub struct QemuController {
    qemu: PathBuf,
    pgrep: PathBuf,
    registry: ProcessRegistry,
    stop_grace: Duration,
    poll_interval: Duration,
}

impl QemuController {
    pub fn new(settings: &Settings) -> Self {
        Self {
            qemu: settings.tools.qemu.clone(),
            pgrep: settings.tools.pgrep.clone(),
            registry: ProcessRegistry::default(),
            stop_grace: settings.stop_grace,
            poll_interval: settings.poll_interval,
        }
    }

    /// The registered PID of `config`, while its command line still names
    /// this VM's image.
    async fn registered(&self, config: &VmConfig) -> Option<u32> {
        let pid = self.registry.get(&config.name)?;
        match command_line(pid).await {
            Some(cmdline) if cmdline.contains(&command::correlation_pattern(config)) => Some(pid),
            _ => {
                debug!("Registered PID {} for {} is gone", pid, config.name);
                self.registry.forget(&config.name);
                None
            }
        }
    }

    /// Every process serving `config`: the registered PID plus whatever
    /// `pgrep` matches.
    async fn discover(&self, config: &VmConfig) -> Result<Vec<u32>, ProcessError> {
        let mut pids: Vec<u32> = self.registered(config).await.into_iter().collect();
        for pid in pgrep(&self.pgrep, &command::correlation_pattern(config)).await? {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    fn signal_all(
        &self,
        config: &VmConfig,
        pids: &[u32],
        sig: Signal,
    ) -> Result<(), ProcessError> {
        for &pid in pids {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match signal::kill(Pid::from_raw(raw), sig) {
                Ok(()) => debug!("Sent {:?} to PID {}", sig, pid),
                Err(Errno::ESRCH) => debug!("PID {} already exited", pid),
                Err(source) => {
                    return Err(ProcessError::Signal {
                        name: config.name.to_string(),
                        pid,
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Poll until no process for `config` remains or the grace period ends.
    async fn wait_for_exit(&self, config: &VmConfig) -> Result<(), ProcessError> {
        let polls = (self.stop_grace.as_millis() / self.poll_interval.as_millis().max(1)).max(1);

        (|| async move {
            let left = self.discover(config).await?;
            if left.is_empty() {
                Ok(())
            } else {
                Err(ProcessError::StillRunning {
                    name: config.name.to_string(),
                    pids: left,
                })
            }
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.poll_interval)
                .with_max_times(polls as usize),
        )
        .sleep(tokio::time::sleep)
        .when(|e| matches!(e, ProcessError::StillRunning { .. }))
        .notify(|_, dur| debug!("{} still running, checking again in {:?}", config.name, dur))
        .await
    }
}

impl Controller for QemuController {
    async fn running(&self, config: &VmConfig) -> Result<bool, ProcessError> {
        if self.registered(config).await.is_some() {
            return Ok(true);
        }
        Ok(!pgrep(&self.pgrep, &command::correlation_pattern(config))
            .await?
            .is_empty())
    }

    async fn start(&self, config: &VmConfig) -> Result<Launched, ProcessError> {
        let launch_error = |reason: String| ProcessError::Launch {
            name: config.name.to_string(),
            reason,
        };

        let accel = Acceleration::detect();
        let args = command::build_args(config, accel);
        info!("Launching {} ({:?} acceleration)", config.name, accel);
        debug!("{} {}", self.qemu.display(), args.join(" "));

        // Anonymous file: readable if the hypervisor dies at once, gone with
        // the last descriptor otherwise.
        let mut stderr_log =
            tempfile::tempfile().map_err(|e| launch_error(format!("stderr capture: {}", e)))?;
        let stderr_handle = stderr_log
            .try_clone()
            .map_err(|e| launch_error(format!("stderr capture: {}", e)))?;

        let mut std_cmd = std::process::Command::new(&self.qemu);
        std_cmd
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: a Ctrl-C aimed at the manager must not
            // reach the guest.
            std_cmd.process_group(0);
        }

        let mut child = Command::from(std_cmd)
            .spawn()
            .map_err(|e| launch_error(format!("cannot run {}: {}", self.qemu.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_error("process exited before reporting a PID".into()))?;

        match tokio::time::timeout(EXIT_WINDOW, child.wait()).await {
            Err(_still_running) => {
                self.registry.record(&config.name, pid);
                info!("{} started with PID: {}", config.name, pid);
                Ok(Launched { pid, accel })
            }
            Ok(Ok(status)) => {
                let mut diagnostics = String::new();
                let _ = stderr_log
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| stderr_log.read_to_string(&mut diagnostics));
                Err(launch_error(format!(
                    "exited immediately with {}: {}",
                    status,
                    diagnostics.trim()
                )))
            }
            Ok(Err(e)) => Err(launch_error(format!("wait failed: {}", e))),
        }
    }

    async fn stop(&self, config: &VmConfig) -> Result<StopOutcome, ProcessError> {
        let pids = self.discover(config).await?;
        if pids.is_empty() {
            info!("{} is not running", config.name);
            self.registry.forget(&config.name);
            return Ok(StopOutcome::AlreadyStopped);
        }

        info!("Stopping {} (PIDs {:?})", config.name, pids);
        self.signal_all(config, &pids, Signal::SIGTERM)?;

        match self.wait_for_exit(config).await {
            Ok(()) => {
                self.registry.forget(&config.name);
                info!("{} stopped", config.name);
                Ok(StopOutcome::Graceful)
            }
            Err(ProcessError::StillRunning { pids, .. }) => {
                warn!(
                    "{} did not exit within {:?}, killing PIDs {:?}",
                    config.name, self.stop_grace, pids
                );
                self.signal_all(config, &pids, Signal::SIGKILL)?;
                tokio::time::sleep(self.poll_interval).await;

                let left = self.discover(config).await?;
                if !left.is_empty() {
                    return Err(ProcessError::StillRunning {
                        name: config.name.to_string(),
                        pids: left,
                    });
                }
                self.registry.forget(&config.name);
                info!("{} killed", config.name);
                Ok(StopOutcome::Forced)
            }
            Err(e) => Err(e),
        }
    }

    async fn resource_usage(&self, config: &VmConfig) -> Option<ProcessStats> {
        let pid = match self.discover(config).await {
            Ok(pids) => pids.first().copied()?,
            Err(e) => {
                warn!("Cannot locate {}: {}", config.name, e);
                return None;
            }
        };
        Some(stats::collect(pid, &config.artifacts.image).await)
    }
}

/// `pgrep -f` exits 1 when nothing matches; only other failures are errors.
async fn pgrep(program: &Path, pattern: &str) -> Result<Vec<u32>, ProcessError> {
    let output = Command::new(program)
        .arg("-f")
        .arg("--")
        .arg(escape_ere(pattern))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            ProcessError::Discovery(format!("cannot run {}: {}", program.display(), e))
        })?;

    match output.status.code() {
        Some(0) | Some(1) => Ok(parse_pids(&String::from_utf8_lossy(&output.stdout))),
        _ => Err(ProcessError::Discovery(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

async fn command_line(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .args(["-o", "command=", "-p"])
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!line.is_empty()).then_some(line)
}

fn parse_pids(stdout: &str) -> Vec<u32> {
    let own = std::process::id();
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own)
        .collect()
}

fn escape_ere(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pgrep_pattern_escapes_regex_metacharacters() {
        assert_eq!(
            escape_ere("file=/home/a.b/vms (1)/web1.qcow2,"),
            "file=/home/a\\.b/vms \\(1\\)/web1\\.qcow2,"
        );
    }

    #[test]
    fn pid_list_skips_noise_and_our_own_pid() {
        let own = std::process::id();
        let stdout = format!("123\n\n{}\n  456 \nnot-a-pid\n", own);
        assert_eq!(parse_pids(&stdout), vec![123, 456]);
    }
}
