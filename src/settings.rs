use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::store::ParseFieldError;

const DEFAULT_LAUNCH_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inclusive range of host ports an operator may forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            start: 1024,
            end: 65535,
        }
    }
}

impl FromStr for PortRange {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseFieldError(format!("invalid port range '{}': expected LOW-HIGH", s));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u16>().map_err(|_| invalid())?;
        if start == 0 || start > end {
            return Err(invalid());
        }
        Ok(PortRange { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// External programs the manager drives.
#[derive(Debug, Clone)]
pub struct Tools {
    pub qemu: PathBuf,
    pub qemu_img: PathBuf,
    pub seed_tool: PathBuf,
    pub passwd_tool: PathBuf,
    /// Process lookup by command line.
    pub pgrep: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            qemu: PathBuf::from("qemu-system-x86_64"),
            qemu_img: PathBuf::from("qemu-img"),
            seed_tool: PathBuf::from("cloud-localds"),
            passwd_tool: PathBuf::from("openssl"),
            pgrep: PathBuf::from("pgrep"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store_root: PathBuf,
    pub tools: Tools,
    pub port_range: PortRange,
    /// Try binding each requested host port before accepting it.
    pub probe_host_ports: bool,
    /// Wait between launching the hypervisor and confirming it is alive.
    pub launch_grace: Duration,
    /// How long a stopping VM gets before it is killed.
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Settings {
            store_root: store_root.into(),
            tools: Tools::default(),
            port_range: PortRange::default(),
            probe_host_ports: true,
            launch_grace: DEFAULT_LAUNCH_GRACE,
            stop_grace: DEFAULT_STOP_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// `$HOME/.cloudvm/vms`, or `None` when HOME is unset.
    pub fn default_store_root() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".cloudvm").join("vms"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses_and_checks_bounds() {
        let range: PortRange = "2000-3000".parse().unwrap();
        assert!(range.contains(2000));
        assert!(range.contains(3000));
        assert!(!range.contains(1999));
        assert_eq!(range.to_string(), "2000-3000");
    }

    #[test]
    fn port_range_rejects_inverted_or_zero_bounds() {
        assert!("3000-2000".parse::<PortRange>().is_err());
        assert!("0-100".parse::<PortRange>().is_err());
        assert!("1024".parse::<PortRange>().is_err());
    }

    #[test]
    fn default_range_excludes_privileged_ports() {
        let range = PortRange::default();
        assert!(!range.contains(80));
        assert!(range.contains(2222));
    }
}
