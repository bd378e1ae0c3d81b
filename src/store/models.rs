use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Returned when a single field cannot be parsed from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseFieldError(pub String);

/// `[A-Za-z0-9_-]+`, shared by VM names and guest hostnames.
pub fn is_name_like(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Unique name of a VM within a store. Doubles as the file stem of its
/// record and artifacts, so it never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VmName(String);

impl VmName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VmName {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_name_like(s) {
            Ok(VmName(s.to_string()))
        } else {
            Err(ParseFieldError(format!(
                "invalid VM name '{}': use letters, digits, '_' or '-'",
                s
            )))
        }
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VmName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeUnit {
    M,
    G,
}

/// Disk capacity as entered by the operator, e.g. `20G` or `512M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSize {
    pub magnitude: u64,
    pub unit: SizeUnit,
}

impl DiskSize {
    pub fn gib(magnitude: u64) -> Self {
        DiskSize {
            magnitude,
            unit: SizeUnit::G,
        }
    }

    pub fn as_mib(&self) -> u64 {
        match self.unit {
            SizeUnit::M => self.magnitude,
            SizeUnit::G => self.magnitude.saturating_mul(1024),
        }
    }

    pub fn as_bytes(&self) -> u64 {
        self.as_mib().saturating_mul(1024 * 1024)
    }
}

impl FromStr for DiskSize {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ParseFieldError(format!(
                "invalid size '{}': expected a number followed by G or M (e.g. 20G)",
                s
            ))
        };

        let unit = match s.chars().last() {
            Some('G') | Some('g') => SizeUnit::G,
            Some('M') | Some('m') => SizeUnit::M,
            _ => return Err(invalid()),
        };
        let digits = &s[..s.len() - 1];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let magnitude = digits.parse::<u64>().map_err(|_| invalid())?;

        Ok(DiskSize { magnitude, unit })
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            SizeUnit::M => 'M',
            SizeUnit::G => 'G',
        };
        write!(f, "{}{}", self.magnitude, unit)
    }
}

/// Extra TCP forward from a host port to a guest port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

impl FromStr for PortForward {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ParseFieldError(format!(
                "invalid port forward '{}': expected HOST:GUEST (e.g. 8080:80)",
                s
            ))
        };

        let (host, guest) = s.trim().split_once(':').ok_or_else(invalid)?;
        let host = host.parse::<u16>().map_err(|_| invalid())?;
        let guest = guest.parse::<u16>().map_err(|_| invalid())?;
        if guest == 0 {
            return Err(invalid());
        }

        Ok(PortForward { host, guest })
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsDescriptor {
    pub family: String,
    pub codename: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestIdentity {
    pub hostname: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub disk_size: DiskSize,
    pub memory_mb: u32,
    pub cpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub ssh_port: u16,
    pub forwards: Vec<PortForward>,
}

impl Network {
    /// SSH port first, then every forward's host side.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.ssh_port).chain(self.forwards.iter().map(|f| f.host))
    }
}

/// Durable files a VM needs to boot. Always derived from the VM name by
/// [`crate::store::ConfigStore::artifacts_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    pub image: PathBuf,
    pub seed: PathBuf,
}

/// Declarative description of one VM, as persisted in its `.conf` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmConfig {
    pub name: VmName,
    pub os: OsDescriptor,
    pub guest: GuestIdentity,
    pub resources: Resources,
    pub network: Network,
    pub gui: bool,
    pub artifacts: Artifacts,
    pub created: String,
}
