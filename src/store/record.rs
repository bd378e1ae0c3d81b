//! Flat `KEY="value"` encoding of a [`VmConfig`], one file per VM.
//!
//! Values are double-quoted with `\`, `"`, `$`, `` ` `` and newlines escaped,
//! so the file stays readable by a POSIX shell.

use log::warn;
use std::collections::HashMap;
use std::path::Path;

use crate::store::errors::StoreError;
use crate::store::models::{
    Artifacts, DiskSize, GuestIdentity, Network, OsDescriptor, PortForward, Resources, VmConfig,
    VmName,
};

pub const VM_NAME: &str = "VM_NAME";
pub const OS_TYPE: &str = "OS_TYPE";
pub const CODENAME: &str = "CODENAME";
pub const IMG_URL: &str = "IMG_URL";
pub const HOSTNAME: &str = "HOSTNAME";
pub const USERNAME: &str = "USERNAME";
pub const PASSWORD: &str = "PASSWORD";
pub const DISK_SIZE: &str = "DISK_SIZE";
pub const MEMORY: &str = "MEMORY";
pub const CPUS: &str = "CPUS";
pub const SSH_PORT: &str = "SSH_PORT";
pub const GUI_MODE: &str = "GUI_MODE";
pub const PORT_FORWARDS: &str = "PORT_FORWARDS";
pub const IMG_FILE: &str = "IMG_FILE";
pub const SEED_FILE: &str = "SEED_FILE";
pub const CREATED: &str = "CREATED";

/// Serialize a configuration into record text.
pub fn render(config: &VmConfig) -> String {
    let forwards = config
        .network
        .forwards
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let fields: [(&str, String); 16] = [
        (VM_NAME, config.name.to_string()),
        (OS_TYPE, config.os.family.clone()),
        (CODENAME, config.os.codename.clone()),
        (IMG_URL, config.os.image_url.clone()),
        (HOSTNAME, config.guest.hostname.clone()),
        (USERNAME, config.guest.username.clone()),
        (PASSWORD, config.guest.password.clone()),
        (DISK_SIZE, config.resources.disk_size.to_string()),
        (MEMORY, config.resources.memory_mb.to_string()),
        (CPUS, config.resources.cpus.to_string()),
        (SSH_PORT, config.network.ssh_port.to_string()),
        (GUI_MODE, config.gui.to_string()),
        (PORT_FORWARDS, forwards),
        (IMG_FILE, config.artifacts.image.display().to_string()),
        (SEED_FILE, config.artifacts.seed.display().to_string()),
        (CREATED, config.created.clone()),
    ];

    let mut out = format!("# cloudvm configuration for {}\n", config.name);
    for (key, value) in fields.iter() {
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value));
        out.push_str("\"\n");
    }
    out
}

/// Parse record text for `name`. Artifact paths always come from `artifacts`;
/// differing IMG_FILE/SEED_FILE values are reported and ignored.
pub fn parse(name: &VmName, text: &str, artifacts: Artifacts) -> Result<VmConfig, StoreError> {
    let fields = Fields::read(name, text)?;

    if fields.get(VM_NAME)? != name.as_str() {
        return Err(fields.malformed(format!(
            "{} is '{}' but the record is named '{}'",
            VM_NAME,
            fields.get(VM_NAME)?,
            name
        )));
    }

    let disk_size = fields
        .get(DISK_SIZE)?
        .parse::<DiskSize>()
        .map_err(|e| fields.malformed(e.to_string()))?;
    let ssh_port = fields
        .get(SSH_PORT)?
        .parse::<u16>()
        .map_err(|_| fields.malformed(format!("{} is not a port", SSH_PORT)))?;
    let gui = parse_bool(fields.get(GUI_MODE)?)
        .ok_or_else(|| fields.malformed(format!("{} is not a boolean", GUI_MODE)))?;
    let forwards = fields
        .get(PORT_FORWARDS)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<PortForward>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| fields.malformed(e.to_string()))?;

    warn_on_moved_artifact(name, IMG_FILE, fields.get(IMG_FILE)?, &artifacts.image);
    warn_on_moved_artifact(name, SEED_FILE, fields.get(SEED_FILE)?, &artifacts.seed);

    Ok(VmConfig {
        name: name.clone(),
        os: OsDescriptor {
            family: fields.owned(OS_TYPE)?,
            codename: fields.owned(CODENAME)?,
            image_url: fields.owned(IMG_URL)?,
        },
        guest: GuestIdentity {
            hostname: fields.owned(HOSTNAME)?,
            username: fields.owned(USERNAME)?,
            password: fields.owned(PASSWORD)?,
        },
        resources: Resources {
            disk_size,
            memory_mb: fields.number(MEMORY)?,
            cpus: fields.number(CPUS)?,
        },
        network: Network { ssh_port, forwards },
        gui,
        artifacts,
        created: fields.owned(CREATED)?,
    })
}

struct Fields<'a> {
    name: &'a VmName,
    values: HashMap<String, String>,
}

impl<'a> Fields<'a> {
    fn read(name: &'a VmName, text: &str) -> Result<Self, StoreError> {
        let mut fields = Fields {
            name,
            values: HashMap::new(),
        };
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                return Err(fields.malformed(format!("line {} is not KEY=value", lineno + 1)));
            };
            fields
                .values
                .insert(key.trim().to_string(), unquote(raw.trim()));
        }
        Ok(fields)
    }

    fn malformed(&self, reason: String) -> StoreError {
        StoreError::Malformed {
            identity: self.name.to_string(),
            reason,
        }
    }

    fn get(&self, key: &str) -> Result<&str, StoreError> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| self.malformed(format!("missing key {}", key)))
    }

    fn owned(&self, key: &str) -> Result<String, StoreError> {
        self.get(key).map(str::to_string)
    }

    fn number(&self, key: &str) -> Result<u32, StoreError> {
        self.get(key)?
            .parse::<u32>()
            .map_err(|_| self.malformed(format!("{} is not a number", key)))
    }
}

fn warn_on_moved_artifact(name: &VmName, key: &str, recorded: &str, derived: &Path) {
    if !recorded.is_empty() && Path::new(recorded) != derived {
        warn!(
            "{} for VM {} points to {}; using {} instead",
            key,
            name,
            recorded,
            derived.display()
        );
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" | "" => Some(false),
        _ => None,
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn unquote(raw: &str) -> String {
    let inner = match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner,
        None => return raw.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
