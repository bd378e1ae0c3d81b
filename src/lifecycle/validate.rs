//! Input checks applied before anything is persisted or prepared.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;

use crate::lifecycle::errors::VmError;
use crate::settings::PortRange;
use crate::store::{is_name_like, DiskSize, ParseFieldError, PortForward, VmName};

pub fn name(value: &str) -> Result<VmName, VmError> {
    value
        .parse()
        .map_err(|e: ParseFieldError| VmError::validation("name", e.0))
}

pub fn hostname(value: &str) -> Result<String, VmError> {
    if is_name_like(value) {
        Ok(value.to_string())
    } else {
        Err(VmError::validation(
            "hostname",
            format!("'{}' may only contain letters, digits, '_' or '-'", value),
        ))
    }
}

/// `^[a-z_][a-z0-9_-]*$`
pub fn username(value: &str) -> Result<String, VmError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
        _ => false,
    };
    if valid {
        Ok(value.to_string())
    } else {
        Err(VmError::validation(
            "username",
            format!(
                "'{}' must start with a lowercase letter or '_' and contain only lowercase letters, digits, '_' or '-'",
                value
            ),
        ))
    }
}

/// Stored verbatim in a one-line record and piped to the hasher on one line.
pub fn password(value: &str) -> Result<String, VmError> {
    if value.is_empty() {
        return Err(VmError::validation("password", "must not be empty"));
    }
    if value.chars().any(char::is_control) {
        return Err(VmError::validation(
            "password",
            "must not contain control characters",
        ));
    }
    Ok(value.to_string())
}

/// `^[0-9]+$`, non-zero.
pub fn count(field: &'static str, value: &str) -> Result<u32, VmError> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(VmError::validation(
            field,
            format!("'{}' is not a whole number", value),
        ));
    }
    match value.parse::<u32>() {
        Ok(0) => Err(VmError::validation(field, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(_) => Err(VmError::validation(
            field,
            format!("'{}' is too large", value),
        )),
    }
}

pub fn disk_size(value: &str) -> Result<DiskSize, VmError> {
    let size: DiskSize = value
        .parse()
        .map_err(|e: ParseFieldError| VmError::validation("disk size", e.0))?;
    if size.magnitude == 0 {
        return Err(VmError::validation("disk size", "must be greater than zero"));
    }
    Ok(size)
}

pub fn host_port(value: &str, range: PortRange) -> Result<u16, VmError> {
    let port = match value.parse::<u16>() {
        Ok(port) if value.chars().all(|c| c.is_ascii_digit()) => port,
        _ => {
            return Err(VmError::validation(
                "port",
                format!("'{}' is not a port number", value),
            ))
        }
    };
    check_range(port, range)
}

pub fn forward(value: &str, range: PortRange) -> Result<PortForward, VmError> {
    let forward: PortForward = value
        .parse()
        .map_err(|e: ParseFieldError| VmError::validation("port forward", e.0))?;
    check_range(forward.host, range)?;
    Ok(forward)
}

fn check_range(port: u16, range: PortRange) -> Result<u16, VmError> {
    if range.contains(port) {
        Ok(port)
    } else {
        Err(VmError::validation(
            "port",
            format!("{} is outside the allowed range {}", port, range),
        ))
    }
}

/// Host ports of one VM must not repeat.
pub fn distinct_ports(ports: impl IntoIterator<Item = u16>) -> Result<(), VmError> {
    let mut seen = HashSet::new();
    for port in ports {
        if !seen.insert(port) {
            return Err(VmError::validation(
                "port",
                format!("host port {} is used more than once", port),
            ));
        }
    }
    Ok(())
}

/// `claimed` maps every host port of the other stored VMs to its owner.
pub fn unclaimed(
    ports: impl IntoIterator<Item = u16>,
    claimed: &HashMap<u16, VmName>,
) -> Result<(), VmError> {
    for port in ports {
        if let Some(owner) = claimed.get(&port) {
            return Err(VmError::validation(
                "port",
                format!("host port {} is already claimed by VM '{}'", port, owner),
            ));
        }
    }
    Ok(())
}

/// Best effort: the port may still be taken between this check and launch.
pub fn bindable(ports: impl IntoIterator<Item = u16>) -> Result<(), VmError> {
    for port in ports {
        if let Err(e) = TcpListener::bind(("0.0.0.0", port)) {
            return Err(VmError::validation(
                "port",
                format!("host port {} is not available: {}", port, e),
            ));
        }
    }
    Ok(())
}
