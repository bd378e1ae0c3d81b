use serde::Serialize;

use crate::store::OsDescriptor;

pub const DEFAULT_OS: &str = "ubuntu-22.04";
pub const CUSTOM_OS: &str = "custom";

const CUSTOM_DEFAULT_USER: &str = "cloud";
const CUSTOM_DEFAULT_PASSWORD: &str = "cloud";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OsEntry {
    pub key: &'static str,
    pub family: &'static str,
    pub version: &'static str,
    pub codename: &'static str,
    pub image_url: &'static str,
    pub default_username: &'static str,
    pub default_password: &'static str,
}

pub const CATALOG: &[OsEntry] = &[
    OsEntry {
        key: "ubuntu-20.04",
        family: "ubuntu",
        version: "20.04",
        codename: "focal",
        image_url: "https://cloud-images.ubuntu.com/focal/current/focal-server-cloudimg-amd64.img",
        default_username: "ubuntu",
        default_password: "ubuntu",
    },
    OsEntry {
        key: "ubuntu-22.04",
        family: "ubuntu",
        version: "22.04",
        codename: "jammy",
        image_url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
        default_username: "ubuntu",
        default_password: "ubuntu",
    },
    OsEntry {
        key: "ubuntu-24.04",
        family: "ubuntu",
        version: "24.04",
        codename: "noble",
        image_url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
        default_username: "ubuntu",
        default_password: "ubuntu",
    },
    OsEntry {
        key: "debian-11",
        family: "debian",
        version: "11",
        codename: "bullseye",
        image_url: "https://cloud.debian.org/images/cloud/bullseye/latest/debian-11-generic-amd64.qcow2",
        default_username: "debian",
        default_password: "debian",
    },
    OsEntry {
        key: "debian-12",
        family: "debian",
        version: "12",
        codename: "bookworm",
        image_url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
        default_username: "debian",
        default_password: "debian",
    },
];

/// Find an entry by key (`ubuntu-22.04`) or codename (`jammy`).
pub fn lookup(selector: &str) -> Option<&'static OsEntry> {
    CATALOG.iter().find(|entry| {
        entry.key.eq_ignore_ascii_case(selector) || entry.codename.eq_ignore_ascii_case(selector)
    })
}

/// What a create request resolved to: the descriptor to store plus the
/// credentials to fall back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOs {
    pub descriptor: OsDescriptor,
    pub default_username: &'static str,
    pub default_password: &'static str,
}

impl From<&OsEntry> for ResolvedOs {
    fn from(entry: &OsEntry) -> Self {
        ResolvedOs {
            descriptor: OsDescriptor {
                family: entry.family.to_string(),
                codename: entry.codename.to_string(),
                image_url: entry.image_url.to_string(),
            },
            default_username: entry.default_username,
            default_password: entry.default_password,
        }
    }
}

/// A custom source has no codename; the URL is used as given.
pub fn custom(image_url: &str) -> ResolvedOs {
    ResolvedOs {
        descriptor: OsDescriptor {
            family: CUSTOM_OS.to_string(),
            codename: CUSTOM_OS.to_string(),
            image_url: image_url.to_string(),
        },
        default_username: CUSTOM_DEFAULT_USER,
        default_password: CUSTOM_DEFAULT_PASSWORD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_os_is_in_the_catalog() {
        let entry = lookup(DEFAULT_OS).unwrap();
        assert_eq!(entry.codename, "jammy");
        assert_eq!(entry.default_username, "ubuntu");
    }

    #[test]
    fn lookup_accepts_codenames_in_any_case() {
        assert_eq!(lookup("Bookworm").unwrap().key, "debian-12");
        assert!(lookup("windows-11").is_none());
    }

    #[test]
    fn image_urls_mention_their_codename() {
        for entry in CATALOG {
            assert!(entry.image_url.contains(entry.codename), "{}", entry.key);
        }
    }
}
