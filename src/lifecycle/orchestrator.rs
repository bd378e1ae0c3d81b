use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::image::Preparer;
use crate::lifecycle::catalog::{self, ResolvedOs};
use crate::lifecycle::errors::VmError;
use crate::lifecycle::validate;
use crate::process::{Controller, ProcessStats, StopOutcome};
use crate::settings::{PortRange, Settings};
use crate::store::{
    ConfigStore, GuestIdentity, Network, PortForward, Resources, StoreError, VmConfig, VmName,
};

pub const DEFAULT_DISK_SIZE: &str = "20G";
pub const DEFAULT_MEMORY_MB: &str = "2048";
pub const DEFAULT_CPUS: &str = "2";
pub const DEFAULT_SSH_PORT: &str = "2222";

const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Derived on demand from the process table, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Running,
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::Running => f.write_str("running"),
            RuntimeState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Operator input for a new VM, as typed. Unset fields take defaults from
/// the OS catalog or the constants above.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    /// Catalog key or codename, or `custom` together with `image_url`.
    pub os: Option<String>,
    pub image_url: Option<String>,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub disk_size: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub ssh_port: Option<String>,
    pub forwards: Vec<String>,
    pub gui: bool,
}

impl CreateRequest {
    pub fn named(name: impl Into<String>) -> Self {
        CreateRequest {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Fields an edit may touch. Disk size goes through `resize_disk`; the OS
/// and name are fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct VmChanges {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub ssh_port: Option<String>,
    /// Replaces the whole forward list when set.
    pub forwards: Option<Vec<String>>,
    pub gui: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmInfo {
    #[serde(flatten)]
    pub config: VmConfig,
    pub state: RuntimeState,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub index: usize,
    pub name: VmName,
    /// Empty when the record or the process table could not be read.
    pub state: Option<RuntimeState>,
    pub os: Option<String>,
    pub ssh_port: Option<u16>,
}

#[derive(Debug)]
pub struct StartReport {
    pub config: VmConfig,
    pub pid: u32,
    pub fetched: bool,
    /// The disk could not be grown; the VM booted at its previous size.
    pub resize_warning: Option<String>,
}

#[derive(Debug)]
pub struct EditReport {
    pub config: VmConfig,
    pub seed_regenerated: bool,
    /// Changes take effect on the next start.
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub name: VmName,
    pub state: RuntimeState,
    pub stats: Option<ProcessStats>,
}

/// Coordinates the store, the preparer and the controller for every
/// operation. Each call takes the VM by name and threads its configuration
/// through explicitly; nothing is cached between calls.
pub struct Lifecycle<P, C> {
    store: ConfigStore,
    preparer: P,
    controller: C,
    settings: Settings,
}

impl<P: Preparer, C: Controller> Lifecycle<P, C> {
    pub fn new(store: ConfigStore, preparer: P, controller: C, settings: Settings) -> Self {
        Self {
            store,
            preparer,
            controller,
            settings,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn preparer(&self) -> &P {
        &self.preparer
    }

    pub fn list(&self) -> Result<Vec<VmName>, VmError> {
        Ok(self.store.list()?)
    }

    /// Every stored VM with its live state. Unreadable records are listed
    /// without details instead of failing the whole listing.
    pub async fn list_summaries(&self) -> Result<Vec<VmSummary>, VmError> {
        let mut summaries = Vec::new();
        for (position, name) in self.store.list()?.into_iter().enumerate() {
            let index = position + 1;
            match self.store.load(&name) {
                Ok(config) => summaries.push(VmSummary {
                    index,
                    state: match self.state_of(&config).await {
                        Ok(state) => Some(state),
                        Err(e) => {
                            warn!("{}", e);
                            None
                        }
                    },
                    os: Some(format!("{} {}", config.os.family, config.os.codename)),
                    ssh_port: Some(config.network.ssh_port),
                    name,
                }),
                Err(e @ StoreError::Io { .. }) => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping details for {}: {}", name, e);
                    summaries.push(VmSummary {
                        index,
                        name,
                        state: None,
                        os: None,
                        ssh_port: None,
                    });
                }
            }
        }
        Ok(summaries)
    }

    /// Accept a VM name or its 1-based position in [`Self::list`]. A stored
    /// name wins over an index.
    pub fn resolve(&self, selector: &str) -> Result<VmName, VmError> {
        if let Ok(name) = selector.parse::<VmName>() {
            if self.store.exists(&name) {
                return Ok(name);
            }
        }
        if let Ok(index) = selector.parse::<usize>() {
            if let Some(name) = index
                .checked_sub(1)
                .and_then(|i| self.store.list().ok()?.into_iter().nth(i))
            {
                return Ok(name);
            }
        }
        Err(VmError::NotFound(selector.to_string()))
    }

    pub fn load(&self, name: &VmName) -> Result<VmConfig, VmError> {
        Ok(self.store.load(name)?)
    }

    pub async fn create_vm(&self, request: CreateRequest) -> Result<VmConfig, VmError> {
        let name = validate::name(&request.name)?;
        if self.store.exists(&name) {
            return Err(VmError::DuplicateIdentity(name.to_string()));
        }

        let os = resolve_os(&request)?;
        let range = self.settings.port_range;
        let guest = GuestIdentity {
            hostname: validate::hostname(request.hostname.as_deref().unwrap_or(name.as_str()))?,
            username: validate::username(
                request.username.as_deref().unwrap_or(os.default_username),
            )?,
            password: validate::password(
                request.password.as_deref().unwrap_or(os.default_password),
            )?,
        };
        let resources = Resources {
            disk_size: validate::disk_size(
                request.disk_size.as_deref().unwrap_or(DEFAULT_DISK_SIZE),
            )?,
            memory_mb: validate::count(
                "memory",
                request.memory.as_deref().unwrap_or(DEFAULT_MEMORY_MB),
            )?,
            cpus: validate::count("cpus", request.cpus.as_deref().unwrap_or(DEFAULT_CPUS))?,
        };
        let network = Network {
            ssh_port: validate::host_port(
                request.ssh_port.as_deref().unwrap_or(DEFAULT_SSH_PORT),
                range,
            )?,
            forwards: parse_forwards(&request.forwards, range)?,
        };
        self.check_ports(&network, None, &[])?;

        let config = VmConfig {
            artifacts: self.store.artifacts_for(&name),
            name,
            os: os.descriptor,
            guest,
            resources,
            network,
            gui: request.gui,
            created: Local::now().format(CREATED_FORMAT).to_string(),
        };

        info!("Preparing artifacts for {}", config.name);
        let prepared = self
            .preparer
            .prepare(&config)
            .await
            .map_err(|e| VmError::from_image(config.name.as_str(), e))?;
        if let Some(e) = prepared.resize_error {
            warn!("{}: {}; continuing at the image's current size", config.name, e);
        }

        self.store.save(&config)?;
        info!("Created VM {}", config.name);
        Ok(config)
    }

    /// Prepare artifacts, launch, then confirm the hypervisor survived the
    /// launch grace period.
    pub async fn start_vm(&self, name: &VmName) -> Result<StartReport, VmError> {
        let config = self.store.load(name)?;
        if self.running(&config).await? {
            return Err(VmError::AlreadyRunning(name.to_string()));
        }

        let prepared = self
            .preparer
            .prepare(&config)
            .await
            .map_err(|e| VmError::from_image(name.as_str(), e))?;
        let resize_warning = prepared.resize_error.map(|e| e.to_string());

        let launched = self
            .controller
            .start(&config)
            .await
            .map_err(|e| VmError::from_process(name.as_str(), e))?;

        tokio::time::sleep(self.settings.launch_grace).await;
        if !self.running(&config).await? {
            return Err(VmError::Launch {
                name: name.to_string(),
                reason: format!(
                    "hypervisor (PID {}) exited within {:?} of launch",
                    launched.pid, self.settings.launch_grace
                ),
            });
        }

        info!("{} is running", name);
        Ok(StartReport {
            config,
            pid: launched.pid,
            fetched: prepared.fetched,
            resize_warning,
        })
    }

    pub async fn stop_vm(&self, name: &VmName) -> Result<StopOutcome, VmError> {
        let config = self.store.load(name)?;
        self.controller
            .stop(&config)
            .await
            .map_err(|e| VmError::from_process(name.as_str(), e))
    }

    pub async fn show_info(&self, name: &VmName) -> Result<VmInfo, VmError> {
        let config = self.store.load(name)?;
        let state = self.state_of(&config).await?;
        Ok(VmInfo { config, state })
    }

    /// Apply `changes`. A changed hostname, username or password rebuilds
    /// the seed before the record is saved so the two never disagree.
    pub async fn edit_vm(&self, name: &VmName, changes: VmChanges) -> Result<EditReport, VmError> {
        let current = self.store.load(name)?;
        let updated = apply_changes(&current, &changes, self.settings.port_range)?;
        let running = match self.controller.running(&current).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Cannot tell whether {} is running: {}", name, e);
                false
            }
        };

        if updated == current {
            info!("No changes for {}", name);
            return Ok(EditReport {
                config: current,
                seed_regenerated: false,
                running,
            });
        }

        if updated.network != current.network {
            let held: Vec<u16> = current.network.host_ports().collect();
            self.check_ports(&updated.network, Some(name), &held)?;
        }

        let seed_regenerated = updated.guest != current.guest;
        if seed_regenerated {
            self.preparer
                .regenerate_seed(&updated)
                .await
                .map_err(|e| VmError::from_image(name.as_str(), e))?;
        }

        if let Err(e) = self.store.save(&updated) {
            if seed_regenerated {
                if let Err(restore) = self.preparer.regenerate_seed(&current).await {
                    error!(
                        "Seed for {} no longer matches its record: {}",
                        name, restore
                    );
                }
            }
            return Err(e.into());
        }

        if running {
            warn!("{} is running; changes take effect on its next start", name);
        }
        info!("Updated {}", name);
        Ok(EditReport {
            config: updated,
            seed_regenerated,
            running,
        })
    }

    /// Remove the artifacts, then the record. A record that outlives its
    /// artifacts is reported as [`VmError::PartialDelete`].
    pub async fn delete_vm(&self, name: &VmName) -> Result<(), VmError> {
        let config = self.store.load(name)?;
        if self.running(&config).await? {
            return Err(VmError::Busy(name.to_string()));
        }

        self.preparer
            .remove_artifacts(&config)
            .map_err(|e| VmError::from_image(name.as_str(), e))?;
        self.store
            .delete(name)
            .map_err(|source| VmError::PartialDelete {
                name: name.to_string(),
                source,
            })?;

        info!("Deleted {}", name);
        Ok(())
    }

    /// Grow the disk of a stopped VM. The record keeps the old size unless
    /// the image was actually grown.
    pub async fn resize_disk(&self, name: &VmName, new_size: &str) -> Result<VmConfig, VmError> {
        let mut config = self.store.load(name)?;
        let size = validate::disk_size(new_size)?;
        let current = config.resources.disk_size;
        if size.as_bytes() <= current.as_bytes() {
            return Err(VmError::validation(
                "disk size",
                format!("{} does not exceed the current {}; disks can only grow", size, current),
            ));
        }
        if self.running(&config).await? {
            return Err(VmError::Busy(name.to_string()));
        }

        self.preparer
            .resize(&config, size)
            .await
            .map_err(|e| VmError::from_image(name.as_str(), e))?;

        config.resources.disk_size = size;
        self.store.save(&config)?;
        info!("Disk of {} grown from {} to {}", name, current, size);
        Ok(config)
    }

    pub async fn show_performance(&self, name: &VmName) -> Result<Performance, VmError> {
        let config = self.store.load(name)?;
        let state = self.state_of(&config).await?;
        let stats = match state {
            RuntimeState::Running => self.controller.resource_usage(&config).await,
            RuntimeState::Stopped => None,
        };
        Ok(Performance {
            name: config.name,
            state,
            stats,
        })
    }

    /// Guards act on this: a process table that cannot be read never
    /// passes for a stopped VM.
    async fn running(&self, config: &VmConfig) -> Result<bool, VmError> {
        self.controller
            .running(config)
            .await
            .map_err(|source| VmError::StateUnknown {
                name: config.name.to_string(),
                source,
            })
    }

    async fn state_of(&self, config: &VmConfig) -> Result<RuntimeState, VmError> {
        Ok(if self.running(config).await? {
            RuntimeState::Running
        } else {
            RuntimeState::Stopped
        })
    }

    /// Host ports of every stored VM except `except`.
    fn claimed_ports(&self, except: Option<&VmName>) -> Result<HashMap<u16, VmName>, VmError> {
        let mut claimed = HashMap::new();
        for name in self.store.list()? {
            if Some(&name) == except {
                continue;
            }
            match self.store.load(&name) {
                Ok(config) => {
                    for port in config.network.host_ports() {
                        claimed.insert(port, name.clone());
                    }
                }
                Err(e @ StoreError::Io { .. }) => return Err(e.into()),
                Err(e) => warn!("Ignoring ports of {}: {}", name, e),
            }
        }
        Ok(claimed)
    }

    /// `held` are ports the VM already owned; they are not probed again.
    fn check_ports(
        &self,
        network: &Network,
        owner: Option<&VmName>,
        held: &[u16],
    ) -> Result<(), VmError> {
        validate::distinct_ports(network.host_ports())?;
        let claimed = self.claimed_ports(owner)?;
        validate::unclaimed(network.host_ports(), &claimed)?;
        if self.settings.probe_host_ports {
            validate::bindable(network.host_ports().filter(|port| !held.contains(port)))?;
        }
        Ok(())
    }
}

fn resolve_os(request: &CreateRequest) -> Result<ResolvedOs, VmError> {
    let selector = request.os.as_deref().unwrap_or(catalog::DEFAULT_OS);

    if selector.eq_ignore_ascii_case(catalog::CUSTOM_OS) {
        let url = request
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| VmError::validation("image URL", "a custom OS needs an image URL"))?;
        let parsed = url::Url::parse(url)
            .map_err(|e| VmError::validation("image URL", format!("'{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https" | "file") {
            return Err(VmError::validation(
                "image URL",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }
        return Ok(catalog::custom(url));
    }

    if request.image_url.is_some() {
        return Err(VmError::validation(
            "image URL",
            "only a custom OS takes an image URL",
        ));
    }
    catalog::lookup(selector)
        .map(ResolvedOs::from)
        .ok_or_else(|| {
            VmError::validation(
                "os",
                format!("unknown OS '{}'; run `cloudvm os-list`", selector),
            )
        })
}

fn parse_forwards(
    raw: &[String],
    range: PortRange,
) -> Result<Vec<PortForward>, VmError> {
    raw.iter()
        .map(|value| validate::forward(value, range))
        .collect()
}

fn apply_changes(
    current: &VmConfig,
    changes: &VmChanges,
    range: PortRange,
) -> Result<VmConfig, VmError> {
    let mut updated = current.clone();
    if let Some(hostname) = &changes.hostname {
        updated.guest.hostname = validate::hostname(hostname)?;
    }
    if let Some(username) = &changes.username {
        updated.guest.username = validate::username(username)?;
    }
    if let Some(password) = &changes.password {
        updated.guest.password = validate::password(password)?;
    }
    if let Some(memory) = &changes.memory {
        updated.resources.memory_mb = validate::count("memory", memory)?;
    }
    if let Some(cpus) = &changes.cpus {
        updated.resources.cpus = validate::count("cpus", cpus)?;
    }
    if let Some(port) = &changes.ssh_port {
        updated.network.ssh_port = validate::host_port(port, range)?;
    }
    if let Some(forwards) = &changes.forwards {
        updated.network.forwards = parse_forwards(forwards, range)?;
    }
    if let Some(gui) = changes.gui {
        updated.gui = gui;
    }
    Ok(updated)
}
