// Re-export all public items from submodules
pub mod errors;
pub mod models;
pub mod record;

pub use self::errors::StoreError;
pub use self::models::*;

use log::{debug, info};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const RECORD_EXTENSION: &str = "conf";
pub const IMAGE_EXTENSION: &str = "qcow2";
pub const SEED_SUFFIX: &str = "-seed.iso";

/// One `{name}.conf` record per VM inside a single store root.
///
/// There is no locking: a store root is expected to be driven by one manager
/// instance at a time.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Open the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
            info!("Created store directory: {:?}", root);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, name: &VmName) -> PathBuf {
        self.root.join(format!("{}.{}", name, RECORD_EXTENSION))
    }

    /// The only valid artifact locations for `name`.
    pub fn artifacts_for(&self, name: &VmName) -> Artifacts {
        Artifacts {
            image: self.root.join(format!("{}.{}", name, IMAGE_EXTENSION)),
            seed: self.root.join(format!("{}{}", name, SEED_SUFFIX)),
        }
    }

    pub fn exists(&self, name: &VmName) -> bool {
        self.record_path(name).is_file()
    }

    /// Names of every stored VM, sorted.
    pub fn list(&self) -> Result<Vec<VmName>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.root, e))?.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION)
            {
                continue;
            }
            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::parse::<VmName>)
            {
                Some(Ok(name)) => names.push(name),
                _ => debug!("Skipping unrecognised record file {:?}", path),
            }
        }

        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &VmName) -> Result<VmConfig, StoreError> {
        let path = self.record_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        record::parse(name, &text, self.artifacts_for(name))
    }

    /// Write the record, replacing any previous one for the same name.
    /// The new contents are written to a sibling temp file and renamed over
    /// the record, so readers never observe a half-written file.
    pub fn save(&self, config: &VmConfig) -> Result<(), StoreError> {
        let path = self.record_path(&config.name);
        let text = record::render(config);

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        tmp.write_all(text.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        debug!("Saved configuration for {} to {:?}", config.name, path);
        Ok(())
    }

    /// Remove the record only. Artifacts are the caller's concern.
    pub fn delete(&self, name: &VmName) -> Result<(), StoreError> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed configuration record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}
