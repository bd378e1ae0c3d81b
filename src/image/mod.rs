// Re-export all public items from submodules
pub mod download;
pub mod errors;
pub mod preparer;
pub mod seed;

pub use self::errors::ImageError;
pub use self::preparer::QemuImagePreparer;

use log::info;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::store::{DiskSize, VmConfig};

/// Outcome of [`Preparer::prepare`].
#[derive(Debug)]
pub struct Prepared {
    pub image: PathBuf,
    pub seed: PathBuf,
    /// The base image was fetched during this call.
    pub fetched: bool,
    /// The seed volume was generated during this call.
    pub seeded: bool,
    /// Growing the disk failed; the VM can still boot at its old size.
    pub resize_error: Option<ImageError>,
}

/// Materializes the durable artifacts of a VM. Every step is idempotent, so
/// a call interrupted half-way can simply be repeated.
#[allow(async_fn_in_trait)]
pub trait Preparer {
    /// Fetch the image if missing, grow it to the configured size and
    /// generate the seed if missing.
    async fn prepare(&self, config: &VmConfig) -> Result<Prepared, ImageError>;

    /// Grow the existing image to `size`.
    async fn resize(&self, config: &VmConfig, size: DiskSize) -> Result<(), ImageError>;

    /// Rebuild the seed from the current guest identity.
    async fn regenerate_seed(&self, config: &VmConfig) -> Result<PathBuf, ImageError>;

    /// Delete the image and seed. Files that are already gone are fine.
    /// A failure after the first file went away is reported as
    /// [`ImageError::PartialRemoval`].
    fn remove_artifacts(&self, config: &VmConfig) -> Result<(), ImageError> {
        let mut removed = Vec::new();
        for path in [&config.artifacts.image, &config.artifacts.seed] {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    info!("Removed {:?}", path);
                    removed.push(path.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) if removed.is_empty() => {
                    return Err(ImageError::Io {
                        path: path.clone(),
                        source,
                    })
                }
                Err(source) => {
                    return Err(ImageError::PartialRemoval {
                        removed,
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}
