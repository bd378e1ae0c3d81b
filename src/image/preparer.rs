use log::{debug, info, warn};
use serde::Deserialize;
use std::ffi::OsStr;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::image::errors::ImageError;
use crate::image::{download, seed, Prepared, Preparer};
use crate::settings::Tools;
use crate::store::{DiskSize, VmConfig, VmName};

const QCOW2_MAGIC: &[u8; 4] = b"QFI\xfb";
const PART_SUFFIX: &str = ".part";

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// Builds VM artifacts with `qemu-img`, a NoCloud seed tool (`cloud-localds`)
/// and a crypt(3) password hasher (`openssl passwd`).
#[derive(Debug, Clone)]
pub struct QemuImagePreparer {
    tools: Tools,
}

impl QemuImagePreparer {
    pub fn new(tools: Tools) -> Self {
        Self { tools }
    }

    /// Make sure the image exists. Returns `true` when it had to be fetched.
    async fn ensure_image(&self, config: &VmConfig) -> Result<bool, ImageError> {
        let image = &config.artifacts.image;
        if image.exists() {
            debug!("Image for {} already present at {:?}", config.name, image);
            return Ok(false);
        }

        let url = config.os.image_url.as_str();
        let fetch_err = |reason: String| ImageError::Fetch {
            url: url.to_string(),
            reason,
        };

        let dir = artifact_dir(image);
        remove_stale_parts(dir, &config.name);

        let downloaded = part_file(dir, &config.name).map_err(|e| fetch_err(e.to_string()))?;
        info!("Fetching base image for {} from {}", config.name, url);
        let bytes = download::fetch(url, downloaded.path())
            .await
            .map_err(fetch_err)?;
        debug!("Fetched {} bytes into {:?}", bytes, downloaded.path());

        let finished = if is_qcow2(downloaded.path()).map_err(|e| fetch_err(e.to_string()))? {
            downloaded
        } else {
            info!("Converting base image for {} to qcow2", config.name);
            let converted = part_file(dir, &config.name).map_err(|e| fetch_err(e.to_string()))?;
            run_tool(
                &self.tools.qemu_img,
                [
                    OsStr::new("convert"),
                    OsStr::new("-O"),
                    OsStr::new("qcow2"),
                    downloaded.path().as_os_str(),
                    converted.path().as_os_str(),
                ],
            )
            .await
            .map_err(|e| fetch_err(format!("conversion failed: {}", e)))?;
            converted
        };

        finished
            .persist(image)
            .map_err(|e| fetch_err(format!("cannot move image into place: {}", e.error)))?;
        info!("Image for {} ready at {:?}", config.name, image);
        Ok(true)
    }

    async fn virtual_size(&self, image: &Path) -> Option<u64> {
        let stdout = run_tool(
            &self.tools.qemu_img,
            [
                OsStr::new("info"),
                OsStr::new("--output=json"),
                image.as_os_str(),
            ],
        )
        .await
        .map_err(|e| debug!("qemu-img info failed for {:?}: {}", image, e))
        .ok()?;

        serde_json::from_slice::<ImageInfo>(&stdout)
            .map(|info| info.virtual_size)
            .map_err(|e| debug!("Unreadable qemu-img info output for {:?}: {}", image, e))
            .ok()
    }

    /// Grow `image` to at least `size`. Returns `false` when it was already
    /// large enough.
    async fn grow(&self, config: &VmConfig, size: DiskSize) -> Result<bool, ImageError> {
        let image = &config.artifacts.image;
        if let Some(current) = self.virtual_size(image).await {
            if current >= size.as_bytes() {
                debug!(
                    "Image {:?} already holds {} bytes, no resize needed for {}",
                    image, current, size
                );
                return Ok(false);
            }
        }

        let size_arg = size.to_string();
        let direct = run_tool(
            &self.tools.qemu_img,
            [
                OsStr::new("resize"),
                image.as_os_str(),
                OsStr::new(&size_arg),
            ],
        )
        .await;

        let direct_err = match direct {
            Ok(_) => {
                info!("Resized {:?} to {}", image, size);
                return Ok(true);
            }
            Err(e) => e,
        };

        warn!(
            "In-place resize of {:?} failed ({}); rebuilding through an overlay",
            image, direct_err
        );
        self.grow_via_overlay(config, size)
            .await
            .map_err(|overlay_err| ImageError::Resize {
                path: image.clone(),
                reason: format!(
                    "in-place resize failed: {}; overlay fallback failed: {}",
                    direct_err, overlay_err
                ),
            })?;

        info!("Resized {:?} to {} through an overlay", image, size);
        Ok(true)
    }

    /// Create an overlay of `size` backed by the image, flatten it into a
    /// standalone qcow2 and move that over the original path.
    async fn grow_via_overlay(&self, config: &VmConfig, size: DiskSize) -> Result<(), String> {
        let image = &config.artifacts.image;
        let dir = artifact_dir(image);
        let overlay = part_file(dir, &config.name).map_err(|e| e.to_string())?;
        let flattened = part_file(dir, &config.name).map_err(|e| e.to_string())?;
        let size_arg = size.to_string();

        run_tool(
            &self.tools.qemu_img,
            [
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-b"),
                image.as_os_str(),
                OsStr::new("-F"),
                OsStr::new("qcow2"),
                overlay.path().as_os_str(),
                OsStr::new(&size_arg),
            ],
        )
        .await?;

        run_tool(
            &self.tools.qemu_img,
            [
                OsStr::new("convert"),
                OsStr::new("-O"),
                OsStr::new("qcow2"),
                overlay.path().as_os_str(),
                flattened.path().as_os_str(),
            ],
        )
        .await?;

        flattened
            .persist(image)
            .map_err(|e| format!("cannot replace {}: {}", image.display(), e.error))?;
        Ok(())
    }

    async fn hash_password(&self, password: &str) -> Result<String, String> {
        let mut child = Command::new(&self.tools.passwd_tool)
            .args(["passwd", "-6", "-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot run {}: {}", self.tools.passwd_tool.display(), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", password).as_bytes())
                .await
                .map_err(|e| format!("cannot pass password to hasher: {}", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("password hasher failed: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "password hasher exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err("password hasher produced no output".to_string());
        }
        Ok(hash)
    }

    /// Render the NoCloud documents into a scratch directory and build the
    /// seed volume from them. The scratch directory is removed when this
    /// returns, whatever the outcome.
    async fn write_seed(&self, config: &VmConfig) -> Result<(), ImageError> {
        let seed_err = |reason: String| ImageError::SeedGeneration {
            name: config.name.to_string(),
            reason,
        };

        let hash = self.hash_password(&config.guest.password).await.map_err(seed_err)?;
        let instance_id = format!("iid-{}-{}", config.name, Uuid::new_v4().simple());
        let docs = seed::render(config, &hash, &instance_id);

        let scratch = tempfile::Builder::new()
            .prefix("cloudvm-seed-")
            .tempdir()
            .map_err(|e| seed_err(format!("cannot create scratch directory: {}", e)))?;
        let user_data = scratch.path().join("user-data");
        let meta_data = scratch.path().join("meta-data");
        fs::write(&user_data, &docs.user_data)
            .and_then(|_| fs::write(&meta_data, &docs.meta_data))
            .map_err(|e| seed_err(format!("cannot write seed documents: {}", e)))?;

        let seed = &config.artifacts.seed;
        let out = part_file(artifact_dir(seed), &config.name).map_err(|e| seed_err(e.to_string()))?;
        run_tool(
            &self.tools.seed_tool,
            [
                out.path().as_os_str(),
                user_data.as_os_str(),
                meta_data.as_os_str(),
            ],
        )
        .await
        .map_err(seed_err)?;

        out.persist(seed)
            .map_err(|e| seed_err(format!("cannot move seed into place: {}", e.error)))?;
        info!("Seed for {} written to {:?} ({})", config.name, seed, instance_id);
        Ok(())
    }
}

impl Preparer for QemuImagePreparer {
    async fn prepare(&self, config: &VmConfig) -> Result<Prepared, ImageError> {
        let fetched = self.ensure_image(config).await?;

        let resize_error = match self.grow(config, config.resources.disk_size).await {
            Ok(_) => None,
            Err(e) => {
                warn!("{}; {} keeps its current disk size", e, config.name);
                Some(e)
            }
        };

        let seeded = if config.artifacts.seed.exists() {
            debug!("Seed for {} already present", config.name);
            false
        } else {
            self.write_seed(config).await?;
            true
        };

        Ok(Prepared {
            image: config.artifacts.image.clone(),
            seed: config.artifacts.seed.clone(),
            fetched,
            seeded,
            resize_error,
        })
    }

    async fn resize(&self, config: &VmConfig, size: DiskSize) -> Result<(), ImageError> {
        if !config.artifacts.image.exists() {
            return Err(ImageError::Resize {
                path: config.artifacts.image.clone(),
                reason: "image does not exist".to_string(),
            });
        }
        self.grow(config, size).await.map(|_| ())
    }

    async fn regenerate_seed(&self, config: &VmConfig) -> Result<PathBuf, ImageError> {
        self.write_seed(config).await?;
        Ok(config.artifacts.seed.clone())
    }
}

fn artifact_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// Reserve a `.{name}.XXXXXX.part` scratch file beside the artifacts. It is
/// deleted on drop unless persisted.
fn part_file(dir: &Path, name: &VmName) -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(PART_SUFFIX)
        .tempfile_in(dir)
}

/// Remove scratch files an interrupted run left behind for `name`.
fn remove_stale_parts(dir: &Path, name: &VmName) {
    let prefix = format!(".{}.", name);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot scan {:?} for stale files: {}", dir, e);
            return;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(&prefix) && file_name.ends_with(PART_SUFFIX) {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed leftover file {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove leftover file {:?}: {}", path, e),
            }
        }
    }
}

fn is_qcow2(path: &Path) -> std::io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == QCOW2_MAGIC),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run `program` to completion and return its stdout, or its stderr as the
/// error when it exits non-zero.
async fn run_tool<I, S>(program: &Path, args: I) -> Result<Vec<u8>, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("cannot run {}: {}", program.display(), e))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn qcow2_detection_reads_the_magic() {
        let dir = TempDir::new().unwrap();
        let qcow = dir.path().join("a");
        let raw = dir.path().join("b");
        let tiny = dir.path().join("c");
        fs::write(&qcow, b"QFI\xfb\x00\x00\x00\x03rest").unwrap();
        fs::write(&raw, b"\x00\x00\x00\x00rest").unwrap();
        fs::write(&tiny, b"QF").unwrap();

        assert!(is_qcow2(&qcow).unwrap());
        assert!(!is_qcow2(&raw).unwrap());
        assert!(!is_qcow2(&tiny).unwrap());
    }

    #[test]
    fn stale_parts_are_removed_only_for_the_named_vm() {
        let dir = TempDir::new().unwrap();
        let web1: VmName = "web1".parse().unwrap();
        fs::write(dir.path().join(".web1.abc123.part"), b"").unwrap();
        fs::write(dir.path().join(".web1-x.abc123.part"), b"").unwrap();
        fs::write(dir.path().join("web1.qcow2"), b"").unwrap();

        remove_stale_parts(dir.path(), &web1);

        assert!(!dir.path().join(".web1.abc123.part").exists());
        assert!(dir.path().join(".web1-x.abc123.part").exists());
        assert!(dir.path().join("web1.qcow2").exists());
    }

    #[test]
    fn part_files_vanish_on_drop() {
        let dir = TempDir::new().unwrap();
        let name: VmName = "web1".parse().unwrap();
        let path = {
            let part = part_file(dir.path(), &name).unwrap();
            let path = part.path().to_path_buf();
            assert!(path.file_name().unwrap().to_str().unwrap().starts_with(".web1."));
            path
        };
        assert!(!path.exists());
    }
}
