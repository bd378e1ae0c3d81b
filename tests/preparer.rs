#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cloudvm::image::{ImageError, Preparer, QemuImagePreparer};
use cloudvm::settings::Tools;
use cloudvm::store::{
    ConfigStore, DiskSize, GuestIdentity, Network, OsDescriptor, Resources, VmConfig,
};
use tempfile::TempDir;

const QCOW2_IMAGE: &[u8] = b"QFI\xfb\x00\x00\x00\x03base image";
const HASH: &str = "$6$saltsalt$hashedvalue";

/// How the stand-in `qemu-img` behaves.
struct FakeQemuImg {
    virtual_size: u64,
    resize_ok: bool,
    overlay_ok: bool,
}

impl Default for FakeQemuImg {
    fn default() -> Self {
        FakeQemuImg {
            virtual_size: 2 << 30,
            resize_ok: true,
            overlay_ok: true,
        }
    }
}

struct Env {
    _tools_dir: TempDir,
    store_dir: TempDir,
    source_dir: TempDir,
    tools: Tools,
    log: PathBuf,
}

impl Env {
    fn new(qemu_img: FakeQemuImg, seed_ok: bool) -> Self {
        let tools_dir = TempDir::new().unwrap();
        let log = tools_dir.path().join("calls.log");

        let qemu_img_script = format!(
            r#"#!/bin/sh
echo "qemu-img $*" >> '{log}'
case "$1" in
  info) echo '{{"virtual-size": {size}, "format": "qcow2"}}' ;;
  resize) exit {resize} ;;
  create) exit {create} ;;
  convert) cp "$4" "$5" ;;
esac
"#,
            log = log.display(),
            size = qemu_img.virtual_size,
            resize = if qemu_img.resize_ok { 0 } else { 1 },
            create = if qemu_img.overlay_ok { 0 } else { 1 },
        );
        let seed_script = if seed_ok {
            format!(
                "#!/bin/sh\necho \"seed $*\" >> '{}'\ncat \"$2\" \"$3\" > \"$1\"\n",
                log.display()
            )
        } else {
            "#!/bin/sh\necho 'genisoimage: not found' >&2\nexit 3\n".to_string()
        };
        let passwd_script = format!("#!/bin/sh\ncat > /dev/null\necho '{}'\n", HASH);

        let tools = Tools {
            qemu: PathBuf::from("/bin/false"),
            qemu_img: install(tools_dir.path(), "qemu-img", &qemu_img_script),
            seed_tool: install(tools_dir.path(), "cloud-localds", &seed_script),
            passwd_tool: install(tools_dir.path(), "openssl", &passwd_script),
            pgrep: PathBuf::from("pgrep"),
        };

        Env {
            _tools_dir: tools_dir,
            store_dir: TempDir::new().unwrap(),
            source_dir: TempDir::new().unwrap(),
            tools,
            log,
        }
    }

    fn source(&self, contents: &[u8]) -> String {
        let path = self.source_dir.path().join("base.img");
        fs::write(&path, contents).unwrap();
        url::Url::from_file_path(&path).unwrap().to_string()
    }

    fn config(&self, image_url: String, disk_size: DiskSize) -> VmConfig {
        let store = ConfigStore::open(self.store_dir.path()).unwrap();
        let name = "web1".parse().unwrap();
        VmConfig {
            artifacts: store.artifacts_for(&name),
            name,
            os: OsDescriptor {
                family: "ubuntu".into(),
                codename: "jammy".into(),
                image_url,
            },
            guest: GuestIdentity {
                hostname: "web1".into(),
                username: "ubuntu".into(),
                password: "clear-text-secret".into(),
            },
            resources: Resources {
                disk_size,
                memory_mb: 2048,
                cpus: 2,
            },
            network: Network {
                ssh_port: 2222,
                forwards: vec![],
            },
            gui: false,
            created: "2024-01-01 00:00:00".into(),
        }
    }

    fn calls(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    fn store_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.store_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn install(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn prepare_is_idempotent_and_fetches_once() {
    let env = Env::new(FakeQemuImg::default(), true);
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let first = preparer.prepare(&config).await.unwrap();
    assert!(first.fetched);
    assert!(first.seeded);
    assert!(first.resize_error.is_none());
    assert_eq!(fs::read(&first.image).unwrap(), QCOW2_IMAGE);

    // A second run must not touch the source at all.
    fs::remove_file(env.source_dir.path().join("base.img")).unwrap();
    let second = preparer.prepare(&config).await.unwrap();
    assert!(!second.fetched);
    assert!(!second.seeded);
    assert_eq!(second.image, first.image);
    assert_eq!(second.seed, first.seed);

    assert_eq!(env.store_entries(), vec!["web1-seed.iso", "web1.qcow2"]);
}

#[tokio::test]
async fn qcow2_sources_skip_conversion_and_others_are_converted() {
    let env = Env::new(FakeQemuImg::default(), true);
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    preparer.prepare(&config).await.unwrap();
    assert!(!env.calls().contains("qemu-img convert"));

    fs::remove_file(&config.artifacts.image).unwrap();
    let raw = env.config(env.source(b"\x00\x00raw disk"), DiskSize::gib(1));
    preparer.prepare(&raw).await.unwrap();
    assert!(env.calls().contains("qemu-img convert -O qcow2"));
    assert_eq!(fs::read(&raw.artifacts.image).unwrap(), b"\x00\x00raw disk");
}

#[tokio::test]
async fn seed_carries_the_hash_but_not_the_password() {
    let env = Env::new(FakeQemuImg::default(), true);
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    preparer.prepare(&config).await.unwrap();

    let seed = fs::read_to_string(&config.artifacts.seed).unwrap();
    assert!(seed.starts_with("#cloud-config\n"));
    assert!(seed.contains(HASH));
    assert!(seed.contains("instance-id: \"iid-web1-"));
    assert!(!seed.contains("clear-text-secret"));
}

#[tokio::test]
async fn regenerated_seeds_get_a_new_instance_id() {
    let env = Env::new(FakeQemuImg::default(), true);
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let path = preparer.regenerate_seed(&config).await.unwrap();
    let first = fs::read_to_string(&path).unwrap();
    preparer.regenerate_seed(&config).await.unwrap();
    let second = fs::read_to_string(&path).unwrap();

    assert_ne!(first, second);
}

#[tokio::test]
async fn images_already_large_enough_are_not_resized() {
    let env = Env::new(
        FakeQemuImg {
            virtual_size: 30 << 30,
            ..Default::default()
        },
        true,
    );
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(20));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    preparer.prepare(&config).await.unwrap();

    assert!(env.calls().contains("qemu-img info --output=json"));
    assert!(!env.calls().contains("qemu-img resize"));
}

#[tokio::test]
async fn small_images_are_grown_in_place() {
    let env = Env::new(FakeQemuImg::default(), true);
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(20));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    preparer.prepare(&config).await.unwrap();

    let expected = format!("qemu-img resize {} 20G", config.artifacts.image.display());
    assert!(env.calls().contains(&expected), "{}", env.calls());
    assert!(!env.calls().contains("qemu-img create"));
}

#[tokio::test]
async fn failed_resize_falls_back_to_an_overlay() {
    let env = Env::new(
        FakeQemuImg {
            resize_ok: false,
            ..Default::default()
        },
        true,
    );
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(20));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let prepared = preparer.prepare(&config).await.unwrap();

    assert!(prepared.resize_error.is_none());
    let calls = env.calls();
    let backing = format!("-b {} -F qcow2", config.artifacts.image.display());
    assert!(calls.contains("qemu-img create -f qcow2"), "{}", calls);
    assert!(calls.contains(&backing), "{}", calls);
    assert_eq!(env.store_entries(), vec!["web1-seed.iso", "web1.qcow2"]);
}

#[tokio::test]
async fn a_failed_resize_does_not_fail_preparation() {
    let env = Env::new(
        FakeQemuImg {
            resize_ok: false,
            overlay_ok: false,
            ..Default::default()
        },
        true,
    );
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(20));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let prepared = preparer.prepare(&config).await.unwrap();

    assert!(matches!(
        prepared.resize_error,
        Some(ImageError::Resize { .. })
    ));
    assert!(config.artifacts.seed.exists());
    assert_eq!(env.store_entries(), vec!["web1-seed.iso", "web1.qcow2"]);
}

#[tokio::test]
async fn explicit_resize_reports_failure() {
    let env = Env::new(
        FakeQemuImg {
            resize_ok: false,
            overlay_ok: false,
            ..Default::default()
        },
        true,
    );
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    assert!(matches!(
        preparer.resize(&config, DiskSize::gib(40)).await,
        Err(ImageError::Resize { .. })
    ));

    preparer.prepare(&config).await.unwrap();
    assert!(matches!(
        preparer.resize(&config, DiskSize::gib(40)).await,
        Err(ImageError::Resize { .. })
    ));
}

#[tokio::test]
async fn seed_failure_is_fatal_and_leaves_no_scratch_files() {
    let env = Env::new(FakeQemuImg::default(), false);
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let err = preparer.prepare(&config).await.unwrap_err();

    match err {
        ImageError::SeedGeneration { reason, .. } => {
            assert!(reason.contains("genisoimage: not found"), "{}", reason)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!config.artifacts.seed.exists());
    assert_eq!(env.store_entries(), vec!["web1.qcow2"]);
}

#[tokio::test]
async fn unreachable_sources_leave_nothing_behind() {
    let env = Env::new(FakeQemuImg::default(), true);
    let missing = url::Url::from_file_path(env.source_dir.path().join("absent.img"))
        .unwrap()
        .to_string();
    let config = env.config(missing, DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    let err = preparer.prepare(&config).await.unwrap_err();

    assert!(matches!(err, ImageError::Fetch { .. }));
    assert!(env.store_entries().is_empty());
}

#[tokio::test]
async fn leftovers_from_an_interrupted_fetch_are_cleared() {
    let env = Env::new(FakeQemuImg::default(), true);
    fs::write(env.store_dir.path().join(".web1.a1b2c3.part"), b"half").unwrap();
    let config = env.config(env.source(QCOW2_IMAGE), DiskSize::gib(1));
    let preparer = QemuImagePreparer::new(env.tools.clone());

    preparer.prepare(&config).await.unwrap();

    assert_eq!(env.store_entries(), vec!["web1-seed.iso", "web1.qcow2"]);
}
