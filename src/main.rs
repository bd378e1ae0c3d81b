use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use cloudvm::lifecycle::catalog::{self, CATALOG};
use cloudvm::lifecycle::{CreateRequest, Lifecycle, RuntimeState, VmChanges};
use cloudvm::process::StopOutcome;
use cloudvm::settings::{PortRange, Settings, Tools};
use cloudvm::{ConfigStore, QemuController, QemuImagePreparer, VmConfig, VmError};

type Manager = Lifecycle<QemuImagePreparer, QemuController>;

const EXIT_FAILURE: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(version, about = "Local QEMU virtual machine manager", long_about = None)]
struct Args {
    /// Directory holding VM records, disk images and seeds
    #[arg(long, env = "CLOUDVM_HOME", global = true)]
    store_root: Option<PathBuf>,

    /// Hypervisor executable
    #[arg(long, env = "CLOUDVM_QEMU", global = true)]
    qemu: Option<PathBuf>,

    /// Image conversion and resize tool
    #[arg(long, env = "CLOUDVM_QEMU_IMG", global = true)]
    qemu_img: Option<PathBuf>,

    /// Seed volume generator
    #[arg(long, env = "CLOUDVM_SEED_TOOL", global = true)]
    seed_tool: Option<PathBuf>,

    /// Password hashing tool
    #[arg(long, env = "CLOUDVM_PASSWD_TOOL", global = true)]
    passwd_tool: Option<PathBuf>,

    /// Host ports VMs may forward, as LOW-HIGH
    #[arg(long, env = "CLOUDVM_PORT_RANGE", default_value_t = PortRange::default(), global = true)]
    port_range: PortRange,

    /// Skip the check that requested host ports can be bound
    #[arg(long, global = true)]
    no_port_probe: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM and prepare its disk image and seed
    Create(CreateArgs),
    /// Start a stopped VM
    Start {
        /// VM name or index from `list`
        vm: String,
    },
    /// Stop a running VM
    Stop {
        /// VM name or index from `list`
        vm: String,
    },
    /// Show a VM's configuration and state
    Info {
        /// VM name or index from `list`
        vm: String,
        #[arg(long)]
        json: bool,
    },
    /// Change a VM's guest identity, resources or ports
    Edit(EditArgs),
    /// Delete a stopped VM with its disk image and seed
    Delete {
        /// VM name or index from `list`
        vm: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Grow a stopped VM's disk
    Resize {
        /// VM name or index from `list`
        vm: String,
        /// New size, e.g. 40G
        size: String,
    },
    /// Show CPU, memory and disk usage of a VM
    Performance {
        /// VM name or index from `list`
        vm: String,
        #[arg(long)]
        json: bool,
    },
    /// List all VMs
    List {
        #[arg(long)]
        json: bool,
    },
    /// List the built-in operating system images
    OsList,
}

#[derive(clap::Args, Debug)]
struct CreateArgs {
    /// VM name: letters, digits, '_' or '-'
    name: String,

    /// Catalog key or codename, or `custom` with --image-url
    #[arg(long, default_value = catalog::DEFAULT_OS)]
    os: String,

    /// Source image for a custom OS (http, https or file URL)
    #[arg(long)]
    image_url: Option<String>,

    /// Guest hostname [default: the VM name]
    #[arg(long)]
    hostname: Option<String>,

    /// Login user [default: from the OS catalog]
    #[arg(long)]
    username: Option<String>,

    /// Login password [default: from the OS catalog]
    #[arg(long)]
    password: Option<String>,

    /// Disk size, e.g. 20G or 512M
    #[arg(long)]
    disk: Option<String>,

    /// Memory in MB
    #[arg(long)]
    memory: Option<String>,

    /// Number of virtual CPUs
    #[arg(long)]
    cpus: Option<String>,

    /// Host port forwarded to the guest's SSH port
    #[arg(long)]
    ssh_port: Option<String>,

    /// Extra TCP forward, repeatable
    #[arg(long = "forward", value_name = "HOST:GUEST")]
    forwards: Vec<String>,

    /// Open a graphical console instead of running headless
    #[arg(long)]
    gui: bool,
}

#[derive(clap::Args, Debug)]
struct EditArgs {
    /// VM name or index from `list`
    vm: String,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Memory in MB
    #[arg(long)]
    memory: Option<String>,

    #[arg(long)]
    cpus: Option<String>,

    #[arg(long)]
    ssh_port: Option<String>,

    /// Replace the extra forwards, repeatable
    #[arg(long = "forward", value_name = "HOST:GUEST")]
    forwards: Vec<String>,

    /// Remove every extra forward
    #[arg(long, conflicts_with = "forwards")]
    clear_forwards: bool,

    /// Graphical (true) or headless (false)
    #[arg(long)]
    gui: Option<bool>,
}

impl EditArgs {
    fn into_changes(self) -> VmChanges {
        let forwards = if self.clear_forwards {
            Some(Vec::new())
        } else if self.forwards.is_empty() {
            None
        } else {
            Some(self.forwards)
        };
        VmChanges {
            hostname: self.hostname,
            username: self.username,
            password: self.password,
            memory: self.memory,
            cpus: self.cpus,
            ssh_port: self.ssh_port,
            forwards,
            gui: self.gui,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Dropping `run` on Ctrl-C removes scratch files and kills helper tools.
    tokio::select! {
        result = run(args) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                match e.downcast_ref::<VmError>() {
                    Some(vm_error) if vm_error.is_fatal() => ExitCode::from(EXIT_FATAL),
                    _ => ExitCode::from(EXIT_FAILURE),
                }
            }
        },
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted; re-run the command to resume");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let manager = build_manager(&args)?;

    match args.command {
        Commands::Create(create) => {
            let request = CreateRequest {
                name: create.name,
                os: Some(create.os),
                image_url: create.image_url,
                hostname: create.hostname,
                username: create.username,
                password: create.password,
                disk_size: create.disk,
                memory: create.memory,
                cpus: create.cpus,
                ssh_port: create.ssh_port,
                forwards: create.forwards,
                gui: create.gui,
            };
            let config = manager.create_vm(request).await?;
            println!(
                "Created VM '{}': {} {}, disk {}, {} MB, {} CPUs, SSH on port {}",
                config.name,
                config.os.family,
                config.os.codename,
                config.resources.disk_size,
                config.resources.memory_mb,
                config.resources.cpus,
                config.network.ssh_port
            );
            println!("Start it with: cloudvm start {}", config.name);
        }
        Commands::Start { vm } => {
            let name = manager.resolve(&vm)?;
            let report = manager.start_vm(&name).await?;
            if let Some(warning) = &report.resize_warning {
                println!("Warning: disk was not grown: {}", warning);
            }
            println!("VM '{}' is running (PID {})", name, report.pid);
            print_access(&report.config);
        }
        Commands::Stop { vm } => {
            let name = manager.resolve(&vm)?;
            match manager.stop_vm(&name).await? {
                StopOutcome::AlreadyStopped => println!("VM '{}' was not running", name),
                StopOutcome::Graceful => println!("VM '{}' stopped", name),
                StopOutcome::Forced => println!("VM '{}' did not shut down in time and was killed", name),
            }
        }
        Commands::Info { vm, json } => {
            let name = manager.resolve(&vm)?;
            let info = manager.show_info(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_config(&info.config, info.state);
            }
        }
        Commands::Edit(edit) => {
            let name = manager.resolve(&edit.vm)?;
            let report = manager.edit_vm(&name, edit.into_changes()).await?;
            println!("VM '{}' updated", name);
            if report.seed_regenerated {
                println!("Seed regenerated; the guest applies the new identity on its next boot");
            }
            if report.running {
                println!("The VM is running; restart it for the changes to take effect");
            }
        }
        Commands::Delete { vm, yes } => {
            let name = manager.resolve(&vm)?;
            let prompt = format!(
                "Delete VM '{}' together with its disk image and seed? [y/N] ",
                name
            );
            if !yes && !confirm(&prompt).await? {
                println!("Aborted");
                return Ok(());
            }
            manager.delete_vm(&name).await?;
            println!("VM '{}' deleted", name);
        }
        Commands::Resize { vm, size } => {
            let name = manager.resolve(&vm)?;
            let config = manager.resize_disk(&name, &size).await?;
            println!(
                "Disk of '{}' is now {}; the guest grows its filesystem on next boot",
                name, config.resources.disk_size
            );
        }
        Commands::Performance { vm, json } => {
            let name = manager.resolve(&vm)?;
            let perf = manager.show_performance(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&perf)?);
            } else if let Some(stats) = &perf.stats {
                println!("VM '{}' (PID {})", perf.name, stats.pid);
                println!("  CPU:     {}", percent(stats.cpu_percent));
                println!("  Memory:  {}", percent(stats.memory_percent));
                println!(
                    "  RSS:     {}",
                    stats
                        .rss_kib
                        .map(|kib| format!("{} MiB", kib / 1024))
                        .unwrap_or_else(|| "n/a".into())
                );
                println!(
                    "  Uptime:  {}",
                    stats.elapsed.as_deref().unwrap_or("n/a")
                );
                println!(
                    "  Disk:    {} allocated, {} apparent",
                    bytes(stats.image_allocated_bytes),
                    bytes(stats.image_apparent_bytes)
                );
            } else {
                println!("VM '{}' is {}", perf.name, perf.state);
            }
        }
        Commands::List { json } => {
            let summaries = manager.list_summaries().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No VMs in {}", manager.store().root().display());
            } else {
                println!("{:>3}  {:<20} {:<9} {:<18} SSH", "#", "NAME", "STATE", "OS");
                for vm in summaries {
                    println!(
                        "{:>3}  {:<20} {:<9} {:<18} {}",
                        vm.index,
                        vm.name,
                        vm.state.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
                        vm.os.unwrap_or_else(|| "?".into()),
                        vm.ssh_port
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "?".into())
                    );
                }
            }
        }
        Commands::OsList => {
            println!("{:<14} {:<8} {:<10} DEFAULT USER", "KEY", "VERSION", "CODENAME");
            for entry in CATALOG {
                println!(
                    "{:<14} {:<8} {:<10} {}",
                    entry.key, entry.version, entry.codename, entry.default_username
                );
            }
            println!("{:<14} use --image-url with an http, https or file URL", catalog::CUSTOM_OS);
        }
    }

    Ok(())
}

fn build_manager(args: &Args) -> anyhow::Result<Manager> {
    let requested = match &args.store_root {
        Some(root) => root.clone(),
        None => Settings::default_store_root()
            .ok_or_else(|| anyhow!("HOME is not set; pass --store-root or set CLOUDVM_HOME"))?,
    };

    // Correlation patterns compare absolute artifact paths.
    let store = ConfigStore::open(&requested).map_err(VmError::from)?;
    let root = store
        .root()
        .canonicalize()
        .with_context(|| format!("cannot resolve store root {:?}", requested))?;
    let store = ConfigStore::open(&root).map_err(VmError::from)?;
    info!("Using store at {:?}", root);

    let defaults = Tools::default();
    let mut settings = Settings::new(root);
    settings.tools = Tools {
        qemu: args.qemu.clone().unwrap_or(defaults.qemu),
        qemu_img: args.qemu_img.clone().unwrap_or(defaults.qemu_img),
        seed_tool: args.seed_tool.clone().unwrap_or(defaults.seed_tool),
        passwd_tool: args.passwd_tool.clone().unwrap_or(defaults.passwd_tool),
        pgrep: defaults.pgrep,
    };
    settings.port_range = args.port_range;
    settings.probe_host_ports = !args.no_port_probe;

    Ok(Lifecycle::new(
        store,
        QemuImagePreparer::new(settings.tools.clone()),
        QemuController::new(&settings),
        settings,
    ))
}

fn print_config(config: &VmConfig, state: RuntimeState) {
    println!("VM '{}' ({})", config.name, state);
    println!("  OS:        {} {} ({})", config.os.family, config.os.codename, config.os.image_url);
    println!("  Hostname:  {}", config.guest.hostname);
    println!("  Disk:      {}", config.resources.disk_size);
    println!("  Memory:    {} MB", config.resources.memory_mb);
    println!("  CPUs:      {}", config.resources.cpus);
    println!("  SSH port:  {}", config.network.ssh_port);
    if !config.network.forwards.is_empty() {
        let forwards: Vec<String> = config.network.forwards.iter().map(|f| f.to_string()).collect();
        println!("  Forwards:  {}", forwards.join(", "));
    }
    println!("  Display:   {}", if config.gui { "graphical" } else { "headless" });
    println!("  Image:     {}", config.artifacts.image.display());
    println!("  Seed:      {}", config.artifacts.seed.display());
    println!("  Created:   {}", config.created);
    print_access(config);
}

fn print_access(config: &VmConfig) {
    println!(
        "  Connect:   ssh -p {} {}@localhost",
        config.network.ssh_port, config.guest.username
    );
    println!("  Password (sensitive): {}", config.guest.password);
}

fn percent(value: Option<f32>) -> String {
    value
        .map(|v| format!("{:.1}%", v))
        .unwrap_or_else(|| "n/a".into())
}

fn bytes(value: Option<u64>) -> String {
    value
        .map(|b| format!("{:.1} GiB", b as f64 / (1u64 << 30) as f64))
        .unwrap_or_else(|| "n/a".into())
}

/// Anything but an explicit yes, including end of input, declines.
async fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
