mod flow;
mod progress;
mod prompt;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use flow::{App, RunOptions};
use prompt::Prompter;
use rmcard_catalog::Backend;
use rmcard_config::JsonConfigStore;
use rmcard_core::{InventorySource, TargetCardSpec};
use rmcard_host_linux::{running_as_root, LinuxInventory};
use rmcard_provision::{BackendChoice, Vram};
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prepares RM-01 CFe-B cards from a master disk.
#[derive(Parser, Debug)]
#[command(name = "rmcard", version, about)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true, env = "RMCARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RMCARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "RMCARD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the block device inventory as JSON
    Devices {
        #[arg(long)]
        pretty: bool,
    },
    /// Show the master disk and how each device classifies
    Detect,
    /// Record the master disk and scan its models
    Setup {
        /// Master disk root; detected or asked for when omitted
        #[arg(long)]
        disk: Option<PathBuf>,
    },
    /// List models found by the last setup
    Models {
        #[arg(long)]
        manufacturer: Option<String>,
    },
    /// Resolve the inference backend for a model name
    Backend {
        #[arg(long)]
        model: String,
        /// Use this manifest instead of the master disk and card
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Provision the attached target card
    Run(RunArgs),
    /// Unmount the target card's partitions
    Unmount {
        /// Kernel device name; defaults to the last target card used
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    #[arg(long)]
    manufacturer: Option<String>,

    /// Model folder name or parsed model name
    #[arg(long)]
    model: Option<String>,

    /// VRAM size for dev-mode configs: 32G, 48G, 64G or 128G
    #[arg(long)]
    vram: Option<Vram>,

    /// Skip dev-mode configs
    #[arg(long, conflicts_with = "vram")]
    no_dev_config: bool,

    /// Also stage fused-MoE tuning configs
    #[arg(long, requires = "vram")]
    fused_moe: bool,

    /// Allow writing to non-removable media
    #[arg(long)]
    allow_fixed: bool,

    /// Write a run report bundle under this directory
    #[arg(long)]
    report_base: Option<PathBuf>,

    /// Unmount the card when finished
    #[arg(long)]
    unmount: bool,

    /// Do not ask; take defaults for anything not given
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    FlashAttention,
    FlashInfer,
    Auto,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::FlashAttention => BackendChoice::Manual(Backend::FlashAttention),
            BackendArg::FlashInfer => BackendChoice::Manual(Backend::FlashInfer),
            BackendArg::Auto => BackendChoice::Auto,
        }
    }
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            backend: args.backend.map(BackendChoice::from),
            manufacturer: args.manufacturer,
            model: args.model,
            vram: args.vram,
            skip_dev_config: args.no_dev_config,
            fused_moe: args.fused_moe,
            allow_fixed: args.allow_fixed,
            report_base: args.report_base,
            unmount: args.unmount,
            assume_yes: args.yes,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    if !running_as_root() {
        warn!("not running as root; writing the card or unmounting may fail, consider sudo");
    }

    let store = JsonConfigStore::locate(cli.config.as_deref());
    debug!(config = %store.path().display(), "configuration file");
    let inventory = LinuxInventory::default();

    if let Some(Command::Devices { pretty }) = &cli.command {
        let snapshot = inventory.snapshot()?;
        if *pretty {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            println!("{}", serde_json::to_string(&snapshot)?);
        }
        return Ok(());
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    let mut app = App {
        store: &store,
        inventory: &inventory,
        prompter: Prompter::new(&mut input, &mut output),
        spec: TargetCardSpec::default(),
    };

    match cli.command {
        None => app.menu(),
        Some(Command::Devices { .. }) => Ok(()),
        Some(Command::Detect) => app.detect(),
        Some(Command::Setup { disk }) => app.setup(disk).map(|_| ()),
        Some(Command::Models { manufacturer }) => app.models(manufacturer.as_deref()),
        Some(Command::Backend { model, manifest }) => app.backend(&model, manifest),
        Some(Command::Run(args)) => app.run(&RunOptions::from(args)),
        Some(Command::Unmount { device }) => app.unmount(device.as_deref()),
    }
}

/// Logs go to stderr so prompts and reports on stdout stay readable.
fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(io::stderr))
            .init();
    }
}
