use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use multivol::{
    catalog::Catalog,
    config::Config,
    model::{Depth, ModuleStatus, OutputFormat, ScanId, ScanRequest, ScanStatus, TargetOs, ToolVariant},
    output::{print_modules_table, print_results, print_scans, print_status, DisplayFormat},
    Error, ResultSelector, ScanStatusReport, Supervisor,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit codes for scripting
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const REJECTED: u8 = 3;
    pub const MODULES_FAILED: u8 = 4;
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "multivol")]
#[command(
    author,
    version,
    about = "Run memory-forensics modules in parallel containers and track their results"
)]
struct Cli {
    /// Path to an alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a scan and follow it until it finishes
    Scan(ScanArgs),

    /// Show a scan and its modules
    Status {
        id: ScanId,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: DisplayFormat,
    },

    /// Print module results as JSON
    Results {
        id: ScanId,

        /// Module to print, or "all"
        #[arg(short, long, default_value = "all")]
        module: ResultSelector,
    },

    /// List all scans
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: DisplayFormat,
    },

    /// Run a single module of an existing scan again
    Run { id: ScanId, module: String },

    /// Rename a scan
    Rename { id: ScanId, name: String },

    /// Delete a finished scan and its output directory
    Delete { id: ScanId },

    /// Fail scans that have been active for too long
    Sweep,

    /// Show the modules a scan would run
    Modules {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        depth: DepthArgs,
    },

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Use Volatility 2
    #[arg(long, conflicts_with = "vol3")]
    vol2: bool,

    /// Use Volatility 3 (default)
    #[arg(long)]
    vol3: bool,

    /// The dump is from a Windows host
    #[arg(long, conflicts_with = "linux", required_unless_present = "linux")]
    windows: bool,

    /// The dump is from a Linux host
    #[arg(long)]
    linux: bool,
}

impl TargetArgs {
    fn variant(&self) -> ToolVariant {
        if self.vol2 {
            ToolVariant::Vol2
        } else {
            ToolVariant::Vol3
        }
    }

    fn os(&self) -> TargetOs {
        if self.linux {
            TargetOs::Linux
        } else {
            TargetOs::Windows
        }
    }
}

#[derive(Args)]
struct ScanArgs {
    /// Path to the memory dump
    #[arg(short, long)]
    dump: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    #[command(flatten)]
    depth: DepthArgs,

    /// Comma-separated modules, replacing the catalog list
    #[arg(short, long)]
    modules: Option<String>,

    /// Artifact format written by the tool (json, text)
    #[arg(long, default_value = "json")]
    format: OutputFormat,

    /// Container image to run instead of the configured one
    #[arg(long)]
    image: Option<String>,

    /// Volatility 2 profile, e.g. Win7SP1x64
    #[arg(long)]
    profile: Option<String>,

    /// Display name of the scan
    #[arg(long)]
    name: Option<String>,

    /// Fetch symbol tables remotely (default: on for Linux dumps)
    #[arg(long, conflicts_with = "no_fetch_symbol")]
    fetch_symbol: bool,

    /// Never fetch symbol tables remotely
    #[arg(long)]
    no_fetch_symbol: bool,

    /// Maximum number of concurrent containers (default: CPU count)
    #[arg(short = 'j', long)]
    processes: Option<usize>,

    /// Report format (table, json)
    #[arg(long, default_value = "table")]
    report: DisplayFormat,
}

#[derive(Args)]
struct DepthArgs {
    /// Run the light module set (default)
    #[arg(long, conflicts_with = "full")]
    light: bool,

    /// Run the full module set
    #[arg(long)]
    full: bool,
}

impl DepthArgs {
    fn depth(&self) -> Depth {
        if self.full {
            Depth::Full
        } else {
            Depth::Light
        }
    }
}

impl ScanArgs {
    fn request(&self) -> ScanRequest {
        let mut request = ScanRequest::new(&self.dump, self.target.variant(), self.target.os())
            .with_depth(self.depth.depth())
            .with_format(self.format);
        request.modules = self.modules.clone();
        request.image = self.image.clone();
        request.profile = self.profile.clone();
        request.name = self.name.clone();
        request.max_parallelism = self.processes;
        request.fetch_symbol = if self.fetch_symbol {
            Some(true)
        } else if self.no_fetch_symbol {
            Some(false)
        } else {
            None
        };
        request
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(error_exit_code(&e))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "multivol=debug" } else { "multivol=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn error_exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::ConcurrentScan(_)) | Some(Error::ModuleBusy { .. }) => exit_codes::REJECTED,
        _ => exit_codes::ERROR,
    }
}

/// Opens the scan database and fails scans left over from a dead process.
async fn open_supervisor(config: Config) -> Result<Supervisor> {
    let database = config.database_path();
    let supervisor = Supervisor::open(config)
        .await
        .with_context(|| format!("Failed to open scan database {}", database.display()))?;
    if let Err(e) = supervisor.sweep_stale_scans().await {
        warn!(error = %e, "Startup staleness sweep failed");
    }
    Ok(supervisor)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };

    match cli.command {
        Commands::Scan(args) => run_scan(config, args).await,
        Commands::Status { id, format } => {
            let supervisor = open_supervisor(config).await?;
            let report = supervisor.get_scan_status(&id).await?;
            print_status(&report, format)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Results { id, module } => {
            let supervisor = open_supervisor(config).await?;
            let results = supervisor.get_results(&id, &module).await?;
            print_results(&results)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::List { format } => {
            let supervisor = open_supervisor(config).await?;
            let scans = supervisor.list_scans().await?;
            print_scans(&scans, format)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Run { id, module } => run_module(config, id, module).await,
        Commands::Rename { id, name } => {
            let supervisor = open_supervisor(config).await?;
            supervisor.rename_scan(&id, &name).await?;
            println!("Renamed scan {} to {}", id, name.trim());
            Ok(exit_codes::SUCCESS)
        }
        Commands::Delete { id } => {
            let supervisor = open_supervisor(config).await?;
            let scan = supervisor.delete_scan(&id).await?;
            println!("Deleted scan {} ({})", id, scan.display_name());
            Ok(exit_codes::SUCCESS)
        }
        Commands::Sweep => {
            let supervisor = Supervisor::open(config).await?;
            let failed = supervisor.sweep_stale_scans().await?;
            if failed.is_empty() {
                println!("No stale scans.");
            } else {
                for id in &failed {
                    println!("Failed stale scan {}", id);
                }
            }
            Ok(exit_codes::SUCCESS)
        }
        Commands::Modules { target, depth } => {
            let catalog = Catalog::load(config.catalog_path.as_deref())?;
            let depth = depth.depth();
            let modules = catalog.resolve(target.variant(), target.os(), depth, None)?;
            println!(
                "{} {} {} ({} modules):",
                target.variant().display_name(),
                target.os(),
                depth,
                modules.len()
            );
            print_modules_table(&modules)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

async fn run_scan(config: Config, args: ScanArgs) -> Result<u8> {
    let is_interactive = args.report == DisplayFormat::Table;
    let supervisor = open_supervisor(config).await?;
    let sweeper = supervisor.spawn_sweeper(supervisor.config().sweep_interval());

    let admitted = supervisor.admit_scan(args.request()).await?;
    let id = admitted.id();
    if is_interactive {
        println!(
            "Scan {} started: {} modules, outputs in {}",
            id,
            admitted.modules.len(),
            admitted.output_dir().display()
        );
    }

    let progress = if is_interactive {
        let pb = ProgressBar::new(admitted.modules.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let mut driver = admitted.task;
    let interrupted = loop {
        tokio::select! {
            joined = &mut driver => {
                if let Err(e) = joined {
                    warn!(scan_id = %id, error = %e, "Scan driver stopped unexpectedly");
                }
                break false;
            }
            _ = tokio::signal::ctrl_c() => break true,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Some(pb) = &progress {
                    if let Ok(tasks) = supervisor.store().list_module_tasks(&id).await {
                        let finished = tasks.iter().filter(|t| t.status.is_terminal()).count();
                        let running = tasks
                            .iter()
                            .filter(|t| t.status == ModuleStatus::Running)
                            .count();
                        pb.set_position(finished as u64);
                        pb.set_message(format!("{} running", running));
                    }
                }
            }
        }
    };
    sweeper.abort();

    if interrupted {
        if let Some(pb) = progress {
            pb.abandon_with_message("interrupted");
        }
        eprintln!(
            "Stopped following scan {}. Started containers keep running; check with 'multivol status {}'.",
            id, id
        );
        return Ok(exit_codes::ERROR);
    }

    let report = supervisor.get_scan_status(&id).await?;
    if let Some(pb) = progress {
        pb.finish_with_message(format!("{} valid results", report.valid_results));
    }
    print_status(&report, args.report)?;
    Ok(scan_exit_code(&report))
}

async fn run_module(config: Config, id: ScanId, module: String) -> Result<u8> {
    let supervisor = open_supervisor(config).await?;
    let handle = supervisor.run_single_module(&id, &module).await?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Running {}...", module));

    let outcome = handle.await?;
    if outcome.success {
        pb.finish_with_message(format!("{} completed", module));
        Ok(exit_codes::SUCCESS)
    } else {
        pb.finish_with_message(format!(
            "{} failed: {}",
            module,
            outcome.error.as_deref().unwrap_or("unknown error")
        ));
        Ok(exit_codes::MODULES_FAILED)
    }
}

fn scan_exit_code(report: &ScanStatusReport) -> u8 {
    if report.scan.status == ScanStatus::Failed {
        exit_codes::ERROR
    } else if report.count(ModuleStatus::Failed) > 0 || report.soft_failure {
        exit_codes::MODULES_FAILED
    } else {
        exit_codes::SUCCESS
    }
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'multivol config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}
