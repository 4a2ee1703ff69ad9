//! Slotkeeper server binary
//!
//! Command-line interface with support for:
//! - Running the allocation server
//! - Provisioning the counter table
//! - Printing per-group status
//! - Recovering interrupted completions
//!
//! # Examples
//!
//! ```bash
//! # Create 12 groups of 115 folders
//! slotkeeper provision --groups 12 --folders 115
//!
//! # Start server
//! slotkeeper serve --bind 0.0.0.0 --port 8000
//!
//! # Show how many folders each group has used
//! slotkeeper status
//! ```

use clap::{Args, Parser, Subcommand};
use slotkeeper::config::{FileConfig, StoragePaths};
use slotkeeper::server::{start_server, ServerConfig};
use slotkeeper::storage::{JsonCounterTable, JsonLogStore};
use slotkeeper::{FolderService, ServiceOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Slotkeeper - folder slot allocation service
#[derive(Parser, Debug)]
#[command(name = "slotkeeper")]
#[command(version = slotkeeper::VERSION)]
#[command(about = "Folder slot allocation service with a durable audit log", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "SLOTKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Audit log file (JSON array)
    #[arg(long, global = true, env = "SLOTKEEPER_LOG_PATH")]
    log_path: Option<PathBuf>,

    /// Counter table file (JSON object)
    #[arg(long, global = true, env = "SLOTKEEPER_COUNTER_PATH")]
    counter_path: Option<PathBuf>,

    /// Directory for the rolling diagnostic log
    #[arg(long, global = true, default_value = "logs", env = "SLOTKEEPER_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the allocation server
    Serve(ServeArgs),

    /// Write a fresh counter table
    Provision(ProvisionArgs),

    /// Show per-group folder usage
    Status,

    /// Recover completions interrupted between the log and the counters
    Reconcile,

    /// Show version
    Version,
}

/// Server configuration arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long, env = "SLOTKEEPER_BIND")]
    bind: Option<String>,

    /// HTTP port
    #[arg(short, long, env = "SLOTKEEPER_PORT")]
    port: Option<u16>,

    /// Enable CORS
    #[arg(long)]
    cors: Option<bool>,

    /// Maximum request body size (MB)
    #[arg(long)]
    max_body_size: Option<usize>,

    /// Folder range used once a group has no fresh folder left
    #[arg(long, env = "SLOTKEEPER_TOTAL_SLOTS")]
    total_slots: Option<usize>,
}

/// Provisioning arguments
#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Number of groups (ids 1..=groups)
    #[arg(long, default_value = "12")]
    groups: u32,

    /// Folders per group
    #[arg(long, default_value = "115")]
    folders: usize,

    /// Overwrite an existing counter file
    #[arg(short, long)]
    force: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let _guard = setup_logging(&cli)?;

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let paths = StoragePaths::resolve(
        cli.log_path.clone(),
        cli.counter_path.clone(),
        &file_config.storage,
    );

    match cli.command {
        Commands::Serve(args) => serve_command(paths, &file_config, args).await,
        Commands::Provision(args) => provision_command(paths, args),
        Commands::Status => status_command(paths, &file_config).await,
        Commands::Reconcile => reconcile_command(paths, &file_config).await,
        Commands::Version => {
            println!("slotkeeper {}", slotkeeper::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "slotkeeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(guard)
}

fn stores(paths: &StoragePaths) -> (Arc<JsonLogStore>, Arc<JsonCounterTable>) {
    (
        Arc::new(JsonLogStore::open(&paths.log_path)),
        Arc::new(JsonCounterTable::new(&paths.counter_path)),
    )
}

fn options(total_slots: Option<usize>) -> ServiceOptions {
    ServiceOptions {
        total_slots,
        rng_seed: None,
    }
}

/// Open the stores and recover interrupted completions
async fn open_service(
    paths: &StoragePaths,
    total_slots: Option<usize>,
) -> anyhow::Result<Arc<FolderService>> {
    let (log, counters) = stores(paths);
    let service = FolderService::open(log, counters, options(total_slots)).await?;
    Ok(Arc::new(service))
}

/// Serve command - start the allocation server
async fn serve_command(
    paths: StoragePaths,
    file_config: &FileConfig,
    args: ServeArgs,
) -> anyhow::Result<()> {
    info!(version = %slotkeeper::VERSION, "slotkeeper starting");
    info!(
        log = %paths.log_path.display(),
        counters = %paths.counter_path.display(),
        "Storage locations"
    );

    let server = &file_config.server;
    let defaults = ServerConfig::default();
    let server_config = ServerConfig {
        http_addr: args
            .bind
            .or_else(|| server.bind.clone())
            .unwrap_or(defaults.http_addr),
        http_port: args.port.or(server.port).unwrap_or(defaults.http_port),
        enable_cors: args.cors.or(server.cors).unwrap_or(defaults.enable_cors),
        max_body_size: args
            .max_body_size
            .or(server.max_body_size_mb)
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(defaults.max_body_size),
    };

    let total_slots = args.total_slots.or(file_config.allocation.total_slots);
    let service = open_service(&paths, total_slots).await?;

    start_server(server_config, service).await
}

/// Provision command - write a fresh counter table
fn provision_command(paths: StoragePaths, args: ProvisionArgs) -> anyhow::Result<()> {
    let table = JsonCounterTable::new(&paths.counter_path);
    table.provision(args.groups, args.folders, args.force)?;
    println!(
        "Provisioned {} groups x {} folders in {}",
        args.groups,
        args.folders,
        paths.counter_path.display()
    );
    Ok(())
}

/// Status command - print per-group usage without writing anything
async fn status_command(paths: StoragePaths, file_config: &FileConfig) -> anyhow::Result<()> {
    let (log, counters) = stores(&paths);
    let service =
        FolderService::inspect(log, counters, options(file_config.allocation.total_slots)).await?;
    let report = service.status().await?;

    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for group in &report.groups {
        println!(
            "Group {}: {} used, {} fresh of {}",
            group.group_id, group.used, group.fresh, group.folders
        );
    }
    println!(
        "Transactions: {} pending, {} completed",
        report.transactions.pending, report.transactions.completed
    );
    if report.unsettled > 0 {
        println!(
            "{} completed folders await their counter update (run `slotkeeper reconcile`)",
            report.unsettled
        );
    }
    Ok(())
}

/// Reconcile command - recover interrupted completions and report what changed
async fn reconcile_command(paths: StoragePaths, file_config: &FileConfig) -> anyhow::Result<()> {
    let service = open_service(&paths, file_config.allocation.total_slots).await?;
    let report = service.recovery();

    if report.is_clean() {
        println!("Counters match the audit log");
    }
    for (group, folder) in &report.repaired {
        println!("Repaired group {} folder {}", group, folder);
    }
    for transaction in &report.discarded {
        println!("Dropped decrement of transaction {} (never completed)", transaction);
    }
    for (group, folder) in &report.diverged {
        println!(
            "Group {} folder {} was edited outside the service; counter left as is",
            group, folder
        );
    }
    for (group, folder) in &report.orphaned {
        println!("Completed folder {} of group {} is missing from the counter table", folder, group);
    }
    for (group, folder) in &report.unsettled {
        println!("Group {} folder {} could not be updated; retry later", group, folder);
    }

    if report.unsettled.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} decrements left unsettled", report.unsettled.len())
    }
}
