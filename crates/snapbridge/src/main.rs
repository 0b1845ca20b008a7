use clap::{Args, Parser, Subcommand};
use serde_json::json;
use snapbridge_admin::{
    CephCli, CephCliConfig, ImageIdSpec, ImageSpec, RbdAdmin, TaskAdmin, TaskResponse,
};
use snapbridge_native::sys::KNOWN_SYMBOLS;
use snapbridge_native::{BridgeError, NativeLibrary, SymbolResolver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "snapbridge", about = "Snapshot diff bridge and RBD task administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which optional librbd and libcephfs entry points resolve
    Probe {
        /// Shared library to load instead of searching the running process
        #[arg(long, env = "SNAPBRIDGE_LIBRARY")]
        library: Option<PathBuf>,
        /// Symbol to check (repeatable, defaults to all known entry points)
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Manage background image tasks through the manager
    Task {
        #[command(flatten)]
        ceph: CephArgs,
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Args)]
struct CephArgs {
    /// Path to the ceph CLI
    #[arg(long, env = "CEPH_BIN", default_value = "ceph")]
    ceph_bin: String,
    /// Ceph configuration file
    #[arg(long, env = "CEPH_CONF")]
    conf: Option<PathBuf>,
    /// Cluster name
    #[arg(long, env = "CEPH_CLUSTER")]
    cluster: Option<String>,
    /// Client id to authenticate as
    #[arg(long = "id", env = "CEPH_ID")]
    client_id: Option<String>,
}

impl From<CephArgs> for CephCliConfig {
    fn from(args: CephArgs) -> Self {
        CephCliConfig {
            program: args.ceph_bin,
            conf: args.conf,
            cluster: args.cluster,
            client_id: args.client_id,
        }
    }
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List all tasks
    List,
    /// Show a single task
    Get { task_id: String },
    /// Cancel a pending or running task
    Cancel { task_id: String },
    /// Queue a flatten of a cloned image
    Flatten { image_spec: String },
    /// Queue removal of an image
    Remove { image_spec: String },
    /// Queue removal of a trashed image by id
    TrashRemove { image_id_spec: String },
    /// Queue a migration commit
    MigrationCommit { image_spec: String },
    /// Queue a migration abort
    MigrationAbort { image_spec: String },
    /// Queue a migration execute
    MigrationExecute { image_spec: String },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probe { library, symbols } => run_probe(library, symbols),
        Commands::Task { ceph, command } => run_task(ceph.into(), command).await,
    }
}

/// Resolve each symbol and print availability as JSON
fn run_probe(library: Option<PathBuf>, symbols: Vec<String>) -> miette::Result<()> {
    let native = match &library {
        Some(path) => NativeLibrary::open(path)?,
        None => NativeLibrary::process(),
    };
    info!(
        "Probing {}",
        native.path().unwrap_or("the running process")
    );

    let resolver = SymbolResolver::new(native);
    let names: Vec<String> = if symbols.is_empty() {
        KNOWN_SYMBOLS.iter().map(|s| s.to_string()).collect()
    } else {
        symbols
    };

    let report: Vec<_> = names
        .iter()
        .map(|name| match resolver.resolve(name) {
            Ok(_) => json!({ "symbol": name, "available": true }),
            Err(BridgeError::NotImplemented { reason, .. }) => {
                json!({ "symbol": name, "available": false, "reason": reason })
            }
            Err(e) => json!({ "symbol": name, "available": false, "reason": e.to_string() }),
        })
        .collect();

    print_json(&report)
}

async fn run_task(config: CephCliConfig, command: TaskCommand) -> miette::Result<()> {
    let cli = CephCli::new(config)?;
    let tasks: TaskAdmin = RbdAdmin::new(Arc::new(cli)).task();

    match command {
        TaskCommand::List => {
            let list = tasks.list().await?;
            info!("{} task(s)", list.len());
            print_json(&list)
        }
        TaskCommand::Get { task_id } => print_task(tasks.get_task(&task_id).await?),
        TaskCommand::Cancel { task_id } => print_task(tasks.cancel(&task_id).await?),
        TaskCommand::Flatten { image_spec } => {
            print_task(tasks.add_flatten(&ImageSpec::raw(image_spec)).await?)
        }
        TaskCommand::Remove { image_spec } => {
            print_task(tasks.add_remove(&ImageSpec::raw(image_spec)).await?)
        }
        TaskCommand::TrashRemove { image_id_spec } => {
            print_task(tasks.add_trash_remove(&ImageIdSpec::raw(image_id_spec)).await?)
        }
        TaskCommand::MigrationCommit { image_spec } => {
            print_task(tasks.add_migration_commit(&ImageSpec::raw(image_spec)).await?)
        }
        TaskCommand::MigrationAbort { image_spec } => {
            print_task(tasks.add_migration_abort(&ImageSpec::raw(image_spec)).await?)
        }
        TaskCommand::MigrationExecute { image_spec } => {
            print_task(tasks.add_migration_execute(&ImageSpec::raw(image_spec)).await?)
        }
    }
}

fn print_task(task: TaskResponse) -> miette::Result<()> {
    print_json(&task)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> miette::Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("Failed to encode output: {}", e))?;
    println!("{}", out);
    Ok(())
}
