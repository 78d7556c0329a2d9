//! weaver-node: node-level maintenance for the Weaver file store.
//!
//! Run by the batch system on worker nodes: `sweep` after a worker died,
//! `shutdown` when the node is handed back, `inspect` to see what is there.
//!
//! This binary registers no deferred handlers, so it only replays the
//! built-in actions. A dead task whose record holds an `invoke` action is
//! reported as unresolved and left on disk for a worker process that has
//! the handler.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use weaver_filestore::FileStoreConfig;
use weaver_filestore::NodeContext;
use weaver_filestore::app::{SweepReport, find_and_handle_dead_tasks, inspect, shutdown};
use weaver_filestore::impls::LocalBackingStore;
use weaver_filestore::ports::BackingStore;

#[derive(Parser)]
#[command(name = "weaver-node")]
#[command(about = "Recover and tear down Weaver file store state on a node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run deferred cleanup of every task not owned by this process, then
    /// remove the node's task and cache directories (task records needing
    /// handlers this binary lacks are kept)
    Shutdown(NodeArgs),

    /// Run deferred cleanup of tasks whose process has died
    Sweep(NodeArgs),

    /// Print the task records on the node as JSON
    Inspect(NodeArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Node work directory (overrides the config file)
    workdir: Option<PathBuf>,

    /// TOML config file
    #[arg(long, short, env = "WEAVER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the local backing store (defaults to <workdir>/store)
    #[arg(long)]
    store: Option<PathBuf>,
}

impl NodeArgs {
    fn config(&self) -> Result<FileStoreConfig> {
        let config = match (&self.config, &self.workdir) {
            (Some(path), _) => FileStoreConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(workdir)) => FileStoreConfig::new(workdir),
            (None, None) => match std::env::var_os("WEAVER_WORKDIR") {
                Some(workdir) => FileStoreConfig::new(workdir),
                None => bail!("no work directory: pass one, --config, or set WEAVER_WORKDIR"),
            },
        };
        let mut config = config.with_env_overrides()?;
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        Ok(config)
    }

    fn node(&self) -> Result<(NodeContext, Arc<dyn BackingStore>)> {
        let config = self.config()?;
        let store_dir = self
            .store
            .clone()
            .unwrap_or_else(|| config.workdir.join("store"));
        let store: Arc<dyn BackingStore> = Arc::new(LocalBackingStore::new(store_dir));
        Ok((NodeContext::from_config(&config), store))
    }
}

fn warn_on(report: &SweepReport) {
    if report.failed_deferred() > 0 {
        tracing::warn!(failed = report.failed_deferred(), "some deferred functions failed");
    }
    for task in &report.unresolved {
        tracing::warn!(
            dir = %task.dir.display(),
            missing = ?task.missing,
            "left for a worker with these deferred handlers"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Shutdown(args) => {
            let (node, store) = args.node()?;
            let report = shutdown(&node, store).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            warn_on(&report);
        }
        Commands::Sweep(args) => {
            let (node, store) = args.node()?;
            let report = find_and_handle_dead_tasks(&node, store, false).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            warn_on(&report);
        }
        Commands::Inspect(args) => {
            let (node, _store) = args.node()?;
            let tasks = inspect(&node).await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
    }
    Ok(())
}
