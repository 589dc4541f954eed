//! foldsync CLI
//!
//! # Usage
//!
//! ```bash
//! # Register sequences
//! foldsync --config foldsync.yaml import uniprot_sprot.fasta
//!
//! # Show what would be scheduled, without touching the cluster
//! foldsync --config foldsync.yaml --dry-run submit
//!
//! # Full pass: submit, wait for the cluster, reconcile and commit
//! foldsync --config foldsync.yaml run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use foldsync_orchestration::{ClusterClient, DryRunCluster, LsfClient, RunReport, SyncConfig, SyncOrchestrator};
use foldsync_storage::{SourceFlag, SqliteRecordStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "foldsync")]
#[command(about = "Synchronise structure annotations with the sequence database", long_about = None)]
struct Cli {
    /// YAML configuration (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Record cluster submissions instead of sending them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register sequences from a FASTA file
    Import {
        fasta: PathBuf,

        /// external | recomputed
        #[arg(long, default_value = "recomputed")]
        source_flag: String,
    },

    /// Resolve and submit pending work items
    Submit {
        /// Block until every submitted job has left the cluster
        #[arg(long)]
        drain: bool,
    },

    /// Reconcile and commit every artifact-complete work item
    Reconcile,

    /// Submit, drain and reconcile in one pass
    Run,

    /// Print wanted / in-flight / completed / partial counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => SyncConfig::from_yaml(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let store = Arc::new(
        SqliteRecordStore::new(&config.database.path)
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );

    let dry_run = cli.dry_run.then(|| Arc::new(DryRunCluster::auto_advancing()));
    let cluster: Arc<dyn ClusterClient> = match &dry_run {
        Some(cluster) => cluster.clone(),
        None => Arc::new(LsfClient::new()),
    };

    let orchestrator = SyncOrchestrator::new(config, store, cluster);
    let report = match cli.command {
        Commands::Import { fasta, source_flag } => {
            let source_flag = SourceFlag::from_str(&source_flag)?;
            orchestrator.import_fasta(&fasta, source_flag).await?
        }
        Commands::Submit { drain } => orchestrator.submit(drain).await?,
        Commands::Reconcile => orchestrator.reconcile().await?,
        Commands::Run => orchestrator.run().await?,
        Commands::Status => orchestrator.status().await?,
    };

    if let Some(cluster) = &dry_run {
        for request in cluster.submissions() {
            println!("bsub {}", request.bsub_args().join(" "));
        }
    }
    print_report(&report, cli.json)?;

    if report.failed_total() > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}
