///
/// This module implements the CLI interface for knowledge-sync: command parsing,
/// the async entrypoint and the user-visible summary of a run.
///
/// All reconciliation logic lives in the [`knowledge-sync-core`] crate; this module only
/// wires configuration, the HTTP client and the reconciler together.
///
/// ## How To Use
/// - For command-line users: `knowledge-sync sync --base-dir <dir> --config <file>`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// ## Exit status
/// [`run`] returns an error when the run aborts, is interrupted, or finishes with any
/// failed operation, so the binary exits nonzero in all three cases.
///
/// [`knowledge-sync-core`]: ../../knowledge-sync-core/
use crate::client::OpenWebUiClient;
use crate::load_config::load_config;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use knowledge_sync_core::synchronise::{synchronise, SynchroniseReport};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// CLI for knowledge-sync: mirror a directory tree into Open WebUI knowledge collections.
#[derive(Parser)]
#[clap(
    name = "knowledge-sync",
    version,
    about = "Synchronise directories of documents into Open WebUI knowledge collections"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload new and changed files, delete removed ones
    Sync {
        /// Directory whose subdirectories become collections
        #[clap(long)]
        base_dir: PathBuf,
        /// Path to the YAML or JSON connection config
        #[clap(long)]
        config: PathBuf,
        /// Log per-file detail
        #[clap(long)]
        verbose: bool,
    },
}

impl Cli {
    pub fn verbose(&self) -> bool {
        match &self.command {
            Commands::Sync { verbose, .. } => *verbose,
        }
    }
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            base_dir, config, ..
        } => {
            let cli_config = load_config(&config)?;
            let sync_config = cli_config.synchronise_config(base_dir);
            sync_config.trace_loaded();
            let client = OpenWebUiClient::from_config(&cli_config)
                .context("Failed to construct Open WebUI client")?;

            info!(command = "sync", "Starting synchronisation process");
            let interrupted = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };

            let report = tokio::select! {
                result = synchronise(&sync_config, &client) => {
                    result.context("Synchronisation aborted")?
                }
                _ = interrupted => {
                    warn!(command = "sync", "Interrupted, completed operations are kept in the state file");
                    bail!("synchronisation interrupted");
                }
            };

            print_report(&report);
            let summary = report.summary();
            if summary.failed > 0 {
                bail!(
                    "synchronisation finished with {} failed operation(s)",
                    summary.failed
                );
            }
            info!(command = "sync", "Synchronisation complete");
            Ok(())
        }
    }
}

fn print_report(report: &SynchroniseReport) {
    for collection in &report.collections {
        for doc in &collection.uploaded {
            debug!(collection = %collection.collection, path = %doc.relative_path, remote_id = %doc.remote_id, "uploaded");
        }
        for doc in &collection.adopted {
            debug!(collection = %collection.collection, path = %doc.relative_path, remote_id = %doc.remote_id, "adopted");
        }
        for doc in &collection.deleted {
            debug!(collection = %collection.collection, path = %doc.relative_path, remote_id = %doc.remote_id, "deleted");
        }
        debug!(
            collection = %collection.collection,
            display_name = %collection.display_name,
            skipped = collection.skipped,
            "collection done"
        );
    }
    for failure in report.all_failures() {
        error!(%failure, "failed");
    }
    println!("knowledge-sync: {}", report.summary());
}
