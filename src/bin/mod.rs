use std::{io, path::PathBuf};

use clap::{Parser, Subcommand};
use packrestore::{
    command::{
        backup::backup,
        restore::{RestoreOptions, restore},
    },
    config::{BackupConfig, RestoreConfig},
    storage::LocalStorage,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, level_filters::LevelFilter, warn};

#[derive(Debug, Clone, Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Store a directory tree in a repository.
    Backup {
        source: PathBuf,
        repository: PathBuf,
        /// Snapshot whose blobs are reused instead of uploaded again.
        #[arg(long)]
        parent: Option<String>,
    },
    /// Restore a snapshot into a directory.
    Restore {
        destination: PathBuf,
        repository: PathBuf,
        snapshot: String,
        #[arg(long, default_value_t = RestoreConfig::default().connections)]
        connections: usize,
        #[arg(long, default_value_t = false)]
        sparse: bool,
        #[arg(long, default_value_t = false)]
        allow_recursive_delete: bool,
        #[arg(long, default_value_t = false)]
        ignore_errors: bool,
    },
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();

    match args.command {
        Commands::Backup {
            source,
            repository,
            parent,
        } => {
            let storage = LocalStorage::new(repository).await?;
            let id = backup(source, parent, &storage, BackupConfig::default()).await?;

            println!("{id}");
        }
        Commands::Restore {
            destination,
            repository,
            snapshot,
            connections,
            sparse,
            allow_recursive_delete,
            ignore_errors,
        } => {
            let storage = LocalStorage::new(repository).await?;
            let options = RestoreOptions {
                config: RestoreConfig {
                    connections,
                    sparse,
                    allow_recursive_delete,
                },
                ignore_errors,
            };

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping restore");
                    on_interrupt.cancel();
                }
            });

            let summary = restore(destination, &snapshot, storage, &options, &cancel)
                .await
                .map_err(io::Error::other)?;

            if !summary.failures.is_empty() {
                for (path, reason) in &summary.failures {
                    error!(path = %path.display(), %reason, "not restored");
                }
                return Err(io::Error::other(format!(
                    "{} files could not be restored",
                    summary.failures.len()
                )));
            }
        }
    }

    Ok(())
}
