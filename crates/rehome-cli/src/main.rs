use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rehome_sync::SnapshotSource;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rehome-cli")]
#[command(about = "Sync a rescue organisation's adoptable dogs into the rehome catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the catalog against a listing snapshot.
    Sync(SyncArgs),
    /// Apply pending database migrations.
    Migrate,
    /// Summarise recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Reuse the last cached snapshot (default).
    #[arg(long, conflicts_with = "index")]
    cached: bool,
    /// Fetch the detail pages listed in this file and refresh the cache.
    #[arg(long, value_name = "FILE")]
    index: Option<PathBuf>,
}

impl SyncArgs {
    fn source(self) -> SnapshotSource {
        match self.index {
            Some(index) if !self.cached => SnapshotSource::Live { index },
            _ => SnapshotSource::Cached,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rehome=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = rehome_sync::run_sync_once_from_env(args.source()).await?;
            println!(
                "sync complete: run_id={} dogs +{} ~{} -{} images +{} -{} repaired={} dropped={} unknown_locations={}",
                summary.run_id,
                summary.counts.dogs_added,
                summary.counts.dogs_updated,
                summary.counts.dogs_deleted,
                summary.counts.images_added,
                summary.counts.images_deleted,
                summary.counts.images_repaired,
                summary.counts.dropped_listings,
                summary.counts.new_locations.len()
            );
        }
        Commands::Migrate => {
            rehome_sync::migrate_from_env().await?;
            info!("migrations applied");
        }
        Commands::Report { runs } => {
            let workspace = rehome_sync::SyncConfig::from_env().workspace_root;
            println!("{}", rehome_sync::report_recent_runs(runs, Some(workspace))?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_defaults_to_cached_snapshot() {
        let cli = Cli::try_parse_from(["rehome-cli", "sync"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.source(), SnapshotSource::Cached);
    }

    #[test]
    fn index_selects_live_snapshot() {
        let cli = Cli::try_parse_from(["rehome-cli", "sync", "--index", "pages.txt"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(
            args.source(),
            SnapshotSource::Live {
                index: PathBuf::from("pages.txt")
            }
        );
    }

    #[test]
    fn cached_and_index_conflict() {
        assert!(Cli::try_parse_from(["rehome-cli", "sync", "--cached", "--index", "p.txt"]).is_err());
    }
}
