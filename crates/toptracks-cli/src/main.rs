use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use toptracks_catalog::{CatalogClient, FixtureCatalog};
use toptracks_query::{parse_filter, QueryEngine};
use toptracks_storage::Store;
use toptracks_sync::{
    build_scheduler, load_artist_list, SkipFailedArtists, StoreMerger, SyncConfig, SyncPipeline,
};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "toptracks")]
#[command(about = "Sync artists' top tracks from the catalog and query the latest snapshot")]
struct Cli {
    /// JSON array of artist names to sync before querying.
    #[arg(long, global = true)]
    artists_json: Option<PathBuf>,

    /// Comma-separated artist names or ids to report on.
    #[arg(long, global = true)]
    filter: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_ID", hide_env_values = true, global = true)]
    client_id: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,

    /// Serve catalog lookups from a JSON fixture instead of Spotify.
    #[arg(long, global = true)]
    catalog_fixture: Option<PathBuf>,

    /// Keep going when an artist cannot be fetched.
    #[arg(long, global = true)]
    skip_failed_artists: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open the store and apply pending migrations.
    Migrate,
    /// Merge staging files already on disk without fetching.
    Merge,
    /// Run the sync on a cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("toptracks failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<toptracks_core::Error>())
        .map(toptracks_core::Error::exit_code)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::from_env();
    if cli.client_id.is_some() {
        config.client_id = cli.client_id.clone();
    }
    if cli.client_secret.is_some() {
        config.client_secret = cli.client_secret.clone();
    }

    match &cli.command {
        Some(Commands::Migrate) => {
            let store = Store::open(&config.database_path).await?;
            let counts = store.counts().await?;
            println!(
                "store ready: path={} artists={} top_tracks={}",
                config.database_path.display(),
                counts.artists,
                counts.top_tracks
            );
            store.close().await;
        }
        Some(Commands::Merge) => {
            let store = Store::open(&config.database_path).await?;
            let report = StoreMerger::new(store.clone())
                .merge_directory(&config.staging_dir)
                .await?;
            for file in &report.files {
                println!("merged {} ({} rows)", file.path.display(), file.rows);
            }
            println!("merge complete: files={} rows={}", report.files.len(), report.rows());
            store.close().await;
        }
        Some(Commands::Schedule { cron }) => {
            let artists_path = cli.artists_json.as_ref().ok_or_else(|| {
                toptracks_core::Error::InvalidInput(
                    "schedule needs --artists-json to know which artists to sync".to_string(),
                )
            })?;
            let artists = load_artist_list(artists_path).await?;
            let store = Store::open(&config.database_path).await?;
            let pipeline = Arc::new(build_pipeline(&cli, &config, store.clone())?);
            let cron = cron.clone().unwrap_or_else(|| config.sync_cron.clone());

            let mut sched = build_scheduler(pipeline, artists, &cron).await?;
            sched
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("starting scheduler: {e:?}"))?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("shutting down scheduler");
            sched
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("stopping scheduler: {e:?}"))?;
            store.close().await;
        }
        None => run_default(&cli, &config).await?,
    }

    Ok(())
}

/// Optional sync pass, then the artist listing and the filtered report.
async fn run_default(cli: &Cli, config: &SyncConfig) -> Result<()> {
    let tokens = cli
        .filter
        .as_deref()
        .map(parse_filter)
        .transpose()?
        .unwrap_or_default();
    let artists = match &cli.artists_json {
        Some(path) => Some(load_artist_list(path).await?),
        None => None,
    };

    let store = Store::open(&config.database_path).await?;

    if let Some(artists) = artists {
        let pipeline = build_pipeline(cli, config, store.clone())?;
        let summary = pipeline.run_once(&artists).await?;
        if let Some(reason) = &summary.staging_error {
            warn!(%reason, "staging failed during sync");
        }
        if summary.up_to_date() {
            println!("sync skipped: every requested artist already has today's records");
        } else {
            println!(
                "sync complete: run_id={} fetched={} skipped={} staged_rows={} merged_files={} merged_rows={}",
                summary.run_id,
                summary.fetched_artists,
                summary.skipped_artists.len(),
                summary.staged_rows,
                summary.merged_files,
                summary.merged_rows
            );
            for path in &summary.staged_files {
                println!("staged {}", path.display());
            }
        }
    }

    let engine = QueryEngine::new(store.clone());
    let listing = engine.list_all().await?;
    println!("Artists in store:");
    for artist in listing {
        println!("{} - {}", artist.artist_id, artist.artist_name);
    }

    let reports = engine.query(&tokens).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);

    store.close().await;
    Ok(())
}

fn build_pipeline(cli: &Cli, config: &SyncConfig, store: Store) -> Result<SyncPipeline> {
    let catalog: Arc<dyn CatalogClient> = match &cli.catalog_fixture {
        Some(path) => Arc::new(FixtureCatalog::load(path)?),
        None => Arc::new(config.spotify_catalog()?),
    };
    info!(catalog = catalog.catalog_id(), "catalog ready");

    let mut pipeline = SyncPipeline::new(store, catalog, config.staging_writer());
    if cli.skip_failed_artists {
        pipeline = pipeline.with_failure_policy(Box::new(SkipFailedArtists));
    }
    Ok(pipeline)
}
