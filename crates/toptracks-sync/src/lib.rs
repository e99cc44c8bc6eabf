//! Sync pipeline: freshness check, catalog fetch, staging, and merge into the store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use toptracks_catalog::{CatalogClient, CatalogError, SpotifyCatalog, SpotifyCredentials};
use toptracks_core::{
    day_key, now_local, today, Artist, ArtistTopTracks, Error, Result, TopTrackRecord,
};
use toptracks_storage::{
    list_staging_files, read_staging_file, HttpClientConfig, HttpFetcher, StageOutcome,
    StagingWriter, Store,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "toptracks-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub staging_dir: PathBuf,
    pub running_file: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
    pub market: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_path: var("TOPTRACKS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/toptracks.db")),
            staging_dir: var("TOPTRACKS_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            running_file: var("TOPTRACKS_RUNNING_FILE")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            user_agent: var("TOPTRACKS_USER_AGENT")
                .unwrap_or_else(|| format!("toptracks/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: var("TOPTRACKS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sync_cron: var("TOPTRACKS_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            market: var("TOPTRACKS_MARKET"),
            client_id: var("SPOTIFY_CLIENT_ID").or_else(|| var("spotify_client_id")),
            client_secret: var("SPOTIFY_CLIENT_SECRET").or_else(|| var("spotify_client_secret")),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn staging_writer(&self) -> StagingWriter {
        StagingWriter::new(self.staging_dir.clone()).with_running_file(self.running_file)
    }

    pub fn spotify_catalog(&self) -> Result<SpotifyCatalog> {
        let credentials = SpotifyCredentials::new(self.client_id.clone(), self.client_secret.clone())
            .map_err(|e| Error::Config(e.to_string()))?;
        let http = HttpFetcher::new(self.http_config())
            .map_err(|e| Error::Config(format!("building http client: {e}")))?;
        Ok(SpotifyCatalog::new(http, credentials).with_market(self.market.clone()))
    }
}

/// Read the JSON array of artist names to sync.
///
/// Entries are trimmed and de-duplicated case-insensitively, first spelling wins.
pub async fn load_artist_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| Error::InvalidInput(format!("reading {}: {e}", path.display())))?;
    parse_artist_list(&text)
        .map_err(|reason| Error::InvalidInput(format!("{}: {reason}", path.display())))
}

fn parse_artist_list(text: &str) -> std::result::Result<Vec<String>, String> {
    let names: Vec<String> = serde_json::from_str(text)
        .map_err(|e| format!("expected a JSON array of artist names ({e})"))?;
    if names.is_empty() {
        return Err("artist list is empty".to_string());
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            return Err("artist list contains a blank name".to_string());
        }
        if seen.insert(name.to_lowercase()) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

/// Decides which requested artists still lack a record for the day.
#[derive(Debug, Clone)]
pub struct FreshnessChecker {
    store: Store,
}

impl FreshnessChecker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stale names for the local calendar day.
    ///
    /// `names` is usually the output of [`load_artist_list`], which already folds spellings
    /// that differ only in case; such duplicates never reach this check.
    pub async fn stale_artists(&self, names: &[String]) -> Result<Vec<String>> {
        self.stale_artists_on(names, today()).await
    }

    /// Names (input order kept) with no top-track record on `day`. Unknown artists count as stale.
    pub async fn stale_artists_on(&self, names: &[String], day: NaiveDate) -> Result<Vec<String>> {
        let fresh_names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT a.artist_name
             FROM artists a
             JOIN top_tracks t ON t.artist_id = a.artist_id
             WHERE substr(t.insertion_date, 1, 10) = ?",
        )
        .bind(day_key(day))
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| Error::store_query("checking same-day records", e))?;

        let fresh: HashSet<String> = fresh_names.iter().map(|n| n.to_lowercase()).collect();
        Ok(names
            .iter()
            .filter(|name| !fresh.contains(&name.trim().to_lowercase()))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedFile {
    pub path: PathBuf,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub files: Vec<MergedFile>,
}

impl MergeReport {
    pub fn rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// Upserts staged rows into the store, one transaction per staging file.
#[derive(Debug, Clone)]
pub struct StoreMerger {
    store: Store,
}

impl StoreMerger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Merge every staging file in `dir`. Stops at the first failing file; earlier files stay committed.
    pub async fn merge_directory(&self, dir: &Path) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        for path in list_staging_files(dir).await? {
            let rows = self.merge_file(&path).await?;
            report.files.push(MergedFile { path, rows });
        }
        info!(
            dir = %dir.display(),
            files = report.files.len(),
            rows = report.rows(),
            "merged staging files"
        );
        Ok(report)
    }

    pub async fn merge_file(&self, path: &Path) -> Result<usize> {
        // Parse everything before touching the store.
        let rows = read_staging_file(path).await?;
        let context = || format!("merging {}", path.display());

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| Error::store_write(context(), e))?;
        for row in &rows {
            upsert_artist(&mut tx, &row.artist())
                .await
                .map_err(|e| Error::store_write(context(), e))?;
            upsert_top_track(&mut tx, &row.record())
                .await
                .map_err(|e| Error::store_write(context(), e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::store_write(context(), e))?;

        debug!(path = %path.display(), rows = rows.len(), "merged staging file");
        Ok(rows.len())
    }
}

async fn upsert_artist(conn: &mut SqliteConnection, artist: &Artist) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO artists (artist_id, artist_name) VALUES (?, ?)
         ON CONFLICT(artist_id) DO UPDATE SET artist_name = excluded.artist_name",
    )
    .bind(&artist.artist_id)
    .bind(&artist.artist_name)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_top_track(conn: &mut SqliteConnection, record: &TopTrackRecord) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO top_tracks (song_id, insertion_date, song_name, popularity, album, artist_id)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(song_id, insertion_date) DO UPDATE SET
             song_name = excluded.song_name,
             popularity = excluded.popularity,
             album = excluded.album,
             artist_id = excluded.artist_id",
    )
    .bind(&record.song_id)
    .bind(&record.insertion_date)
    .bind(&record.song_name)
    .bind(record.popularity)
    .bind(&record.album)
    .bind(&record.artist_id)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    AbortRun,
    SkipArtist,
}

/// What a sync run does when one artist's catalog fetch fails.
pub trait FetchFailurePolicy: Send + Sync {
    fn on_fetch_error(&self, artist: &str, err: &CatalogError) -> FailureAction;
}

#[derive(Debug, Default)]
pub struct AbortOnFirstFailure;

impl FetchFailurePolicy for AbortOnFirstFailure {
    fn on_fetch_error(&self, _artist: &str, _err: &CatalogError) -> FailureAction {
        FailureAction::AbortRun
    }
}

#[derive(Debug, Default)]
pub struct SkipFailedArtists;

impl FetchFailurePolicy for SkipFailedArtists {
    fn on_fetch_error(&self, _artist: &str, _err: &CatalogError) -> FailureAction {
        FailureAction::SkipArtist
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_artists: usize,
    pub stale_artists: Vec<String>,
    pub fetched_artists: usize,
    pub skipped_artists: Vec<String>,
    pub staged_rows: usize,
    pub staged_files: Vec<PathBuf>,
    pub staging_error: Option<String>,
    pub merged_files: usize,
    pub merged_rows: usize,
}

impl SyncRunSummary {
    pub fn up_to_date(&self) -> bool {
        self.stale_artists.is_empty()
    }
}

pub struct SyncPipeline {
    store: Store,
    catalog: Arc<dyn CatalogClient>,
    staging: StagingWriter,
    failure_policy: Box<dyn FetchFailurePolicy>,
}

impl SyncPipeline {
    pub fn new(store: Store, catalog: Arc<dyn CatalogClient>, staging: StagingWriter) -> Self {
        Self {
            store,
            catalog,
            staging,
            failure_policy: Box::<AbortOnFirstFailure>::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: Box<dyn FetchFailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One pass: freshness check, fetch stale artists, stage, then merge everything staged.
    pub async fn run_once(&self, artists: &[String]) -> Result<SyncRunSummary> {
        self.run_once_at(artists, now_local()).await
    }

    /// [`Self::run_once`] with the batch time fixed by the caller. Its date is the freshness day.
    pub async fn run_once_at(&self, artists: &[String], at: NaiveDateTime) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, catalog = self.catalog.catalog_id());
        self.run_inner(run_id, artists, at).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        artists: &[String],
        at: NaiveDateTime,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let stale = FreshnessChecker::new(self.store.clone())
            .stale_artists_on(artists, at.date())
            .await?;

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            requested_artists: artists.len(),
            stale_artists: stale.clone(),
            fetched_artists: 0,
            skipped_artists: Vec::new(),
            staged_rows: 0,
            staged_files: Vec::new(),
            staging_error: None,
            merged_files: 0,
            merged_rows: 0,
        };

        if stale.is_empty() {
            info!("store already holds today's data; nothing to fetch");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let mut fetched = Vec::with_capacity(stale.len());
        for name in &stale {
            match self.fetch_artist(name).await {
                Ok(result) => fetched.push(result),
                Err(err) => match self.failure_policy.on_fetch_error(name, &err) {
                    FailureAction::AbortRun => return Err(err.into_remote_fetch(name)),
                    FailureAction::SkipArtist => {
                        warn!(artist = %name, error = %err, "skipping artist after fetch failure");
                        summary.skipped_artists.push(name.clone());
                    }
                },
            }
        }
        summary.fetched_artists = fetched.len();

        match self.staging.stage_at(&fetched, at).await {
            StageOutcome::Written { paths, rows } => {
                summary.staged_rows = rows;
                summary.staged_files = paths;
            }
            StageOutcome::Failed { path, reason } => {
                warn!(path = %path.display(), %reason, "staging failed; merging previously staged files only");
                summary.staging_error = Some(format!("{}: {reason}", path.display()));
            }
        }

        let merge = self.merge_staged().await?;
        summary.merged_files = merge.files.len();
        summary.merged_rows = merge.rows();
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn fetch_artist(&self, name: &str) -> std::result::Result<ArtistTopTracks, CatalogError> {
        info!(artist = %name, "searching artist");
        let artist = self.catalog.search_artist(name).await?;
        info!(artist = %name, artist_id = %artist.artist_id, "fetching top tracks");
        self.catalog.search_top_tracks(&artist).await
    }

    pub async fn merge_staged(&self) -> Result<MergeReport> {
        StoreMerger::new(self.store.clone())
            .merge_directory(self.staging.dir())
            .await
    }
}

/// Cron scheduler that runs [`SyncPipeline::run_once`] for `artists` on every tick.
///
/// A tick that fires while the previous run is still going is skipped.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    artists: Vec<String>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| Error::Config(format!("creating scheduler: {e:?}")))?;

    let artists = Arc::new(artists);
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let artists = Arc::clone(&artists);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping this tick");
                return;
            };
            match pipeline.run_once(&artists).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    fetched = summary.fetched_artists,
                    merged_rows = summary.merged_rows,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .map_err(|e| Error::Config(format!("invalid cron expression `{cron}`: {e:?}")))?;

    sched
        .add(job)
        .await
        .map_err(|e| Error::Config(format!("adding scheduler job: {e:?}")))?;
    Ok(sched)
}
