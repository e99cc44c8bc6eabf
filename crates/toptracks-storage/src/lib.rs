//! Relational store handle, staging files, and HTTP fetch utilities.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use reqwest::StatusCode;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use toptracks_core::{
    batch_timestamp, day_key, now_local, ArtistTopTracks, Error, Result, StagedRow,
    STAGING_COLUMNS,
};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "toptracks-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared handle on the SQLite store.
///
/// The pool is capped at one connection: every component of a run goes through the same
/// session, and there is no multi-writer story.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub artists: i64,
    pub top_tracks: i64,
}

impl Store {
    /// Open (creating if missing) the database file and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::store_write(
                    format!("creating database directory {}", parent.display()),
                    sqlx::Error::Io(e),
                )
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::store_query(format!("opening {}", path.display()), e))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "opened store");
        Ok(store)
    }

    /// Private in-memory database; the single connection is never recycled.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::store_query("parsing in-memory url", e))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| Error::store_query("opening in-memory store", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::store_write("applying migrations", e.into()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let artists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artists")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store_query("counting artists", e))?;
        let top_tracks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM top_tracks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store_query("counting top tracks", e))?;
        Ok(StoreCounts {
            artists,
            top_tracks,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub const STAGING_PREFIX: &str = "search_results";
pub const STAGING_EXTENSION: &str = "csv";
pub const STAGING_DELIMITER: u8 = b';';

pub fn dated_file_name(day: NaiveDate) -> String {
    format!("{STAGING_PREFIX}_{}.{STAGING_EXTENSION}", day_key(day))
}

pub fn running_file_name() -> String {
    format!("{STAGING_PREFIX}.{STAGING_EXTENSION}")
}

pub fn is_staging_file_name(path: &Path) -> bool {
    let stem_matches = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.starts_with(STAGING_PREFIX));
    let ext_matches = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(STAGING_EXTENSION));
    stem_matches && ext_matches
}

/// Result of one staging call. Write failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Written { paths: Vec<PathBuf>, rows: usize },
    Failed { path: PathBuf, reason: String },
}

impl StageOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Written { rows, .. } => *rows,
            Self::Failed { .. } => 0,
        }
    }
}

/// Appends fetch results to the dated staging file (and the running file, if enabled).
#[derive(Debug, Clone)]
pub struct StagingWriter {
    dir: PathBuf,
    running_file: bool,
}

impl StagingWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            running_file: true,
        }
    }

    pub fn with_running_file(mut self, enabled: bool) -> Self {
        self.running_file = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dated_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(dated_file_name(day))
    }

    pub fn running_path(&self) -> PathBuf {
        self.dir.join(running_file_name())
    }

    pub async fn stage(&self, results: &[ArtistTopTracks]) -> StageOutcome {
        self.stage_at(results, now_local()).await
    }

    /// Stage every track of `results` under one batch timestamp taken from `at`.
    pub async fn stage_at(&self, results: &[ArtistTopTracks], at: NaiveDateTime) -> StageOutcome {
        let stamp = batch_timestamp(at);
        let stamp_ref = stamp.as_str();
        let rows: Vec<StagedRow> = results
            .iter()
            .flat_map(|result| {
                result
                    .tracks
                    .iter()
                    .map(move |track| StagedRow::from_track(&result.artist, track, stamp_ref))
            })
            .collect();

        if rows.is_empty() {
            return StageOutcome::Written {
                paths: Vec::new(),
                rows: 0,
            };
        }

        if let Err(err) = fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "cannot create staging directory");
            return StageOutcome::Failed {
                path: self.dir.clone(),
                reason: err.to_string(),
            };
        }

        let mut targets = vec![self.dated_path(at.date())];
        if self.running_file {
            targets.push(self.running_path());
        }

        for path in &targets {
            if let Err(err) = append_rows(path, &rows).await {
                warn!(path = %path.display(), error = %err, "staging write failed");
                return StageOutcome::Failed {
                    path: path.clone(),
                    reason: err.to_string(),
                };
            }
        }

        info!(rows = rows.len(), batch = %stamp, files = targets.len(), "staged top tracks");
        StageOutcome::Written {
            paths: targets,
            rows: rows.len(),
        }
    }
}

async fn append_rows(path: &Path, rows: &[StagedRow]) -> io::Result<()> {
    let write_header = match fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(err),
    };
    let bytes = encode_rows(rows, write_header)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await
}

fn encode_rows(rows: &[StagedRow], write_header: bool) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(STAGING_DELIMITER)
        .has_headers(write_header)
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(io::Error::other)?;
    }
    writer
        .into_inner()
        .map_err(|e| io::Error::other(e.to_string()))
}

/// Staging files in `dir`, sorted by name. A missing directory yields nothing.
pub async fn list_staging_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let staging_err = |source: io::Error| Error::Staging {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(staging_err(err)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(staging_err)? {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|ft| ft.is_file())
            .unwrap_or(false);
        if is_file && is_staging_file_name(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub async fn read_staging_file(path: &Path) -> Result<Vec<StagedRow>> {
    let bytes = fs::read(path).await.map_err(|source| Error::Staging {
        path: path.to_path_buf(),
        source,
    })?;
    decode_rows(path, &bytes)
}

/// Parse a whole staging file. Fails on a missing header, a foreign header, zero data rows,
/// or any row that does not decode.
pub fn decode_rows(path: &Path, bytes: &[u8]) -> Result<Vec<StagedRow>> {
    let malformed = |line: u64, reason: String| Error::MalformedRow {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(STAGING_DELIMITER)
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| malformed(1, e.to_string()))?
        .clone();
    if headers.is_empty() {
        return Err(Error::EmptyFile {
            path: path.to_path_buf(),
        });
    }
    if !headers.iter().eq(STAGING_COLUMNS) {
        return Err(malformed(
            1,
            format!(
                "unexpected header `{}`",
                headers.iter().collect::<Vec<_>>().join(";")
            ),
        ));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<StagedRow>().enumerate() {
        let row = record.map_err(|e| {
            let line = e
                .position()
                .map(|p| p.line())
                .unwrap_or(index as u64 + 2);
            malformed(line, e.to_string())
        })?;
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(Error::EmptyFile {
            path: path.to_path_buf(),
        });
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Sequential HTTP client that retries transient failures with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> std::result::Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    /// Send the request produced by `build`, rebuilding it for every attempt.
    pub async fn send<F>(&self, label: &str, build: F) -> std::result::Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", label);
        self.send_with_retries(build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, build: F) -> std::result::Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        warn!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
