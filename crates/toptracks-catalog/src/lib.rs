//! Catalog client contract + Spotify and fixture-backed implementations.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use toptracks_core::{Artist, ArtistTopTracks, Track};
use toptracks_storage::{FetchError, HttpFetcher};
use tracing::debug;

pub const CRATE_NAME: &str = "toptracks-catalog";

pub const SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("missing catalog credential `{0}`")]
    MissingCredentials(&'static str),
    #[error("no artist found for `{0}`")]
    ArtistNotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CatalogError {
    /// Fold into the run-level error for the artist being fetched.
    pub fn into_remote_fetch(self, artist: &str) -> toptracks_core::Error {
        toptracks_core::Error::RemoteFetch {
            artist: artist.to_string(),
            reason: self.to_string(),
        }
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    fn catalog_id(&self) -> &'static str;

    async fn search_artist(&self, name: &str) -> Result<Artist, CatalogError>;

    async fn search_top_tracks(&self, artist: &Artist) -> Result<ArtistTopTracks, CatalogError>;
}

/// Client-credentials pair for the Spotify accounts service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl SpotifyCredentials {
    pub fn new(
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self, CatalogError> {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Ok(Self {
            client_id: non_blank(client_id).ok_or(CatalogError::MissingCredentials("client_id"))?,
            client_secret: non_blank(client_secret)
                .ok_or(CatalogError::MissingCredentials("client_secret"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    value: String,
    issued_at: Instant,
    expires_in: Duration,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in_secs: u64) -> Self {
        Self {
            value: value.into(),
            issued_at: Instant::now(),
            expires_in: Duration::from_secs(expires_in_secs),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_valid(&self) -> bool {
        self.issued_at.elapsed() < self.expires_in
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    artists: ArtistPage,
}

#[derive(Debug, Deserialize)]
struct ArtistPage {
    items: Vec<ArtistItem>,
}

#[derive(Debug, Deserialize)]
struct ArtistItem {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TopTracksResponse {
    tracks: Vec<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: String,
    name: String,
    popularity: i64,
    album: AlbumRef,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    name: String,
}

fn decode<T: DeserializeOwned>(what: &'static str, body: &[u8]) -> Result<T, CatalogError> {
    serde_json::from_slice(body).map_err(|source| CatalogError::Decode { what, source })
}

/// First hit of a `/search?type=artist` payload.
pub fn parse_artist_search(query: &str, body: &[u8]) -> Result<Artist, CatalogError> {
    let response: SearchResponse = decode("artist search response", body)?;
    response
        .artists
        .items
        .into_iter()
        .next()
        .map(|item| Artist::new(item.id, item.name))
        .ok_or_else(|| CatalogError::ArtistNotFound(query.to_string()))
}

pub fn parse_top_tracks(artist: &Artist, body: &[u8]) -> Result<ArtistTopTracks, CatalogError> {
    let response: TopTracksResponse = decode("top tracks response", body)?;
    Ok(ArtistTopTracks {
        artist: artist.clone(),
        tracks: response
            .tracks
            .into_iter()
            .map(|t| Track {
                track_name: t.name,
                track_id: t.id,
                popularity: t.popularity,
                album: t.album.name,
            })
            .collect(),
    })
}

/// Spotify Web API client using the client-credentials flow.
#[derive(Debug)]
pub struct SpotifyCatalog {
    http: HttpFetcher,
    credentials: SpotifyCredentials,
    api_url: String,
    token_url: String,
    market: Option<String>,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyCatalog {
    pub fn new(http: HttpFetcher, credentials: SpotifyCredentials) -> Self {
        Self {
            http,
            credentials,
            api_url: SPOTIFY_API_URL.to_string(),
            token_url: SPOTIFY_TOKEN_URL.to_string(),
            market: None,
            token: Mutex::new(None),
        }
    }

    pub fn with_market(mut self, market: Option<String>) -> Self {
        self.market = market;
        self
    }

    pub fn with_endpoints(mut self, api_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self.token_url = token_url.into();
        self
    }

    async fn request_token(&self) -> Result<AccessToken, CatalogError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        let resp = self
            .http
            .send("spotify_token", |client| client.post(&self.token_url).form(&form))
            .await?;
        let payload: TokenResponse = decode("token response", &resp.body)?;
        debug!(expires_in = payload.expires_in, "acquired catalog access token");
        Ok(AccessToken::new(payload.access_token, payload.expires_in))
    }

    async fn bearer(&self) -> Result<String, CatalogError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.value().to_string());
        }
        let fresh = self.request_token().await?;
        let value = fresh.value().to_string();
        *cached = Some(fresh);
        Ok(value)
    }

    /// GET with the cached bearer token; a 401 drops the token and retries once.
    async fn authorized_get(
        &self,
        label: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, CatalogError> {
        let token = self.bearer().await?;
        match self.get_with_token(label, url, query, &token).await {
            Err(err) if err.status() == Some(401) => {
                debug!(label, "access token rejected; refreshing");
                *self.token.lock().await = None;
                let token = self.bearer().await?;
                Ok(self.get_with_token(label, url, query, &token).await?)
            }
            other => Ok(other?),
        }
    }

    async fn get_with_token(
        &self,
        label: &str,
        url: &str,
        query: &[(&str, &str)],
        token: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .http
            .send(label, |client| client.get(url).bearer_auth(token).query(query))
            .await?;
        debug!(
            label,
            status = %resp.status,
            url = %resp.final_url,
            bytes = resp.body.len(),
            "catalog response"
        );
        Ok(resp.body)
    }
}

#[async_trait]
impl CatalogClient for SpotifyCatalog {
    fn catalog_id(&self) -> &'static str {
        "spotify"
    }

    async fn search_artist(&self, name: &str) -> Result<Artist, CatalogError> {
        let url = format!("{}/search", self.api_url);
        let body = self
            .authorized_get(
                "spotify_search_artist",
                &url,
                &[("q", name), ("type", "artist"), ("limit", "1")],
            )
            .await?;
        parse_artist_search(name, &body)
    }

    async fn search_top_tracks(&self, artist: &Artist) -> Result<ArtistTopTracks, CatalogError> {
        let url = format!("{}/artists/{}/top-tracks", self.api_url, artist.artist_id);
        let market: Vec<(&str, &str)> = self
            .market
            .as_deref()
            .map(|m| vec![("market", m)])
            .unwrap_or_default();
        let body = self
            .authorized_get("spotify_top_tracks", &url, &market)
            .await?;
        parse_top_tracks(artist, &body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCatalogFile {
    pub artists: Vec<FixtureArtist>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureArtist {
    pub artist_id: String,
    pub artist_name: String,
    #[serde(default)]
    pub top_tracks: Vec<Track>,
}

/// Offline catalog served from a JSON fixture.
#[derive(Debug, Clone, Default)]
pub struct FixtureCatalog {
    artists: Vec<FixtureArtist>,
}

impl FixtureCatalog {
    pub fn new(artists: Vec<FixtureArtist>) -> Self {
        Self { artists }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file: FixtureCatalogFile = read_json_file(path)?;
        Ok(Self::new(file.artists))
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl CatalogClient for FixtureCatalog {
    fn catalog_id(&self) -> &'static str {
        "fixture"
    }

    async fn search_artist(&self, name: &str) -> Result<Artist, CatalogError> {
        let wanted = name.trim().to_lowercase();
        self.artists
            .iter()
            .find(|a| a.artist_name.to_lowercase() == wanted)
            .map(|a| Artist::new(&a.artist_id, &a.artist_name))
            .ok_or_else(|| CatalogError::ArtistNotFound(name.to_string()))
    }

    async fn search_top_tracks(&self, artist: &Artist) -> Result<ArtistTopTracks, CatalogError> {
        let entry = self
            .artists
            .iter()
            .find(|a| a.artist_id == artist.artist_id)
            .ok_or_else(|| CatalogError::ArtistNotFound(artist.artist_name.clone()))?;
        Ok(ArtistTopTracks {
            artist: artist.clone(),
            tracks: entry.top_tracks.clone(),
        })
    }
}
