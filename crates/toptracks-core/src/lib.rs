//! Core domain model and error taxonomy for the top-tracks sync.

use std::path::PathBuf;

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "toptracks-core";

/// Column order shared by the staging file header and [`StagedRow`].
pub const STAGING_COLUMNS: [&str; 7] = [
    "artist_name",
    "artist_id",
    "song_name",
    "song_id",
    "popularity",
    "album",
    "insertion_date",
];

pub const DAY_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Catalog artist identity. Names are not unique; ids are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artist {
    pub artist_id: String,
    pub artist_name: String,
}

impl Artist {
    pub fn new(artist_id: impl Into<String>, artist_name: impl Into<String>) -> Self {
        Self {
            artist_id: artist_id.into(),
            artist_name: artist_name.into(),
        }
    }
}

/// One track as returned by a catalog top-tracks lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub track_name: String,
    pub track_id: String,
    pub popularity: i64,
    pub album: String,
}

/// Handoff contract from the catalog client into the staging writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistTopTracks {
    pub artist: Artist,
    pub tracks: Vec<Track>,
}

/// Persisted popularity snapshot of one track on one batch timestamp.
///
/// `(song_id, insertion_date)` is the store's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopTrackRecord {
    pub song_id: String,
    pub song_name: String,
    pub popularity: i64,
    pub album: String,
    pub artist_id: String,
    pub insertion_date: String,
}

/// Flat staging-file row: a [`TopTrackRecord`] plus the denormalized artist name.
///
/// Field order and names must match [`STAGING_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRow {
    pub artist_name: String,
    pub artist_id: String,
    pub song_name: String,
    pub song_id: String,
    pub popularity: i64,
    pub album: String,
    pub insertion_date: String,
}

impl StagedRow {
    pub fn from_track(artist: &Artist, track: &Track, insertion_date: &str) -> Self {
        Self {
            artist_name: artist.artist_name.clone(),
            artist_id: artist.artist_id.clone(),
            song_name: track.track_name.clone(),
            song_id: track.track_id.clone(),
            popularity: track.popularity,
            album: track.album.clone(),
            insertion_date: insertion_date.to_string(),
        }
    }

    pub fn artist(&self) -> Artist {
        Artist::new(&self.artist_id, &self.artist_name)
    }

    pub fn record(&self) -> TopTrackRecord {
        TopTrackRecord {
            song_id: self.song_id.clone(),
            song_name: self.song_name.clone(),
            popularity: self.popularity,
            album: self.album.clone(),
            artist_id: self.artist_id.clone(),
            insertion_date: self.insertion_date.clone(),
        }
    }
}

/// Renders a batch timestamp. Zero-padded, so lexicographic order is chronological order.
pub fn batch_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Day portion (`YYYY-MM-DD`) of a stored timestamp, if it has one.
pub fn day_of(timestamp: &str) -> Option<&str> {
    timestamp.get(..10)
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store query failed ({context}): {source}")]
    StoreQuery {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("store write failed ({context}): {source}")]
    StoreWrite {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("staging file {} is empty or has no header", path.display())]
    EmptyFile { path: PathBuf },
    #[error("malformed row in staging file {} (line {line}): {reason}", path.display())]
    MalformedRow {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("no artists in the store; run a sync with --artists-json first")]
    NoData,
    #[error("fetching {artist} from the catalog failed: {reason}")]
    RemoteFetch { artist: String, reason: String },
    #[error("staging directory {} unreadable: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn store_query(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::StoreQuery {
            context: context.into(),
            source,
        }
    }

    pub fn store_write(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::StoreWrite {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this category. `1` stays reserved for uncategorized failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::StoreQuery { .. } => 3,
            Self::StoreWrite { .. } => 4,
            Self::EmptyFile { .. } => 5,
            Self::MalformedRow { .. } => 6,
            Self::NoData => 7,
            Self::RemoteFetch { .. } => 8,
            Self::Staging { .. } => 9,
            Self::Config(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_timestamps_sort_chronologically() {
        let earlier = NaiveDate::from_ymd_opt(2024, 7, 9)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 5)
            .unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 7, 22)
            .unwrap()
            .and_hms_micro_opt(8, 0, 0, 0)
            .unwrap();

        let a = batch_timestamp(earlier);
        let b = batch_timestamp(later);
        assert_eq!(a, "2024-07-09 23:59:59.000005");
        assert!(a < b);
        assert_eq!(day_of(&b), Some("2024-07-22"));
    }

    #[test]
    fn day_of_accepts_plain_dates() {
        assert_eq!(day_of("2024-07-21"), Some("2024-07-21"));
        assert_eq!(day_of("2024"), None);
    }

    #[test]
    fn staged_row_splits_into_artist_and_record() {
        let artist = Artist::new("1", "Linkin Park");
        let track = Track {
            track_name: "Numb".into(),
            track_id: "def".into(),
            popularity: 90,
            album: "Meteora".into(),
        };
        let row = StagedRow::from_track(&artist, &track, "2024-07-22");

        assert_eq!(row.artist(), artist);
        let record = row.record();
        assert_eq!(record.song_id, "def");
        assert_eq!(record.artist_id, "1");
        assert_eq!(record.insertion_date, "2024-07-22");
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let errors = [
            Error::InvalidInput("x".into()),
            Error::store_query("q", sqlx::Error::RowNotFound),
            Error::store_write("w", sqlx::Error::RowNotFound),
            Error::EmptyFile { path: "a.csv".into() },
            Error::MalformedRow {
                path: "a.csv".into(),
                line: 2,
                reason: "bad".into(),
            },
            Error::NoData,
            Error::RemoteFetch {
                artist: "A".into(),
                reason: "down".into(),
            },
            Error::Staging {
                path: "data".into(),
                source: std::io::Error::other("gone"),
            },
            Error::Config("missing".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0) && !codes.contains(&1));
    }

    #[test]
    fn malformed_row_message_names_the_file() {
        let err = Error::MalformedRow {
            path: "data/search_results_2024-07-22.csv".into(),
            line: 3,
            reason: "invalid digit".into(),
        };
        assert!(err
            .to_string()
            .contains("data/search_results_2024-07-22.csv"));
    }
}
