//! Read side of the store: artist resolution and latest-day top tracks.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use toptracks_core::{Artist, Error, Result, TopTrackRecord};
use toptracks_storage::Store;
use tracing::debug;

pub const CRATE_NAME: &str = "toptracks-query";

/// Split a comma-separated filter into trimmed, non-empty tokens.
pub fn parse_filter(text: &str) -> Result<Vec<String>> {
    let tokens: Vec<String> = text
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return Err(Error::InvalidInput(format!(
            "filter `{text}` contains no artist names or ids"
        )));
    }
    Ok(tokens)
}

/// Artists indexed by lowercased name and by id.
///
/// A token selects every artist whose name equals it ignoring case, plus the artist whose id
/// equals it exactly.
#[derive(Debug, Clone, Default)]
pub struct ArtistIndex {
    by_name: HashMap<String, Vec<Artist>>,
    by_id: HashMap<String, Artist>,
}

impl ArtistIndex {
    pub fn new(artists: impl IntoIterator<Item = Artist>) -> Self {
        let mut index = Self::default();
        for artist in artists {
            index
                .by_name
                .entry(artist.artist_name.to_lowercase())
                .or_default()
                .push(artist.clone());
            index.by_id.insert(artist.artist_id.clone(), artist);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Every artist, alphabetical by name (case-insensitive) then id.
    pub fn all(&self) -> Vec<Artist> {
        sorted(self.by_id.values().cloned().collect())
    }

    /// Union of name matches and id matches. No tokens selects everything.
    pub fn resolve(&self, tokens: &[String]) -> Vec<Artist> {
        if tokens.is_empty() {
            return self.all();
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for token in tokens {
            let token = token.trim();
            let by_name = self
                .by_name
                .get(&token.to_lowercase())
                .into_iter()
                .flatten();
            let by_id = self.by_id.get(token);
            for artist in by_name.chain(by_id) {
                if seen.insert(artist.artist_id.clone()) {
                    out.push(artist.clone());
                }
            }
        }
        sorted(out)
    }
}

fn sorted(mut artists: Vec<Artist>) -> Vec<Artist> {
    artists.sort_by(|a, b| {
        a.artist_name
            .to_lowercase()
            .cmp(&b.artist_name.to_lowercase())
            .then_with(|| a.artist_id.cmp(&b.artist_id))
    });
    artists
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistReport {
    pub artist_name: String,
    pub artist_id: String,
    pub top_tracks: Vec<TopTrackRecord>,
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Store,
}

impl QueryEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn index(&self) -> Result<ArtistIndex> {
        let rows = sqlx::query("SELECT artist_id, artist_name FROM artists")
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| Error::store_query("loading artists", e))?;

        let mut artists = Vec::with_capacity(rows.len());
        for row in rows {
            let artist_id: String = row
                .try_get("artist_id")
                .map_err(|e| Error::store_query("reading artist row", e))?;
            let artist_name: String = row
                .try_get("artist_name")
                .map_err(|e| Error::store_query("reading artist row", e))?;
            artists.push(Artist::new(artist_id, artist_name));
        }
        Ok(ArtistIndex::new(artists))
    }

    pub async fn resolve_artists(&self, tokens: &[String]) -> Result<Vec<Artist>> {
        Ok(self.index().await?.resolve(tokens))
    }

    /// Full artist listing; an empty store is [`Error::NoData`].
    pub async fn list_all(&self) -> Result<Vec<Artist>> {
        let index = self.index().await?;
        if index.is_empty() {
            return Err(Error::NoData);
        }
        Ok(index.all())
    }

    /// Tracks stamped with the artist's most recent batch timestamp, most popular first.
    pub async fn top_tracks(&self, artist_id: &str) -> Result<Vec<TopTrackRecord>> {
        let rows = sqlx::query(
            "SELECT song_id, song_name, popularity, album, artist_id, insertion_date
             FROM top_tracks
             WHERE artist_id = ?1
               AND insertion_date = (SELECT MAX(insertion_date) FROM top_tracks WHERE artist_id = ?1)
             ORDER BY popularity DESC",
        )
        .bind(artist_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| Error::store_query(format!("loading top tracks for {artist_id}"), e))?;

        rows.iter()
            .map(record_from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(|e| Error::store_query("reading top track row", e))
    }

    pub async fn query(&self, tokens: &[String]) -> Result<Vec<ArtistReport>> {
        let artists = self.resolve_artists(tokens).await?;
        debug!(tokens = tokens.len(), matched = artists.len(), "resolved artist filter");

        let mut out = Vec::with_capacity(artists.len());
        for artist in artists {
            let top_tracks = self.top_tracks(&artist.artist_id).await?;
            out.push(ArtistReport {
                artist_name: artist.artist_name,
                artist_id: artist.artist_id,
                top_tracks,
            });
        }
        Ok(out)
    }
}

fn record_from_row(row: &SqliteRow) -> sqlx::Result<TopTrackRecord> {
    Ok(TopTrackRecord {
        song_id: row.try_get("song_id")?,
        song_name: row.try_get("song_name")?,
        popularity: row.try_get("popularity")?,
        album: row.try_get("album")?,
        artist_id: row.try_get("artist_id")?,
        insertion_date: row.try_get("insertion_date")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.expect("store");
        for (id, name) in [("1", "Linkin Park"), ("2", "Disturbed"), ("3", "Metallica")] {
            sqlx::query("INSERT INTO artists (artist_id, artist_name) VALUES (?, ?)")
                .bind(id)
                .bind(name)
                .execute(store.pool())
                .await
                .expect("insert artist");
        }
        store
    }

    async fn insert_track(store: &Store, song_id: &str, popularity: i64, at: &str) {
        sqlx::query(
            "INSERT INTO top_tracks (song_id, insertion_date, song_name, popularity, album, artist_id)
             VALUES (?, ?, ?, ?, 'Hybrid Theory', '1')",
        )
        .bind(song_id)
        .bind(at)
        .bind(format!("song {song_id}"))
        .bind(popularity)
        .execute(store.pool())
        .await
        .expect("insert track");
    }

    #[test]
    fn parse_filter_trims_and_drops_empty_tokens() {
        assert_eq!(
            parse_filter(" Linkin Park , ,3").unwrap(),
            tokens(&["Linkin Park", "3"])
        );
        let err = parse_filter(" , ").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn index_sorts_case_insensitively_then_by_id() {
        let index = ArtistIndex::new([
            Artist::new("9", "beck"),
            Artist::new("2", "Air"),
            Artist::new("1", "Beck"),
        ]);
        let ids: Vec<String> = index.all().into_iter().map(|a| a.artist_id).collect();
        assert_eq!(ids, tokens(&["2", "1", "9"]));
        assert_eq!(index.resolve(&tokens(&["BECK"])).len(), 2);
    }

    #[tokio::test]
    async fn filter_is_the_union_of_name_and_id_matches() {
        let engine = QueryEngine::new(seeded_store().await);

        let by_name = engine
            .resolve_artists(&tokens(&["metallica", "LINKIN PARK"]))
            .await
            .expect("resolve");
        let ids: HashSet<String> = by_name.into_iter().map(|a| a.artist_id).collect();
        assert_eq!(ids, HashSet::from(["1".to_string(), "3".to_string()]));

        let mixed = engine
            .resolve_artists(&tokens(&["2", "disturbed", "Linkin"]))
            .await
            .expect("resolve");
        assert_eq!(mixed, vec![Artist::new("2", "Disturbed")]);

        let all = engine.resolve_artists(&[]).await.expect("resolve");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn top_tracks_come_from_the_latest_batch_only() {
        let store = seeded_store().await;
        insert_track(&store, "abc", 90, "2024-07-22").await;
        insert_track(&store, "def", 91, "2024-07-22").await;
        insert_track(&store, "ghi", 80, "2024-07-21").await;

        let tracks = QueryEngine::new(store).top_tracks("1").await.expect("tracks");
        let popularity: Vec<i64> = tracks.iter().map(|t| t.popularity).collect();
        assert_eq!(popularity, vec![91, 90]);
        assert!(tracks.iter().all(|t| t.insertion_date == "2024-07-22"));
    }

    #[tokio::test]
    async fn later_batch_on_the_same_day_wins() {
        let store = seeded_store().await;
        insert_track(&store, "abc", 70, "2024-07-22 08:00:00.000000").await;
        insert_track(&store, "abc", 75, "2024-07-22 18:30:00.000000").await;

        let tracks = QueryEngine::new(store).top_tracks("1").await.expect("tracks");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].popularity, 75);
    }

    #[tokio::test]
    async fn artist_without_tracks_yields_an_empty_report() {
        let engine = QueryEngine::new(seeded_store().await);
        assert!(engine.top_tracks("2").await.expect("tracks").is_empty());

        let reports = engine.query(&tokens(&["Disturbed"])).await.expect("query");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].top_tracks.is_empty());
        let json = serde_json::to_value(&reports).expect("json");
        assert_eq!(json[0]["artist_name"], "Disturbed");
    }

    #[tokio::test]
    async fn listing_an_empty_store_is_no_data() {
        let store = Store::open_in_memory().await.expect("store");
        let err = QueryEngine::new(store).list_all().await.unwrap_err();
        assert!(matches!(err, Error::NoData));
    }

    #[tokio::test]
    async fn listing_is_alphabetical() {
        let names: Vec<String> = QueryEngine::new(seeded_store().await)
            .list_all()
            .await
            .expect("list")
            .into_iter()
            .map(|a| a.artist_name)
            .collect();
        assert_eq!(names, tokens(&["Disturbed", "Linkin Park", "Metallica"]));
    }
}
