use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tempfile::tempdir;
use toptracks_catalog::FixtureCatalog;
use toptracks_query::{parse_filter, QueryEngine};
use toptracks_storage::{StagingWriter, Store};
use toptracks_sync::{load_artist_list, SyncPipeline};

const FIXTURE: &str = r#"{
  "artists": [
    {
      "artist_id": "6XyY86QOPPrYVGvF9ch6wz",
      "artist_name": "Linkin Park",
      "top_tracks": [
        { "track_name": "Numb", "track_id": "2nLtzopw4rPReszdYBJU6h", "popularity": 90, "album": "Meteora" },
        { "track_name": "In the End", "track_id": "60a0Rd6pjrkxjPbaKzXjfq", "popularity": 91, "album": "Hybrid Theory" }
      ]
    },
    {
      "artist_id": "3TOqt5oJwL9BE2NG9MEwDa",
      "artist_name": "Disturbed",
      "top_tracks": [
        { "track_name": "The Sound of Silence", "track_id": "5ZdBHjjQ9SxnaPaM5KDSHo", "popularity": 80, "album": "Immortalized; Deluxe" }
      ]
    }
  ]
}"#;

#[tokio::test]
async fn sync_then_query_returns_the_latest_batch() {
    let dir = tempdir().expect("tempdir");
    let fixture_path = dir.path().join("catalog.json");
    let artists_path = dir.path().join("artists.json");
    std::fs::write(&fixture_path, FIXTURE).expect("fixture");
    std::fs::write(&artists_path, r#"["Linkin Park", "Disturbed"]"#).expect("artists");

    let store = Store::open(dir.path().join("db/toptracks.db"))
        .await
        .expect("store");
    let catalog = Arc::new(FixtureCatalog::load(&fixture_path).expect("catalog"));
    let staging = StagingWriter::new(dir.path().join("staging"));
    let pipeline = SyncPipeline::new(store.clone(), catalog, staging.clone());

    let artists = load_artist_list(&artists_path).await.expect("artist list");
    let day = NaiveDate::from_ymd_opt(2024, 7, 22).expect("date");
    let at = day.and_hms_opt(9, 0, 0).expect("time");
    let summary = pipeline.run_once_at(&artists, at).await.expect("sync");
    assert_eq!(summary.fetched_artists, 2);
    assert_eq!(summary.staged_rows, 3);
    assert!(staging.dated_path(day).exists());
    assert!(staging.running_path().exists());

    let engine = QueryEngine::new(store.clone());
    let listed: Vec<String> = engine
        .list_all()
        .await
        .expect("list")
        .into_iter()
        .map(|a| a.artist_name)
        .collect();
    assert_eq!(listed, vec!["Disturbed", "Linkin Park"]);

    let reports = engine
        .query(&parse_filter("linkin park").expect("filter"))
        .await
        .expect("query");
    assert_eq!(reports.len(), 1);
    let names: Vec<&str> = reports[0]
        .top_tracks
        .iter()
        .map(|t| t.song_name.as_str())
        .collect();
    assert_eq!(names, vec!["In the End", "Numb"]);
    assert!(reports[0]
        .top_tracks
        .iter()
        .all(|t| t.insertion_date == "2024-07-22 09:00:00.000000"));

    let disturbed = engine
        .query(&parse_filter("3TOqt5oJwL9BE2NG9MEwDa").expect("filter"))
        .await
        .expect("query");
    assert_eq!(disturbed[0].top_tracks[0].album, "Immortalized; Deluxe");

    let rerun = pipeline
        .run_once_at(&artists, at + Duration::hours(9))
        .await
        .expect("rerun");
    assert!(rerun.up_to_date());
    assert_eq!(store.counts().await.expect("counts").top_tracks, 3);
}
