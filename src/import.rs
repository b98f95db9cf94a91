//! Loading spotify streaming-history exports into `track_plays`
use std::path::Path;

use sqlx::SqlitePool;

use crate::{db, models, se, LOG};

/// One element of a spotify history export.
///
/// Extended streaming history (`Streaming_History_Audio_*.json`) uses the
/// snake_case fields. The older account-data export (`StreamingHistory*.json`)
/// only has `endTime`, `artistName`, `trackName` and `msPlayed`, which are
/// used as fallbacks.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub ts: Option<String>,
    pub ms_played: Option<i64>,
    pub platform: Option<String>,
    pub conn_country: Option<String>,
    pub master_metadata_track_name: Option<String>,
    pub master_metadata_album_artist_name: Option<String>,
    pub master_metadata_album_album_name: Option<String>,
    pub spotify_track_uri: Option<String>,
    pub reason_start: Option<String>,
    pub reason_end: Option<String>,
    pub shuffle: Option<bool>,
    pub skipped: Option<bool>,
    pub offline: Option<bool>,
    pub incognito_mode: Option<bool>,

    #[serde(rename = "endTime")]
    pub end_time: Option<String>,
    #[serde(rename = "msPlayed")]
    pub legacy_ms_played: Option<i64>,
    #[serde(rename = "trackName")]
    pub legacy_track_name: Option<String>,
    #[serde(rename = "artistName")]
    pub legacy_artist_name: Option<String>,
}

impl HistoryEntry {
    pub fn into_play(self, user_id: i64) -> models::NewTrackPlay {
        let track_name = self.master_metadata_track_name.or(self.legacy_track_name);
        let artist_name = self
            .master_metadata_album_artist_name
            .or(self.legacy_artist_name);
        let album_name = self.master_metadata_album_album_name;
        models::NewTrackPlay {
            user_id,
            master_metadata_track_name: track_name.clone(),
            master_metadata_album_artist_name: artist_name.clone(),
            master_metadata_album_album_name: album_name.clone(),
            track_name,
            artist_name,
            album_name,
            played_at: self.ts.or(self.end_time),
            duration_ms: self.ms_played.or(self.legacy_ms_played).unwrap_or(0),
            platform: self.platform,
            conn_country: self.conn_country,
            spotify_track_uri: self.spotify_track_uri,
            reason_start: self.reason_start,
            reason_end: self.reason_end,
            shuffle: self.shuffle.unwrap_or(false),
            skipped: self.skipped.unwrap_or(false),
            offline: self.offline.unwrap_or(false),
            incognito_mode: self.incognito_mode.unwrap_or(false),
        }
    }
}

/// Parse the raw bytes of an uploaded history file. The top level
/// must be an array of entry objects.
pub fn parse_history(bytes: &[u8]) -> crate::Result<Vec<HistoryEntry>> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| se!("invalid json: {}", e))?;
    if !value.is_array() {
        return Err(se!("File content must be an array of listening history entries").into());
    }
    Ok(serde_json::from_value(value).map_err(|e| se!("invalid history entry: {}", e))?)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ImportedFile {
    pub name: String,
    pub entries: usize,
}

/// Import one stored history file for `user_id`: one archive row plus one
/// play per entry, written in a single transaction.
pub async fn import_file(
    pool: &SqlitePool,
    user_id: i64,
    path: &Path,
    original_name: &str,
) -> crate::Result<ImportedFile> {
    let bytes = async_std::fs::read(path)
        .await
        .map_err(|e| se!("error reading {}: {}", path.display(), e))?;
    let entries = parse_history(&bytes)?;
    let count = entries.len();
    let file_path = path.to_string_lossy().to_string();

    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting import transaction {:?}", e))?;
    db::insert_archive(&mut tr, user_id, &file_path, original_name, count as i64).await?;
    for entry in entries {
        db::insert_track_play(&mut tr, &entry.into_play(user_id)).await?;
    }
    tr.commit()
        .await
        .map_err(|e| se!("error committing import of {} {:?}", file_path, e))?;

    slog::info!(
        LOG, "imported history file";
        "user_id" => user_id,
        "file" => &file_path,
        "entries" => count,
    );
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| original_name.to_string());
    Ok(ImportedFile {
        name,
        entries: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    const EXTENDED: &str = r#"[
        {
            "ts": "2023-11-02T18:22:41Z",
            "platform": "android",
            "ms_played": 212000,
            "conn_country": "SE",
            "master_metadata_track_name": "Dancing Queen",
            "master_metadata_album_artist_name": "ABBA",
            "master_metadata_album_album_name": "Arrival",
            "spotify_track_uri": "spotify:track:0GjEhVFGZW8afUYGChu3Rr",
            "reason_start": "trackdone",
            "reason_end": "trackdone",
            "shuffle": true,
            "skipped": null,
            "offline": false,
            "incognito_mode": false
        },
        {
            "ts": "2023-11-02T18:30:00Z",
            "ms_played": 1500,
            "master_metadata_track_name": null,
            "episode_name": "Some podcast"
        }
    ]"#;

    #[test]
    fn maps_extended_history_fields() {
        let entries = parse_history(EXTENDED.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        let mut it = entries.into_iter();
        let play = it.next().unwrap().into_play(3);
        assert_eq!(play.user_id, 3);
        assert_eq!(play.track_name.as_deref(), Some("Dancing Queen"));
        assert_eq!(play.master_metadata_track_name.as_deref(), Some("Dancing Queen"));
        assert_eq!(play.artist_name.as_deref(), Some("ABBA"));
        assert_eq!(play.album_name.as_deref(), Some("Arrival"));
        assert_eq!(play.played_at.as_deref(), Some("2023-11-02T18:22:41Z"));
        assert_eq!(play.duration_ms, 212000);
        assert_eq!(play.conn_country.as_deref(), Some("SE"));
        assert!(play.shuffle);
        assert!(!play.skipped);

        let podcast = it.next().unwrap().into_play(3);
        assert_eq!(podcast.track_name, None);
        assert_eq!(podcast.platform, None);
        assert_eq!(podcast.duration_ms, 1500);
        assert!(!podcast.shuffle);
    }

    #[test]
    fn maps_legacy_account_data_fields() {
        let legacy = r#"[{"endTime": "2021-06-01 13:37", "artistName": "Daft Punk",
                          "trackName": "One More Time", "msPlayed": 320357}]"#;
        let play = parse_history(legacy.as_bytes())
            .unwrap()
            .pop()
            .unwrap()
            .into_play(1);
        assert_eq!(play.track_name.as_deref(), Some("One More Time"));
        assert_eq!(play.artist_name.as_deref(), Some("Daft Punk"));
        assert_eq!(play.album_name, None);
        assert_eq!(play.played_at.as_deref(), Some("2021-06-01 13:37"));
        assert_eq!(play.duration_ms, 320357);
    }

    #[test]
    fn rejects_non_arrays() {
        let err = parse_history(br#"{"ts": "2023-11-02T18:22:41Z"}"#).unwrap_err();
        assert!(err.to_string().contains("must be an array"));
        assert!(parse_history(b"[{").is_err());
        assert!(parse_history(b"[1, 2]").is_err());
        assert!(parse_history(b"[]").unwrap().is_empty());
    }

    #[async_std::test]
    async fn import_inserts_one_row_per_entry() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let other = user(&pool, "b@example.com").await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1700000000000-history.json");
        std::fs::write(&path, EXTENDED).unwrap();

        let imported = import_file(&pool, uid, &path, "history.json").await.unwrap();
        assert_eq!(
            imported,
            ImportedFile {
                name: "1700000000000-history.json".to_string(),
                entries: 2
            }
        );
        assert_eq!(db::count_track_plays(&pool, uid).await.unwrap(), 2);
        assert_eq!(db::count_track_plays(&pool, other).await.unwrap(), 0);
        let archives = db::list_archives(&pool, uid).await.unwrap();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].entries, 2);
        assert_eq!(archives[0].original_name, "history.json");

        // no ingest dedup: the same file again doubles the rows
        import_file(&pool, uid, &path, "history.json").await.unwrap();
        assert_eq!(db::count_track_plays(&pool, uid).await.unwrap(), 4);
    }

    #[async_std::test]
    async fn failed_import_leaves_nothing_behind() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"not": "an array"}"#).unwrap();

        assert!(import_file(&pool, uid, &path, "bad.json").await.is_err());
        assert_eq!(db::count_track_plays(&pool, uid).await.unwrap(), 0);
        assert_eq!(db::count_archives(&pool, uid).await.unwrap(), 0);
    }
}
