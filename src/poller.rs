use std::collections::HashMap;
use std::sync::Arc;

use async_mutex::Mutex;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::{db, models, spotify, Result, CONFIG, LOG};

/// Minimum gap between two recorded plays of the same track
pub const DEBOUNCE_SECONDS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct LastPlay {
    pub uri: String,
    pub recorded_at: DateTime<Utc>,
}

impl LastPlay {
    /// The debounce state implied by a stored play, if it carries a
    /// track uri and an rfc3339 `played_at`
    pub fn from_track_play(play: &models::TrackPlay) -> Option<Self> {
        let uri = play.spotify_track_uri.clone()?;
        let recorded_at = DateTime::parse_from_rfc3339(play.played_at.as_deref()?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self { uri, recorded_at })
    }
}

/// The last track recorded per user. Kept in memory, and seeded from
/// the user's latest stored play the first time a user is seen.
#[derive(Clone)]
pub struct LastPlays {
    inner: Arc<Mutex<HashMap<i64, LastPlay>>>,
}

impl LastPlays {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record `uri` as the user's latest play if it should be kept,
    /// returning whether it was
    pub async fn check_and_set(&self, user_id: i64, uri: &str, now: DateTime<Utc>) -> bool {
        let mut lock = self.inner.lock().await;
        if !should_record(lock.get(&user_id), uri, now) {
            return false;
        }
        lock.insert(
            user_id,
            LastPlay {
                uri: uri.to_string(),
                recorded_at: now,
            },
        );
        true
    }

    pub async fn contains(&self, user_id: i64) -> bool {
        self.inner.lock().await.contains_key(&user_id)
    }

    /// Set the user's last play unless one is already tracked
    pub async fn seed(&self, user_id: i64, last: LastPlay) {
        self.inner.lock().await.entry(user_id).or_insert(last);
    }

    /// Undo a `check_and_set` whose insert didn't make it to the database
    pub async fn forget(&self, user_id: i64) {
        self.inner.lock().await.remove(&user_id);
    }
}

/// A play is recorded when the track changed or enough time passed
/// since the last one was recorded
pub fn should_record(last: Option<&LastPlay>, uri: &str, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => {
            last.uri != uri || now - last.recorded_at >= Duration::seconds(DEBOUNCE_SECONDS)
        }
    }
}

async fn record_current(
    pool: &SqlitePool,
    last_plays: &LastPlays,
    user_id: i64,
    current: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool> {
    let play = match spotify::play_from_currently_playing(user_id, current, now)? {
        Some(play) => play,
        None => {
            slog::debug!(LOG, "nothing playing for user {:?}", user_id);
            return Ok(false);
        }
    };
    if !last_plays.contains(user_id).await {
        // a restart shouldn't re-record the track that was playing before it
        let latest = db::latest_track_play(pool, user_id).await?;
        if let Some(last) = latest.as_ref().and_then(LastPlay::from_track_play) {
            last_plays.seed(user_id, last).await;
        }
    }
    let uri = play.spotify_track_uri.clone().unwrap_or_default();
    if !last_plays.check_and_set(user_id, &uri, now).await {
        slog::debug!(
            LOG,
            "{} currently listening to {:?} (no change)",
            user_id,
            play.track_name
        );
        return Ok(false);
    }
    if let Err(e) = db::insert_track_play(pool, &play).await {
        last_plays.forget(user_id).await;
        return Err(e);
    }
    slog::info!(LOG, "{} new current song {:?}", user_id, play.track_name);
    Ok(true)
}

async fn _currently_playing_user(
    pool: &SqlitePool,
    last_plays: &LastPlays,
    tokens: &models::SpotifyTokens,
) -> Result<bool> {
    let access_token = spotify::get_user_access_token(pool, tokens).await?;
    match spotify::get_currently_playing(&access_token).await? {
        Some(current) => record_current(pool, last_plays, tokens.user_id, &current, Utc::now()).await,
        None => Ok(false),
    }
}

async fn _poll_user(pool: &SqlitePool, last_plays: &LastPlays, tokens: &models::SpotifyTokens) {
    if let Err(e) = _currently_playing_user(pool, last_plays, tokens).await {
        // a failed refresh or fetch only skips this user until the next tick
        slog::error!(
            LOG,
            "error polling currently playing for user {:?} {:?}",
            tokens.user_id,
            e
        );
    }
}

async fn _background_currently_playing_poll_inner(pool: &SqlitePool, last_plays: &LastPlays) -> Result<()> {
    let users = db::all_spotify_tokens(pool).await?;
    slog::info!(LOG, "polling {} users", users.len());

    let polls: Vec<_> = users
        .iter()
        .map(|tokens| _poll_user(pool, last_plays, tokens))
        .collect();
    futures::future::join_all(polls).await;
    Ok(())
}

pub async fn background_currently_playing_poll(pool: SqlitePool) {
    let last_plays = LastPlays::new();
    loop {
        async_std::task::sleep(std::time::Duration::from_secs(CONFIG.poll_interval_seconds)).await;
        if let Err(e) = _background_currently_playing_poll_inner(&pool, &last_plays).await {
            slog::error!(
                LOG,
                "error while running background currently playing poll {:?}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 21, 0, 0).unwrap() + Duration::seconds(secs as i64)
    }

    fn playing(uri: &str) -> serde_json::Value {
        serde_json::json!({
            "is_playing": true,
            "item": {
                "type": "track",
                "name": "song",
                "uri": uri,
                "duration_ms": 180000,
                "album": {"name": "album"},
                "artists": [{"name": "artist"}]
            }
        })
    }

    #[test]
    fn debounce_rules() {
        assert!(should_record(None, "spotify:track:a", at(0)));
        let last = LastPlay {
            uri: "spotify:track:a".to_string(),
            recorded_at: at(0),
        };
        assert!(!should_record(Some(&last), "spotify:track:a", at(29)));
        assert!(should_record(Some(&last), "spotify:track:a", at(30)));
        assert!(should_record(Some(&last), "spotify:track:b", at(1)));
    }

    #[async_std::test]
    async fn last_plays_are_tracked_per_user() {
        let last_plays = LastPlays::new();
        assert!(last_plays.check_and_set(1, "spotify:track:a", at(0)).await);
        assert!(!last_plays.check_and_set(1, "spotify:track:a", at(10)).await);
        assert!(last_plays.check_and_set(2, "spotify:track:a", at(10)).await);
        last_plays.forget(1).await;
        assert!(last_plays.check_and_set(1, "spotify:track:a", at(11)).await);
    }

    #[async_std::test]
    async fn debounce_survives_a_restart() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        // recorded before the restart, at at(0)
        db::insert_track_play(&pool, &play(uid, "a", "artist", "2024-03-07T21:00:00Z", 1000))
            .await
            .unwrap();

        let fresh = LastPlays::new();
        let a = playing("spotify:track:a");
        assert!(!record_current(&pool, &fresh, uid, &a, at(10)).await.unwrap());
        assert!(record_current(&pool, &fresh, uid, &a, at(40)).await.unwrap());
        assert_eq!(db::count_track_plays(&pool, uid).await.unwrap(), 2);
    }

    #[test]
    fn last_play_from_stored_rows() {
        let row = |uri: Option<&str>, played_at: Option<&str>| models::TrackPlay {
            id: 1,
            user_id: 1,
            track_name: None,
            artist_name: None,
            album_name: None,
            played_at: played_at.map(str::to_string),
            duration_ms: 0,
            platform: None,
            conn_country: None,
            master_metadata_track_name: None,
            master_metadata_album_artist_name: None,
            master_metadata_album_album_name: None,
            spotify_track_uri: uri.map(str::to_string),
            reason_start: None,
            reason_end: None,
            shuffle: false,
            skipped: false,
            offline: false,
            incognito_mode: false,
        };
        let last = LastPlay::from_track_play(&row(Some("spotify:track:a"), Some("2024-03-07T21:00:00Z")))
            .unwrap();
        assert_eq!(last.recorded_at, at(0));
        assert!(LastPlay::from_track_play(&row(None, Some("2024-03-07T21:00:00Z"))).is_none());
        assert!(LastPlay::from_track_play(&row(Some("spotify:track:a"), Some("2021-06-01 13:37"))).is_none());
    }

    #[async_std::test]
    async fn records_only_changed_or_stale_tracks() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let last_plays = LastPlays::new();

        let a = playing("spotify:track:a");
        let b = playing("spotify:track:b");
        assert!(record_current(&pool, &last_plays, uid, &a, at(0)).await.unwrap());
        assert!(!record_current(&pool, &last_plays, uid, &a, at(15)).await.unwrap());
        assert!(record_current(&pool, &last_plays, uid, &b, at(20)).await.unwrap());
        assert!(record_current(&pool, &last_plays, uid, &b, at(50)).await.unwrap());
        let paused = serde_json::json!({"is_playing": false, "item": a["item"].clone()});
        assert!(!record_current(&pool, &last_plays, uid, &paused, at(90)).await.unwrap());

        assert_eq!(db::count_track_plays(&pool, uid).await.unwrap(), 3);
        let latest = db::latest_track_play(&pool, uid).await.unwrap().unwrap();
        assert_eq!(latest.spotify_track_uri.as_deref(), Some("spotify:track:b"));
        assert_eq!(latest.platform.as_deref(), Some("Spotify"));
        assert_eq!(latest.played_at.as_deref(), Some("2024-03-07T21:00:50Z"));
    }
}
