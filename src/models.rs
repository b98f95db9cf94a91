#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    // argon2 PHC string, never serialized
    #[serde(skip)]
    pub password_hash: String,
    pub created: String,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct Archive {
    pub id: i64,
    pub user_id: i64,
    pub file_path: String,
    pub original_name: String,
    pub entries: i64,
    pub upload_date: String,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct TrackPlay {
    pub id: i64,
    pub user_id: i64,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub played_at: Option<String>,
    pub duration_ms: i64,
    pub platform: Option<String>,
    pub conn_country: Option<String>,
    pub master_metadata_track_name: Option<String>,
    pub master_metadata_album_artist_name: Option<String>,
    pub master_metadata_album_album_name: Option<String>,
    pub spotify_track_uri: Option<String>,
    pub reason_start: Option<String>,
    pub reason_end: Option<String>,
    pub shuffle: bool,
    pub skipped: bool,
    pub offline: bool,
    pub incognito_mode: bool,
}

/// A play that hasn't been written yet, either from an uploaded
/// history file or from the currently-playing poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTrackPlay {
    pub user_id: i64,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub played_at: Option<String>,
    pub duration_ms: i64,
    pub platform: Option<String>,
    pub conn_country: Option<String>,
    pub master_metadata_track_name: Option<String>,
    pub master_metadata_album_artist_name: Option<String>,
    pub master_metadata_album_album_name: Option<String>,
    pub spotify_track_uri: Option<String>,
    pub reason_start: Option<String>,
    pub reason_end: Option<String>,
    pub shuffle: bool,
    pub skipped: bool,
    pub offline: bool,
    pub incognito_mode: bool,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SpotifyTokens {
    pub user_id: i64,
    // a spotify access token that can be used to access
    // the spotify user's playback. This value is AES_256_GCM
    // encrypted using the application secret set in the
    // current environment and the `access_nonce` generated
    // when the value was originally encrypted.
    pub access_token: String,
    pub access_nonce: String,
    // a spotify token that can be used to refresh the
    // access_token. This is encrypted and stored the
    // same way as the actual access_token.
    pub refresh_token: String,
    pub refresh_nonce: String,
    // timestamp in seconds from epoch when the current
    // spotify access_token expires
    pub access_expires: i64,
    pub scope: String,
    pub created: String,
    pub modified: String,
}

/// What a clear-data request removed
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClearSummary {
    pub duplicates_removed: u64,
    pub track_plays_deleted: u64,
    pub archives_deleted: u64,
    #[serde(skip)]
    pub file_paths: Vec<String>,
}
