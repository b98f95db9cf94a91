use sqlx::SqlitePool;

use crate::{crypto, db, models, se, utils, CONFIG, LOG};

pub const SCOPES: &str = "user-read-currently-playing user-read-playback-state";

#[derive(serde::Deserialize, Debug)]
pub struct SpotifyAccess {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct SpotifyAccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

impl SpotifyAccessParams {
    fn from_code(code: &str) -> Self {
        SpotifyAccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: CONFIG.spotify_redirect_url(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

/// The spotify page a user is sent to for granting us playback access
pub fn authorize_url(state: &str) -> crate::Result<String> {
    let mut url = surf::Url::parse("https://accounts.spotify.com/authorize")
        .map_err(|e| se!("invalid authorize url {}", e))?;
    url.query_pairs_mut()
        .append_pair("client_id", &CONFIG.spotify_client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", &CONFIG.spotify_redirect_url())
        .append_pair("scope", SCOPES)
        .append_pair("state", state);
    Ok(url.to_string())
}

fn basic_auth() -> String {
    let auth = base64::encode(
        format!("{}:{}", CONFIG.spotify_client_id, CONFIG.spotify_secret_id).as_bytes(),
    );
    format!("Basic {}", auth)
}

pub async fn new_spotify_access_token(code: &str) -> crate::Result<SpotifyAccess> {
    let mut resp = surf::post("https://accounts.spotify.com/api/token")
        .body(
            surf::Body::from_form(&SpotifyAccessParams::from_code(code))
                .map_err(|e| se!("form error {}", e))?,
        )
        .header("authorization", basic_auth())
        .send()
        .await
        .map_err(|e| se!("account request error {:?}", e))?;
    if !resp.status().is_success() {
        let body = resp.body_string().await.unwrap_or_default();
        return Err(se!("spotify token exchange failed {} {}", resp.status(), body).into());
    }
    let access: SpotifyAccess = resp
        .body_json()
        .await
        .map_err(|e| se!("json parse error {}", e))?;
    Ok(access)
}

pub async fn refresh_access_token(refresh_token: &str) -> crate::Result<SpotifyAccess> {
    let body = surf::Body::from_form(&RefreshParams::from_token(refresh_token))
        .map_err(|_| se!("error generating form data from refresh params"))?;
    let mut resp = surf::post("https://accounts.spotify.com/api/token")
        .body(body)
        .header("authorization", basic_auth())
        .send()
        .await
        .map_err(|e| se!("account refresh request error {:?}", e))?;
    if !resp.status().is_success() {
        let body = resp.body_string().await.unwrap_or_default();
        return Err(se!("spotify token refresh failed {} {}", resp.status(), body).into());
    }
    let access: SpotifyAccess = resp
        .body_json()
        .await
        .map_err(|e| se!("account refresh json parse error {:?}", e))?;
    Ok(access)
}

/// Spotify hands out lifetimes in seconds from now. Store an absolute
/// epoch expiry a minute early so a token is never used right at the edge.
pub fn spotify_expiry_seconds_to_epoch_expiration(expires_in: u64) -> crate::Result<i64> {
    Ok(utils::now_seconds()? + expires_in.saturating_sub(60) as i64)
}

/// Encrypt and store the tokens from a completed authorization
pub async fn store_access(pool: &SqlitePool, user_id: i64, access: &SpotifyAccess) -> crate::Result<()> {
    let refresh = access
        .refresh_token
        .as_ref()
        .ok_or_else(|| se!("missing refresh token"))?;
    let access_token = crypto::encrypt(&access.access_token)?;
    let refresh_token = crypto::encrypt(refresh)?;
    let access_expires = spotify_expiry_seconds_to_epoch_expiration(access.expires_in)?;
    db::upsert_spotify_tokens(
        pool,
        user_id,
        &access_token,
        &refresh_token,
        access_expires,
        &access.scope,
    )
    .await
}

/// Return a usable access token for the user, refreshing (and persisting)
/// it first when the stored one has expired
pub async fn get_user_access_token(pool: &SqlitePool, tokens: &models::SpotifyTokens) -> crate::Result<String> {
    if tokens.access_expires > utils::now_seconds()? {
        return crypto::decrypt(&crypto::Enc {
            value: tokens.access_token.clone(),
            nonce: tokens.access_nonce.clone(),
        });
    }

    slog::info!(LOG, "refreshing access token for user {}", &tokens.user_id);
    let refresh_token = crypto::decrypt(&crypto::Enc {
        value: tokens.refresh_token.clone(),
        nonce: tokens.refresh_nonce.clone(),
    })?;

    let access = refresh_access_token(&refresh_token).await?;
    let enc_access = crypto::encrypt(&access.access_token)?;
    let access_expires = spotify_expiry_seconds_to_epoch_expiration(access.expires_in)?;
    let enc_refresh = match access.refresh_token {
        Some(ref r) => Some(crypto::encrypt(r)?),
        None => None,
    };
    db::update_access_token(
        pool,
        tokens.user_id,
        &enc_access,
        access_expires,
        enc_refresh.as_ref(),
    )
    .await?;

    Ok(access.access_token)
}

/// The raw currently-playing payload, `None` when nothing is playing
pub async fn get_currently_playing(access_token: &str) -> crate::Result<Option<serde_json::Value>> {
    let mut resp = surf::get("https://api.spotify.com/v1/me/player/currently-playing")
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| se!("get currently playing error {:?}", e))?;
    if resp.status() == surf::StatusCode::NoContent {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(se!("get currently playing failed with status {}", resp.status()).into());
    }
    let resp: serde_json::Value = resp
        .body_json()
        .await
        .map_err(|e| se!("get currently playing json error {:?}", e))?;
    Ok(Some(resp))
}

/// Turn a currently-playing payload into a play for `user_id`.
///
/// Non "track" things like podcast episodes come back with a null
/// or non-track item, those and paused playback produce `None`.
pub fn play_from_currently_playing(
    user_id: i64,
    current: &serde_json::Value,
    played_at: chrono::DateTime<chrono::Utc>,
) -> crate::Result<Option<models::NewTrackPlay>> {
    let item = &current["item"];
    if item.is_null() {
        return Ok(None);
    }
    if let Some(kind) = item["type"].as_str() {
        if kind != "track" {
            return Ok(None);
        }
    }
    let is_playing = current["is_playing"].as_bool().unwrap_or(false);
    if !is_playing {
        return Ok(None);
    }
    let uri = item["uri"]
        .as_str()
        .ok_or_else(|| se!("currently playing uri: unexpected shape {:?}", current))?;
    let name = item["name"]
        .as_str()
        .ok_or_else(|| se!("currently playing name: unexpected shape {:?}", current))?;
    let artist_name = item["artists"][0]["name"].as_str().map(str::to_string);
    let album_name = item["album"]["name"].as_str().map(str::to_string);
    let duration_ms = item["duration_ms"].as_i64().unwrap_or(0);
    let shuffle = current["shuffle_state"].as_bool().unwrap_or(false);

    Ok(Some(models::NewTrackPlay {
        user_id,
        track_name: Some(name.to_string()),
        artist_name: artist_name.clone(),
        album_name: album_name.clone(),
        played_at: Some(utils::to_history_timestamp(played_at)),
        duration_ms,
        platform: Some("Spotify".to_string()),
        conn_country: None,
        master_metadata_track_name: Some(name.to_string()),
        master_metadata_album_artist_name: artist_name,
        master_metadata_album_album_name: album_name,
        spotify_track_uri: Some(uri.to_string()),
        reason_start: None,
        reason_end: None,
        shuffle,
        skipped: false,
        offline: false,
        incognito_mode: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2024, 3, 7, 21, 4, 11).unwrap()
    }

    #[test]
    fn maps_a_playing_track() {
        let current = serde_json::json!({
            "is_playing": true,
            "timestamp": 1709845451000i64,
            "item": {
                "type": "track",
                "name": "Harder, Better, Faster, Stronger",
                "uri": "spotify:track:5W3cjX2J3tjhG8zb6u0qHn",
                "duration_ms": 224693,
                "album": {"name": "Discovery"},
                "artists": [{"name": "Daft Punk"}, {"name": "Someone Else"}]
            }
        });
        let play = play_from_currently_playing(9, &current, now())
            .unwrap()
            .unwrap();
        assert_eq!(play.user_id, 9);
        assert_eq!(play.track_name.as_deref(), Some("Harder, Better, Faster, Stronger"));
        assert_eq!(play.artist_name.as_deref(), Some("Daft Punk"));
        assert_eq!(play.album_name.as_deref(), Some("Discovery"));
        assert_eq!(play.master_metadata_album_album_name.as_deref(), Some("Discovery"));
        assert_eq!(play.duration_ms, 224693);
        assert_eq!(play.platform.as_deref(), Some("Spotify"));
        assert_eq!(play.played_at.as_deref(), Some("2024-03-07T21:04:11Z"));
        assert_eq!(
            play.spotify_track_uri.as_deref(),
            Some("spotify:track:5W3cjX2J3tjhG8zb6u0qHn")
        );
        assert!(!play.shuffle);
    }

    #[test]
    fn skips_episodes_and_paused_playback() {
        let episode = serde_json::json!({
            "is_playing": true,
            "currently_playing_type": "episode",
            "item": {"type": "episode", "name": "ep", "uri": "spotify:episode:1"}
        });
        assert!(play_from_currently_playing(1, &episode, now()).unwrap().is_none());

        let no_item = serde_json::json!({"is_playing": true, "item": null});
        assert!(play_from_currently_playing(1, &no_item, now()).unwrap().is_none());

        let paused = serde_json::json!({
            "is_playing": false,
            "item": {"type": "track", "name": "t", "uri": "spotify:track:1"}
        });
        assert!(play_from_currently_playing(1, &paused, now()).unwrap().is_none());
    }

    #[test]
    fn malformed_track_is_an_error() {
        let current = serde_json::json!({"is_playing": true, "item": {"type": "track"}});
        assert!(play_from_currently_playing(1, &current, now()).is_err());
    }

    #[test]
    fn authorize_url_carries_state_and_scopes() {
        let url = authorize_url("abc123").unwrap();
        assert!(url.starts_with("https://accounts.spotify.com/authorize?"));
        let parsed = surf::Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["state"], "abc123");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], SCOPES);
        assert_eq!(pairs["redirect_uri"], CONFIG.spotify_redirect_url());
    }

    #[test]
    fn expiry_is_pulled_in_a_minute() {
        let now = utils::now_seconds().unwrap();
        let exp = spotify_expiry_seconds_to_epoch_expiration(3600).unwrap();
        assert!(exp >= now + 3540 && exp <= now + 3541);
        assert!(spotify_expiry_seconds_to_epoch_expiration(10).unwrap() <= now + 1);
    }
}
