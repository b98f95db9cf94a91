//! Aggregate listening statistics.
//!
//! Every ranked category keeps the top `TOP_N` groups by play count,
//! ties broken by total listening time. Groups with a null or empty
//! key are left out.
use sqlx::SqlitePool;

use crate::{se, LOG};

pub const TOP_N: i64 = 10;

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopArtist {
    pub artist_name: String,
    pub play_count: i64,
    pub total_time: i64,
    pub albums: Option<String>,
    pub platforms_used: i64,
    pub skipped_count: i64,
    pub shuffle_count: i64,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopTrack {
    pub track_name: String,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub play_count: i64,
    pub total_time: i64,
    pub spotify_track_uri: Option<String>,
    pub platforms_used: i64,
    pub skipped_count: i64,
    pub shuffle_count: i64,
    pub countries_played: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopAlbum {
    pub album_name: String,
    pub artist_name: Option<String>,
    pub play_count: i64,
    pub unique_tracks: i64,
    pub total_time: i64,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlatformStat {
    pub platform: String,
    pub play_count: i64,
    pub unique_tracks: i64,
    pub unique_artists: i64,
    pub total_time: i64,
    pub countries_count: i64,
    pub skipped_count: i64,
    pub shuffle_count: i64,
    pub countries: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CountryStat {
    pub conn_country: String,
    pub play_count: i64,
    pub unique_tracks: i64,
    pub unique_artists: i64,
    pub total_time: i64,
    pub platforms_count: i64,
    pub platforms: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HourPattern {
    pub hour: String,
    pub play_count: i64,
    pub total_time: i64,
    pub shuffle_ratio: f64,
    pub skip_ratio: f64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub top_artists: Vec<TopArtist>,
    pub top_tracks: Vec<TopTrack>,
    pub top_albums: Vec<TopAlbum>,
    pub listening_patterns: Vec<HourPattern>,
    pub platform_stats: Vec<PlatformStat>,
    pub country_stats: Vec<CountryStat>,
}

/// Wrap a grouped query so only the top ranked groups come back, in rank order
fn ranked(grouped: &str, columns: &str) -> String {
    format!(
        "
        with grouped as ({grouped}),
        ranked as (
            select *, row_number() over (order by play_count desc, total_time desc) as play_rank
            from grouped
        )
        select {columns}
        from ranked
        where play_rank <= ?
        order by play_rank
        ",
        grouped = grouped,
        columns = columns,
    )
}

async fn fetch_ranked<T>(pool: &SqlitePool, sql: &str, user_id: i64) -> crate::Result<Vec<T>>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
{
    Ok(sqlx::query_as::<_, T>(sql)
        .bind(user_id)
        .bind(TOP_N)
        .fetch_all(pool)
        .await
        .map_err(|e| se!("ranked stats query error {:?}", e))?)
}

pub async fn top_artists(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<TopArtist>> {
    let sql = ranked(
        "
        select
            artist_name,
            count(*) as play_count,
            coalesce(sum(duration_ms), 0) as total_time,
            group_concat(distinct album_name) as albums,
            count(distinct platform) as platforms_used,
            sum(case when skipped = 1 then 1 else 0 end) as skipped_count,
            sum(case when shuffle = 1 then 1 else 0 end) as shuffle_count
        from track_plays
        where user_id = ? and artist_name is not null and artist_name != ''
        group by artist_name
        ",
        "artist_name, play_count, total_time, albums, platforms_used, skipped_count, shuffle_count",
    );
    fetch_ranked(pool, &sql, user_id).await
}

pub async fn top_tracks(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<TopTrack>> {
    let sql = ranked(
        "
        select
            track_name,
            artist_name,
            album_name,
            count(*) as play_count,
            coalesce(sum(duration_ms), 0) as total_time,
            max(spotify_track_uri) as spotify_track_uri,
            count(distinct platform) as platforms_used,
            sum(case when skipped = 1 then 1 else 0 end) as skipped_count,
            sum(case when shuffle = 1 then 1 else 0 end) as shuffle_count,
            group_concat(distinct conn_country) as countries_played
        from track_plays
        where user_id = ? and track_name is not null and track_name != ''
        group by track_name, artist_name, album_name
        ",
        "track_name, artist_name, album_name, play_count, total_time, spotify_track_uri, \
         platforms_used, skipped_count, shuffle_count, countries_played",
    );
    fetch_ranked(pool, &sql, user_id).await
}

pub async fn top_albums(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<TopAlbum>> {
    let sql = ranked(
        "
        select
            album_name,
            artist_name,
            count(*) as play_count,
            count(distinct track_name) as unique_tracks,
            coalesce(sum(duration_ms), 0) as total_time
        from track_plays
        where user_id = ? and album_name is not null and album_name != ''
        group by album_name, artist_name
        ",
        "album_name, artist_name, play_count, unique_tracks, total_time",
    );
    fetch_ranked(pool, &sql, user_id).await
}

pub async fn platform_stats(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<PlatformStat>> {
    let sql = ranked(
        "
        select
            platform,
            count(*) as play_count,
            count(distinct track_name) as unique_tracks,
            count(distinct artist_name) as unique_artists,
            coalesce(sum(duration_ms), 0) as total_time,
            count(distinct conn_country) as countries_count,
            sum(case when skipped = 1 then 1 else 0 end) as skipped_count,
            sum(case when shuffle = 1 then 1 else 0 end) as shuffle_count,
            group_concat(distinct conn_country) as countries
        from track_plays
        where user_id = ? and platform is not null and platform != ''
        group by platform
        ",
        "platform, play_count, unique_tracks, unique_artists, total_time, countries_count, \
         skipped_count, shuffle_count, countries",
    );
    fetch_ranked(pool, &sql, user_id).await
}

pub async fn country_stats(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<CountryStat>> {
    let sql = ranked(
        "
        select
            conn_country,
            count(*) as play_count,
            count(distinct track_name) as unique_tracks,
            count(distinct artist_name) as unique_artists,
            coalesce(sum(duration_ms), 0) as total_time,
            count(distinct platform) as platforms_count,
            group_concat(distinct platform) as platforms
        from track_plays
        where user_id = ? and conn_country is not null and conn_country != ''
        group by conn_country
        ",
        "conn_country, play_count, unique_tracks, unique_artists, total_time, \
         platforms_count, platforms",
    );
    fetch_ranked(pool, &sql, user_id).await
}

/// Plays per hour of day (UTC), at most one row per hour
pub async fn listening_patterns(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<HourPattern>> {
    Ok(sqlx::query_as::<_, HourPattern>(
        "
        select
            strftime('%H', played_at) as hour,
            count(*) as play_count,
            coalesce(sum(duration_ms), 0) as total_time,
            avg(case when shuffle = 1 then 1.0 else 0.0 end) as shuffle_ratio,
            avg(case when skipped = 1 then 1.0 else 0.0 end) as skip_ratio
        from track_plays
        where user_id = ? and strftime('%H', played_at) is not null
        group by hour
        order by hour
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| se!("listening patterns query error {:?}", e))?)
}

fn or_empty<T>(key: &str, user_id: i64, res: crate::Result<Vec<T>>) -> Vec<T> {
    match res {
        Ok(rows) => rows,
        Err(e) => {
            slog::error!(LOG, "error in {} query", key; "user_id" => user_id, "error" => e.to_string());
            vec![]
        }
    }
}

/// Run every stats query concurrently. A query that fails only
/// empties its own category.
pub async fn collect(pool: &SqlitePool, user_id: i64) -> Stats {
    let (artists, tracks, albums, patterns, platforms, countries) = futures::join!(
        top_artists(pool, user_id),
        top_tracks(pool, user_id),
        top_albums(pool, user_id),
        listening_patterns(pool, user_id),
        platform_stats(pool, user_id),
        country_stats(pool, user_id),
    );
    Stats {
        top_artists: or_empty("topArtists", user_id, artists),
        top_tracks: or_empty("topTracks", user_id, tracks),
        top_albums: or_empty("topAlbums", user_id, albums),
        listening_patterns: or_empty("listeningPatterns", user_id, patterns),
        platform_stats: or_empty("platformStats", user_id, platforms),
        country_stats: or_empty("countryStats", user_id, countries),
    }
}
