use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Sqlite};

use crate::{crypto, models, se, LOG};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if needed) the sqlite database at `url` and
/// bring its schema up to date
pub async fn connect(url: &str) -> crate::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .map_err(|e| se!("invalid database url {}: {}", url, e))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .map_err(|e| se!("error opening database {:?}", e))?;
    migrate(&pool).await?;
    slog::info!(LOG, "connected to sqlite database"; "url" => url);
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> crate::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| se!("error running migrations {:?}", e))?;
    Ok(())
}

// ---------- users ----------

pub async fn insert_user(
    pool: &SqlitePool,
    email: &str,
    password_hash: &str,
) -> std::result::Result<i64, sqlx::Error> {
    let res = sqlx::query("insert into users (email, password_hash) values (?, ?)")
        .bind(email)
        .bind(password_hash)
        .execute(pool)
        .await?;
    Ok(res.last_insert_rowid())
}

pub async fn find_user_by_email(pool: &SqlitePool, email: &str) -> crate::Result<Option<models::User>> {
    Ok(
        sqlx::query_as::<_, models::User>("select * from users where email = ?")
            .bind(email)
            .fetch_optional(pool)
            .await
            .map_err(|e| se!("error fetching user by email {:?}", e))?,
    )
}

pub async fn find_user_by_id(pool: &SqlitePool, id: i64) -> crate::Result<Option<models::User>> {
    Ok(
        sqlx::query_as::<_, models::User>("select * from users where id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| se!("error fetching user {} {:?}", id, e))?,
    )
}

// ---------- archives ----------

pub async fn insert_archive<'e, E>(
    ex: E,
    user_id: i64,
    file_path: &str,
    original_name: &str,
    entries: i64,
) -> crate::Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "insert into archives (user_id, file_path, original_name, entries) values (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(file_path)
    .bind(original_name)
    .bind(entries)
    .execute(ex)
    .await
    .map_err(|e| se!("error inserting archive for user {} {:?}", user_id, e))?;
    Ok(res.last_insert_rowid())
}

pub async fn list_archives(pool: &SqlitePool, user_id: i64) -> crate::Result<Vec<models::Archive>> {
    Ok(sqlx::query_as::<_, models::Archive>(
        "select * from archives where user_id = ? order by upload_date desc, id desc",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| se!("error listing archives for user {} {:?}", user_id, e))?)
}

pub async fn count_archives(pool: &SqlitePool, user_id: i64) -> crate::Result<i64> {
    Ok(
        sqlx::query_scalar::<_, i64>("select count(*) from archives where user_id = ?")
            .bind(user_id)
            .fetch_one(pool)
            .await
            .map_err(|e| se!("error counting archives for user {} {:?}", user_id, e))?,
    )
}

// ---------- track plays ----------

pub async fn insert_track_play<'e, E>(ex: E, play: &models::NewTrackPlay) -> crate::Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "
        insert into track_plays (
            user_id,
            track_name, artist_name, album_name,
            played_at, duration_ms,
            platform, conn_country,
            master_metadata_track_name,
            master_metadata_album_artist_name,
            master_metadata_album_album_name,
            spotify_track_uri,
            reason_start, reason_end,
            shuffle, skipped, offline, incognito_mode
        ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(play.user_id)
    .bind(&play.track_name)
    .bind(&play.artist_name)
    .bind(&play.album_name)
    .bind(&play.played_at)
    .bind(play.duration_ms)
    .bind(&play.platform)
    .bind(&play.conn_country)
    .bind(&play.master_metadata_track_name)
    .bind(&play.master_metadata_album_artist_name)
    .bind(&play.master_metadata_album_album_name)
    .bind(&play.spotify_track_uri)
    .bind(&play.reason_start)
    .bind(&play.reason_end)
    .bind(play.shuffle)
    .bind(play.skipped)
    .bind(play.offline)
    .bind(play.incognito_mode)
    .execute(ex)
    .await
    .map_err(|e| se!("error inserting track play for user {} {:?}", play.user_id, e))?;
    Ok(res.last_insert_rowid())
}

pub async fn count_track_plays(pool: &SqlitePool, user_id: i64) -> crate::Result<i64> {
    Ok(
        sqlx::query_scalar::<_, i64>("select count(*) from track_plays where user_id = ?")
            .bind(user_id)
            .fetch_one(pool)
            .await
            .map_err(|e| se!("error counting plays for user {} {:?}", user_id, e))?,
    )
}

pub async fn latest_track_play(
    pool: &SqlitePool,
    user_id: i64,
) -> crate::Result<Option<models::TrackPlay>> {
    Ok(sqlx::query_as::<_, models::TrackPlay>(
        "select * from track_plays where user_id = ? order by played_at desc, id desc limit 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| se!("failed fetching latest play for user {} {:?}", user_id, e))?)
}

/// Total listened milliseconds, zero when the user has no plays
pub async fn total_time_ms(pool: &SqlitePool, user_id: i64) -> crate::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(
        "select coalesce(sum(duration_ms), 0) from track_plays where user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(|e| se!("error summing play time for user {} {:?}", user_id, e))?)
}

/// Total listened milliseconds on a `YYYY-MM-DD` date (UTC)
pub async fn daily_time_ms(pool: &SqlitePool, user_id: i64, date: &str) -> crate::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(
        "
        select coalesce(sum(duration_ms), 0)
        from track_plays
        where user_id = ? and date(played_at) = ?
        ",
    )
    .bind(user_id)
    .bind(date)
    .fetch_one(pool)
    .await
    .map_err(|e| se!("error summing daily play time for user {} {:?}", user_id, e))?)
}

/// Remove plays that exactly repeat an earlier play of the same user,
/// keeping the lowest id of each group. Returns the number removed.
pub async fn dedup_track_plays<'e, E>(ex: E, user_id: i64) -> crate::Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "
        delete from track_plays
        where user_id = ?1
            and id not in (
                select min(id)
                from track_plays
                where user_id = ?1
                group by track_name, artist_name, album_name, played_at,
                         duration_ms, platform, conn_country, spotify_track_uri
            )
        ",
    )
    .bind(user_id)
    .execute(ex)
    .await
    .map_err(|e| se!("error removing duplicate plays for user {} {:?}", user_id, e))?;
    Ok(res.rows_affected())
}

/// Delete every play and archive row a user owns in one transaction.
/// The returned summary carries the archive file paths so the caller
/// can clean them up once the rows are gone.
pub async fn clear_user_data(pool: &SqlitePool, user_id: i64) -> crate::Result<models::ClearSummary> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting clear-data transaction {:?}", e))?;
    let file_paths = sqlx::query_scalar::<_, String>("select file_path from archives where user_id = ?")
        .bind(user_id)
        .fetch_all(&mut tr)
        .await
        .map_err(|e| se!("error collecting archive paths for user {} {:?}", user_id, e))?;
    let duplicates_removed = dedup_track_plays(&mut tr, user_id).await?;
    let track_plays_deleted = sqlx::query("delete from track_plays where user_id = ?")
        .bind(user_id)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("Failed to clear track plays {:?}", e))?
        .rows_affected();
    let archives_deleted = sqlx::query("delete from archives where user_id = ?")
        .bind(user_id)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("Failed to clear archives {:?}", e))?
        .rows_affected();
    tr.commit()
        .await
        .map_err(|e| se!("Failed to commit clear-data {:?}", e))?;
    Ok(models::ClearSummary {
        duplicates_removed,
        track_plays_deleted,
        archives_deleted,
        file_paths,
    })
}

// ---------- spotify tokens ----------

/// Store a fresh set of tokens for a user, replacing any previous set
pub async fn upsert_spotify_tokens(
    pool: &SqlitePool,
    user_id: i64,
    access_token: &crypto::Enc,
    refresh_token: &crypto::Enc,
    access_expires: i64,
    scope: &str,
) -> crate::Result<()> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting token transaction {:?}", e))?;
    sqlx::query(
        "
        insert into spotify_tokens (
            user_id,
            access_token, access_nonce,
            refresh_token, refresh_nonce,
            access_expires, scope
        )
        values (?, ?, ?, ?, ?, ?, ?)
        on conflict (user_id) do update set
            access_token = excluded.access_token, access_nonce = excluded.access_nonce,
            refresh_token = excluded.refresh_token, refresh_nonce = excluded.refresh_nonce,
            access_expires = excluded.access_expires, scope = excluded.scope,
            modified = current_timestamp
        ",
    )
    .bind(user_id)
    .bind(&access_token.value)
    .bind(&access_token.nonce)
    .bind(&refresh_token.value)
    .bind(&refresh_token.nonce)
    .bind(access_expires)
    .bind(scope)
    .execute(&mut tr)
    .await
    .map_err(|e| se!("error upserting spotify tokens for user {} {:?}", user_id, e))?;
    tr.commit()
        .await
        .map_err(|e| se!("error committing spotify tokens {:?}", e))?;
    Ok(())
}

pub async fn update_access_token(
    pool: &SqlitePool,
    user_id: i64,
    access_token: &crypto::Enc,
    access_expires: i64,
    refresh_token: Option<&crypto::Enc>,
) -> crate::Result<()> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting token refresh transaction {:?}", e))?;
    sqlx::query(
        "
        update spotify_tokens
            set access_token = ?, access_nonce = ?, access_expires = ?,
                modified = current_timestamp
            where user_id = ?
        ",
    )
    .bind(&access_token.value)
    .bind(&access_token.nonce)
    .bind(access_expires)
    .bind(user_id)
    .execute(&mut tr)
    .await
    .map_err(|e| se!("error updating access token for user {} {:?}", user_id, e))?;
    // spotify only sometimes rotates the refresh token
    if let Some(refresh_token) = refresh_token {
        sqlx::query("update spotify_tokens set refresh_token = ?, refresh_nonce = ? where user_id = ?")
            .bind(&refresh_token.value)
            .bind(&refresh_token.nonce)
            .bind(user_id)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error updating refresh token for user {} {:?}", user_id, e))?;
    }
    tr.commit()
        .await
        .map_err(|e| se!("error committing token refresh {:?}", e))?;
    Ok(())
}

pub async fn all_spotify_tokens(pool: &SqlitePool) -> crate::Result<Vec<models::SpotifyTokens>> {
    Ok(
        sqlx::query_as::<_, models::SpotifyTokens>("select * from spotify_tokens order by user_id")
            .fetch_all(pool)
            .await
            .map_err(|e| se!("error listing spotify tokens {:?}", e))?,
    )
}

pub async fn find_spotify_tokens(
    pool: &SqlitePool,
    user_id: i64,
) -> crate::Result<Option<models::SpotifyTokens>> {
    Ok(
        sqlx::query_as::<_, models::SpotifyTokens>("select * from spotify_tokens where user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| se!("error fetching spotify tokens for user {} {:?}", user_id, e))?,
    )
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A single-connection in-memory database with migrations applied.
    /// One connection because every sqlite `:memory:` connection is its
    /// own database.
    pub async fn memory_pool() -> SqlitePool {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    pub async fn user(pool: &SqlitePool, email: &str) -> i64 {
        insert_user(pool, email, "not-a-real-hash").await.unwrap()
    }

    pub fn play(user_id: i64, track: &str, artist: &str, played_at: &str, ms: i64) -> models::NewTrackPlay {
        models::NewTrackPlay {
            user_id,
            track_name: Some(track.to_string()),
            artist_name: Some(artist.to_string()),
            album_name: Some(format!("{} album", artist)),
            played_at: Some(played_at.to_string()),
            duration_ms: ms,
            platform: Some("android".to_string()),
            conn_country: Some("US".to_string()),
            master_metadata_track_name: Some(track.to_string()),
            master_metadata_album_artist_name: Some(artist.to_string()),
            master_metadata_album_album_name: Some(format!("{} album", artist)),
            spotify_track_uri: Some(format!("spotify:track:{}", track.replace(' ', ""))),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[async_std::test]
    async fn duplicate_email_is_rejected() {
        let pool = memory_pool().await;
        insert_user(&pool, "a@example.com", "h").await.unwrap();
        let err = insert_user(&pool, "a@example.com", "h").await.unwrap_err();
        match err {
            sqlx::Error::Database(e) => assert!(e.message().contains("UNIQUE")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[async_std::test]
    async fn total_time_is_zero_without_plays() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        assert_eq!(total_time_ms(&pool, uid).await.unwrap(), 0);
        assert_eq!(daily_time_ms(&pool, uid, "2024-01-01").await.unwrap(), 0);
    }

    #[async_std::test]
    async fn daily_time_only_counts_that_date() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        insert_track_play(&pool, &play(uid, "a", "x", "2024-03-07T01:00:00Z", 1000))
            .await
            .unwrap();
        insert_track_play(&pool, &play(uid, "b", "x", "2024-03-07T23:59:59Z", 2000))
            .await
            .unwrap();
        insert_track_play(&pool, &play(uid, "c", "x", "2024-03-08T00:00:00Z", 4000))
            .await
            .unwrap();
        assert_eq!(daily_time_ms(&pool, uid, "2024-03-07").await.unwrap(), 3000);
        assert_eq!(total_time_ms(&pool, uid).await.unwrap(), 7000);
    }

    #[async_std::test]
    async fn dedup_keeps_one_of_each_exact_duplicate() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let other = user(&pool, "b@example.com").await;
        let p = play(uid, "song", "artist", "2024-03-07T01:00:00Z", 1000);
        for _ in 0..3 {
            insert_track_play(&pool, &p).await.unwrap();
        }
        // same track, different duration: not a duplicate
        let mut shorter = p.clone();
        shorter.duration_ms = 500;
        insert_track_play(&pool, &shorter).await.unwrap();
        // nulls group together
        let mut no_country = p.clone();
        no_country.conn_country = None;
        insert_track_play(&pool, &no_country).await.unwrap();
        insert_track_play(&pool, &no_country).await.unwrap();
        // another user's copies are not touched
        let mut theirs = p.clone();
        theirs.user_id = other;
        insert_track_play(&pool, &theirs).await.unwrap();
        insert_track_play(&pool, &theirs).await.unwrap();

        let removed = dedup_track_plays(&pool, uid).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(count_track_plays(&pool, uid).await.unwrap(), 3);
        assert_eq!(count_track_plays(&pool, other).await.unwrap(), 2);
    }

    #[async_std::test]
    async fn clear_user_data_leaves_other_users_alone() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let other = user(&pool, "b@example.com").await;
        insert_archive(&pool, uid, "uploads/1-a.json", "a.json", 2)
            .await
            .unwrap();
        insert_archive(&pool, other, "uploads/2-b.json", "b.json", 1)
            .await
            .unwrap();
        let p = play(uid, "song", "artist", "2024-03-07T01:00:00Z", 1000);
        insert_track_play(&pool, &p).await.unwrap();
        insert_track_play(&pool, &p).await.unwrap();
        insert_track_play(&pool, &play(other, "s", "a", "2024-03-07T01:00:00Z", 10))
            .await
            .unwrap();

        let summary = clear_user_data(&pool, uid).await.unwrap();
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(summary.track_plays_deleted, 1);
        assert_eq!(summary.archives_deleted, 1);
        assert_eq!(summary.file_paths, vec!["uploads/1-a.json".to_string()]);

        assert_eq!(count_track_plays(&pool, uid).await.unwrap(), 0);
        assert_eq!(count_archives(&pool, uid).await.unwrap(), 0);
        assert_eq!(count_track_plays(&pool, other).await.unwrap(), 1);
        assert_eq!(count_archives(&pool, other).await.unwrap(), 1);
    }

    #[async_std::test]
    async fn spotify_tokens_are_replaced_on_reauth() {
        let pool = memory_pool().await;
        let uid = user(&pool, "a@example.com").await;
        let enc = |v: &str| crypto::Enc {
            value: v.to_string(),
            nonce: "n".to_string(),
        };
        upsert_spotify_tokens(&pool, uid, &enc("a1"), &enc("r1"), 100, "s")
            .await
            .unwrap();
        upsert_spotify_tokens(&pool, uid, &enc("a2"), &enc("r2"), 200, "s")
            .await
            .unwrap();
        let all = all_spotify_tokens(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].access_token, "a2");
        assert_eq!(all[0].refresh_token, "r2");

        update_access_token(&pool, uid, &enc("a3"), 300, None)
            .await
            .unwrap();
        let t = find_spotify_tokens(&pool, uid).await.unwrap().unwrap();
        assert_eq!(t.access_token, "a3");
        assert_eq!(t.access_expires, 300);
        assert_eq!(t.refresh_token, "r2");
    }
}
