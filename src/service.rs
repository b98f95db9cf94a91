use std::path::PathBuf;

use cached::Cached;
use sqlx::SqlitePool;
use tide::http::headers::HeaderValue;
use tide::security::{CorsMiddleware, Origin};

use crate::upload::{self, UploadError};
use crate::{auth, db, import, resp, se, spotify, stats, utils, CONFIG, LOG};

#[derive(Clone)]
pub struct Context {
    pub pool: SqlitePool,
    pub upload_dir: PathBuf,
}

fn cors() -> crate::Result<CorsMiddleware> {
    let methods: HeaderValue = "GET, POST, DELETE, OPTIONS"
        .parse()
        .map_err(|e| se!("invalid cors methods {}", e))?;
    let headers: HeaderValue = "Authorization, Content-Type"
        .parse()
        .map_err(|e| se!("invalid cors headers {}", e))?;
    Ok(CorsMiddleware::new()
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_origin(Origin::from(CONFIG.frontend_url.as_str()))
        .allow_credentials(true))
}

pub fn build_app(ctx: Context) -> crate::Result<tide::Server<Context>> {
    let mut app = tide::with_state(ctx);
    app.with(cors()?);
    app.with(crate::logging::LogMiddleware::new());
    app.at("/status").get(status);
    app.at("/register").post(register);
    app.at("/login").post(login);
    app.at("/user").get(current_user);
    app.at("/upload").post(upload);
    app.at("/total-time").get(total_time);
    app.at("/daily-time").get(daily_time);
    app.at("/archives").get(archives);
    app.at("/stats").get(user_stats);
    app.at("/clear-data").delete(clear_data);
    app.at("/spotify/auth").get(spotify_auth);
    app.at("/callback").get(auth_callback);
    Ok(app)
}

pub async fn start(pool: sqlx::SqlitePool, upload_dir: PathBuf) -> crate::Result<()> {
    let app = build_app(Context { pool, upload_dir })?;
    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.listen_addr()).await?;
    Ok(())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

/// Resolve the bearer token's user or bail out of the handler
/// with the matching 401/403
macro_rules! user_or_unauthorized {
    ($req:expr) => {{
        let header = $req
            .header("Authorization")
            .map(|h| h.last().as_str().to_string());
        match auth::authenticate(&$req.state().pool, &CONFIG.jwt_secret, header.as_deref()).await {
            Ok(claims) => claims,
            Err(rejection) => {
                slog::info!(
                    LOG, "rejected request";
                    "path" => $req.url().path(),
                    "reason" => rejection.message,
                );
                return Ok(resp!(status => rejection.status, message => rejection.message));
            }
        }
    }};
}

#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct Credentials {
    email: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn required(self) -> Option<(String, String)> {
        match (self.email, self.password) {
            (Some(email), Some(password)) if !email.trim().is_empty() && !password.is_empty() => {
                Some((email.trim().to_string(), password))
            }
            _ => None,
        }
    }
}

async fn register(mut req: tide::Request<Context>) -> tide::Result {
    let creds: Credentials = req.body_json().await.unwrap_or_default();
    let (email, password) = match creds.required() {
        Some(creds) => creds,
        None => return Ok(resp!(status => 400, message => "Email and password are required")),
    };
    let hash = async_std::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| se!("error hashing password {}", e))?;

    match db::insert_user(&req.state().pool, &email, &hash).await {
        Ok(id) => {
            slog::info!(LOG, "registered new user"; "user_id" => id);
            Ok(resp!(status => 201, json => serde_json::json!({ "id": id })))
        }
        Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => {
            Ok(resp!(status => 400, message => "Email already exists"))
        }
        Err(e) => Err(se!("error creating user {:?}", e).into()),
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

async fn login(mut req: tide::Request<Context>) -> tide::Result {
    let creds: Credentials = req.body_json().await.unwrap_or_default();
    let (email, password) = match creds.required() {
        Some(creds) => creds,
        None => return Ok(resp!(status => 400, message => "Email and password are required")),
    };
    let user = db::find_user_by_email(&req.state().pool, &email)
        .await
        .map_err(|e| se!("error loading user {}", e))?;
    let user = match user {
        Some(user) => user,
        None => return Ok(resp!(status => 401, message => "Invalid credentials")),
    };
    let hash = user.password_hash.clone();
    let valid = async_std::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(|e| se!("error verifying password {}", e))?;
    if !valid {
        slog::info!(LOG, "failed login"; "user_id" => user.id);
        return Ok(resp!(status => 401, message => "Invalid credentials"));
    }
    let access_token = auth::issue_token(
        &CONFIG.jwt_secret,
        user.id,
        &user.email,
        CONFIG.jwt_expiration_seconds,
    )
    .map_err(|e| se!("error issuing token {}", e))?;
    Ok(resp!(json => LoginResponse { access_token }))
}

#[derive(serde::Serialize)]
struct UserProfile {
    id: i64,
    email: String,
    spotify_connected: bool,
    track_plays: i64,
    archives: i64,
}

async fn current_user(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let pool = &req.state().pool;
    let user = match db::find_user_by_id(pool, claims.id)
        .await
        .map_err(|e| se!("error loading user {}", e))?
    {
        Some(user) => user,
        None => return Ok(resp!(status => 403, message => "User not found")),
    };
    let spotify_connected = db::find_spotify_tokens(pool, user.id)
        .await
        .map_err(|e| se!("error loading spotify tokens {}", e))?
        .is_some();
    let track_plays = db::count_track_plays(pool, user.id)
        .await
        .map_err(|e| se!("{}", e))?;
    let archives = db::count_archives(pool, user.id)
        .await
        .map_err(|e| se!("{}", e))?;
    Ok(resp!(json => UserProfile {
        id: user.id,
        email: user.email,
        spotify_connected,
        track_plays,
        archives,
    }))
}

fn upload_rejection(e: UploadError) -> tide::Response {
    slog::warn!(LOG, "rejected upload"; "error" => e.to_string());
    resp!(status => e.status(), message => e.title(), details => e.to_string())
}

async fn upload(mut req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let content_type = req
        .header("Content-Type")
        .map(|h| h.last().as_str().to_string())
        .unwrap_or_default();
    let boundary = match multer::parse_boundary(&content_type) {
        Ok(boundary) => boundary,
        Err(_) => return Ok(upload_rejection(UploadError::NotMultipart)),
    };
    let upload_dir = req.state().upload_dir.clone();
    let stream = upload::body_stream(req.take_body());
    let stored = match upload::receive_files(stream, &boundary, &upload_dir, upload::Limits::from_config()).await {
        Ok(stored) => stored,
        Err(e) => return Ok(upload_rejection(e)),
    };

    let pool = &req.state().pool;
    let mut files = Vec::with_capacity(stored.len());
    for (i, file) in stored.iter().enumerate() {
        match import::import_file(pool, claims.id, &file.path, &file.original_name).await {
            Ok(imported) => files.push(imported),
            Err(e) => {
                slog::error!(
                    LOG, "error processing uploaded file";
                    "user_id" => claims.id,
                    "file" => &file.original_name,
                    "error" => e.to_string(),
                );
                // earlier files are committed, this one and the rest have no archive row
                let unimported: Vec<PathBuf> = stored[i..].iter().map(|f| f.path.clone()).collect();
                upload::remove_files(&unimported).await;
                return Ok(resp!(
                    status => 500,
                    message => "Failed to process files",
                    details => e.to_string()
                ));
            }
        }
    }
    Ok(resp!(json => serde_json::json!({
        "message": "Files processed successfully",
        "files": files,
    })))
}

async fn total_time(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let total_time_ms = db::total_time_ms(&req.state().pool, claims.id)
        .await
        .map_err(|e| se!("Database query error {}", e))?;
    Ok(resp!(json => serde_json::json!({ "total_time_ms": total_time_ms })))
}

#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct DateQuery {
    year: Option<String>,
    month: Option<String>,
    day: Option<String>,
}

async fn daily_time(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let q: DateQuery = req.query().unwrap_or_default();
    let present = |v: Option<String>| v.filter(|v| !v.trim().is_empty());
    let (year, month, day) = match (present(q.year), present(q.month), present(q.day)) {
        (Some(y), Some(m), Some(d)) => (y, m, d),
        _ => return Ok(resp!(status => 400, message => "Missing date parameters")),
    };
    let date = match utils::parse_ymd(&year, &month, &day) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => return Ok(resp!(status => 400, message => "Invalid date")),
    };
    let total_time_ms = db::daily_time_ms(&req.state().pool, claims.id, &date)
        .await
        .map_err(|e| se!("Database query error {}", e))?;
    Ok(resp!(json => serde_json::json!({
        "date": date,
        "total_time_ms": total_time_ms,
    })))
}

async fn archives(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let archives = db::list_archives(&req.state().pool, claims.id)
        .await
        .map_err(|e| se!("Database query error {}", e))?;
    Ok(resp!(json => serde_json::json!({ "archives": archives })))
}

async fn user_stats(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let stats = stats::collect(&req.state().pool, claims.id).await;
    Ok(resp!(json => stats))
}

async fn clear_data(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let summary = match db::clear_user_data(&req.state().pool, claims.id).await {
        Ok(summary) => summary,
        Err(e) => {
            slog::error!(LOG, "error clearing data"; "user_id" => claims.id, "error" => e.to_string());
            return Ok(resp!(
                status => 500,
                message => "Failed to clear data",
                details => e.to_string()
            ));
        }
    };
    let paths: Vec<PathBuf> = summary.file_paths.iter().map(PathBuf::from).collect();
    upload::remove_files(&paths).await;
    slog::info!(
        LOG, "cleared user data";
        "user_id" => claims.id,
        "duplicates_removed" => summary.duplicates_removed,
        "track_plays_deleted" => summary.track_plays_deleted,
        "archives_deleted" => summary.archives_deleted,
    );
    Ok(resp!(json => serde_json::json!({
        "message": "All data cleared successfully",
        "duplicates_removed": summary.duplicates_removed,
        "track_plays_deleted": summary.track_plays_deleted,
        "archives_deleted": summary.archives_deleted,
    })))
}

async fn new_one_time_state(user_id: i64) -> String {
    let state = uuid::Uuid::new_v4().simple().to_string();
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_set(state.clone(), user_id);
    state
}

/// Consume a one-time state token, returning the user it was issued for
async fn take_one_time_state(state: &str) -> Option<i64> {
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_remove(&state.to_string())
}

/// Hands the frontend the spotify authorize url. The `state` in it
/// ties the eventual callback back to this user.
async fn spotify_auth(req: tide::Request<Context>) -> tide::Result {
    let claims = user_or_unauthorized!(req);
    let state = new_one_time_state(claims.id).await;
    let url = spotify::authorize_url(&state).map_err(|e| se!("{}", e))?;
    slog::info!(LOG, "sending user to spotify-auth"; "user_id" => claims.id);
    Ok(resp!(json => serde_json::json!({ "url": url })))
}

#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct SpotifyAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Spotify sends the user back here with a single-use `code` and the
/// `state` we handed out. The state is a one-time token, so a given
/// authorization can only complete once.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    let cb: SpotifyAuthCallback = req.query().unwrap_or_default();
    if let Some(error) = cb.error {
        slog::info!(LOG, "spotify authorization denied"; "error" => &error);
        return Ok(resp!(status => 400, message => "Spotify authorization failed", details => error));
    }
    let user_id = match cb.state.as_deref() {
        Some(state) => take_one_time_state(state).await,
        None => None,
    };
    let (user_id, code) = match (user_id, cb.code) {
        (Some(user_id), Some(code)) => (user_id, code),
        _ => return Ok(resp!(status => 400, message => "Invalid or expired state")),
    };

    let access = spotify::new_spotify_access_token(&code)
        .await
        .map_err(|e| se!("spotify access error {}", e))?;
    spotify::store_access(&req.state().pool, user_id, &access)
        .await
        .map_err(|e| se!("error storing spotify tokens {}", e))?;
    slog::info!(LOG, "connected spotify account"; "user_id" => user_id);

    if CONFIG.frontend_url.is_empty() {
        return Ok(resp!(json => serde_json::json!({ "ok": "ok", "user_id": user_id })));
    }
    Ok(tide::Redirect::new(&CONFIG.frontend_url).into())
}
