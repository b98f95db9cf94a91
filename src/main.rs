use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};

mod auth;
mod crypto;
mod db;
mod import;
mod logging;
mod models;
mod poller;
mod service;
mod spotify;
mod stats;
mod upload;
mod utils;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// A plain message error, see `se!`
#[derive(Debug)]
pub struct StrError(pub String);

impl std::fmt::Display for StrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StrError {}

/// Build a `StrError` from format args. Converts into both
/// `crate::Error` and `tide::Error` with `?`
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        $crate::StrError(format!($($arg)*))
    };
}

/// Build a json `tide::Response`
#[macro_export]
macro_rules! resp {
    (json => $obj:expr) => {{
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, json => $obj:expr) => {{
        tide::Response::builder($status)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, message => $msg:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    }};
    (status => $status:expr, message => $msg:expr, details => $details:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg, "details": $details }))
            .build()
    }};
}

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that all crates should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .unwrap_or(slog::Level::Info);
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "spot-stats"));

    // one-time spotify oauth `state` tokens, mapped to the user that requested them
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, i64>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(30)));
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub db_url: String,
    pub upload_dir: PathBuf,
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
    pub enc_key: String,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub spotify_redirect_url: Option<String>,
    pub frontend_url: String,
    pub poller_enabled: bool,
    pub poll_interval_seconds: u64,
    pub max_upload_files: usize,
    pub max_upload_file_bytes: u64,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).ok();
                s.trim().to_string()
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            port: env_or("PORT", "5000").parse().unwrap_or(5000),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            db_url: env_or("DATABASE_URL", "sqlite://spotify.db"),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "uploads")),
            jwt_secret: env_or("JWT_SECRET", "spotify_stats_secret"),
            jwt_expiration_seconds: env_or("JWT_EXPIRATION_SECONDS", "3600")
                .parse()
                .unwrap_or(3600),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_secret_id: env_or("SPOTIFY_SECRET_ID", "fake"),
            spotify_redirect_url: env::var("SPOTIFY_REDIRECT_URL").ok(),
            frontend_url: env_or("FRONTEND_URL", "http://localhost:3000"),
            poller_enabled: env_or("POLLER_ENABLED", "true") == "true",
            poll_interval_seconds: env_or("POLL_INTERVAL_SECONDS", "30")
                .parse()
                .unwrap_or(30),
            max_upload_files: env_or("MAX_UPLOAD_FILES", "10").parse().unwrap_or(10),
            max_upload_file_bytes: env_or("MAX_UPLOAD_FILE_BYTES", "52428800")
                .parse()
                .unwrap_or(50 * 1024 * 1024),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        if self.enc_key.len() != 32 {
            anyhow::bail!("ENC_KEY must be exactly 32 bytes");
        }
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "db_url" => &CONFIG.db_url,
            "upload_dir" => CONFIG.upload_dir.display().to_string(),
            "poller_enabled" => CONFIG.poller_enabled,
            "poll_interval_seconds" => CONFIG.poll_interval_seconds,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
    pub fn spotify_redirect_url(&self) -> String {
        self.spotify_redirect_url
            .clone()
            .unwrap_or_else(|| format!("{}/callback", self.host()))
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = db::connect(&CONFIG.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("error connecting to {}: {}", CONFIG.db_url, e))?;
    async_std::fs::create_dir_all(&CONFIG.upload_dir).await?;

    if CONFIG.poller_enabled {
        async_std::task::spawn(poller::background_currently_playing_poll(pool.clone()));
    } else {
        slog::info!(LOG, "currently playing poller disabled");
    }
    service::start(pool, CONFIG.upload_dir.clone())
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;
    Ok(())
}
