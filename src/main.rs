use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use std::io::Read;
use std::sync::Arc;
use std::{env, fs};

mod crypto;
mod db;
mod error;
mod logging;
mod models;
mod service;
mod spotify;
mod sync;

pub use error::{Error, Result};

/// Shorthand for a "string" internal error, e.g. `se!("bad value {:?}", v)`
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        $crate::Error::Internal(format!($($arg)*))
    };
}

/// Build a json response, `resp!(json => body)` for a 200 or
/// `resp!(status => 500, json => body)` for anything else
#[macro_export]
macro_rules! resp {
    (json => $body:expr) => {
        Ok(tide::Response::builder(200)
            .body(tide::Body::from_json(&$body)?)
            .build())
    };
    (status => $status:expr, json => $body:expr) => {
        Ok(tide::Response::builder($status)
            .body(tide::Body::from_json(&$body)?)
            .build())
    };
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
                .expect("invalid log_level");
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
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "spotshelf"));

    // one-time login state tokens, valid for five minutes
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(300)));
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub spotify_scopes: String,
    pub spotify_accounts_url: String,
    pub spotify_api_url: String,
    pub redirect_uri: Option<String>,
    pub frontend_results_url: String,
    pub db_url: String,
    pub db_max_connections: u32,
    pub enc_key: String,
    pub sync_page_size: u32,
}
impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("error reading commit_hash");
                s.trim().to_string()
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env::var("SPOTIFY_CLIENT_ID").ok(),
            spotify_client_secret: env::var("SPOTIFY_CLIENT_SECRET").ok(),
            spotify_scopes: env_or(
                "SPOTIFY_SCOPES",
                "user-library-read playlist-read-private user-top-read user-read-recently-played user-follow-read",
            ),
            spotify_accounts_url: env_or("SPOTIFY_ACCOUNTS_URL", "https://accounts.spotify.com"),
            spotify_api_url: env_or("SPOTIFY_API_URL", "https://api.spotify.com/v1"),
            redirect_uri: env::var("REDIRECT_URI").ok(),
            frontend_results_url: env_or("FRONTEND_RESULTS_URL", "http://localhost:3000/results"),
            db_url: env_or("DATABASE_URL", "sqlite:spotshelf.db"),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", "5")
                .parse()
                .expect("invalid db_max_connections"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            sync_page_size: env_or("SYNC_PAGE_SIZE", "50")
                .parse()
                .expect("invalid sync_page_size"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.enc_key.len() == 32,
            "ENC_KEY must be exactly 32 bytes, got {}",
            self.enc_key.len()
        );
        tide::http::Url::parse(&self.frontend_results_url).map_err(|e| {
            anyhow::anyhow!(
                "invalid FRONTEND_RESULTS_URL {:?}: {}",
                self.frontend_results_url,
                e
            )
        })?;
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "spotify_configured" => CONFIG.spotify_client_id.is_some(),
            "frontend_results_url" => &CONFIG.frontend_results_url,
            "sync_page_size" => &CONFIG.sync_page_size,
        );
        Ok(())
    }
    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }
    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }
    pub fn spotify_redirect_url(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| format!("{}/callback", self.redirect_host()))
    }
    pub fn spotify_credentials(&self) -> Result<(&str, &str)> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) => Ok((id.as_str(), secret.as_str())),
            _ => Err(Error::Config(
                "SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET are not set".to_string(),
            )),
        }
    }
}

async fn run() -> Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG
        .initialize()
        .map_err(|e| Error::Config(e.to_string()))?;

    let pool = db::connect(&CONFIG.db_url, CONFIG.db_max_connections).await?;
    db::migrate(&pool).await?;
    service::start(pool).await
}

#[async_std::main]
async fn main() {
    if let Err(e) = run().await {
        slog::crit!(LOG, "fatal"; "error" => %e);
        // the async drain needs a beat to flush before the process dies
        async_std::task::sleep(std::time::Duration::from_millis(200)).await;
        std::process::exit(1);
    }
}
