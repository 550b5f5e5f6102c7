use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;

mod crypto;
mod errors;
mod history;
mod logging;
mod models;
mod recommend;
mod service;
mod spotify;
mod tokens;

pub use errors::{Error, Result};

/// How long a login attempt has to complete the spotify round-trip
/// before its state token lapses.
const ONE_TIME_TOKEN_LIFESPAN_SECONDS: u64 = 300;

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that everything branches off of
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
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "soundseed"));

    // one-time oauth state tokens, valid for a single login round-trip
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(ONE_TIME_TOKEN_LIFESPAN_SECONDS)));
}

pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: Option<String>,
    pub db_url: String,
    pub enc_key: String,
    pub auth_expiration_seconds: u64,
}
impl Config {
    pub fn load() -> Self {
        Self {
            version: env_or("APP_VERSION", env!("CARGO_PKG_VERSION")),
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", "fake"),
            spotify_redirect_uri: env::var("SPOTIFY_REDIRECT_URI").ok(),
            db_url: env_or("DATABASE_URL", "error"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            auth_expiration_seconds: env_or("AUTH_EXPIRATION_SECONDS", "2592000")
                .parse()
                .expect("invalid auth_expiration_seconds"),
        }
    }
    pub fn initialize(&self) -> anyhow::Result<()> {
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
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
        self.spotify_redirect_uri
            .clone()
            .unwrap_or_else(|| format!("{}/callback", self.redirect_host()))
    }
    pub fn domain(&self) -> String {
        self.host.clone()
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&CONFIG.db_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    service::start(pool).await?;
    Ok(())
}
