use anyhow::{bail, Context, Result};

/// Upper bound for any history page, configured default included.
pub const MAX_HISTORY_PAGE_LIMIT: i64 = 100;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub rust_log: String,
    /// Default page size for history listings when the caller gives none.
    pub history_page_limit: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            history_page_limit: check_page_limit(parse_env("HISTORY_PAGE_LIMIT", 50)?)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn check_page_limit(limit: i64) -> Result<i64> {
    if !(1..=MAX_HISTORY_PAGE_LIMIT).contains(&limit) {
        bail!("HISTORY_PAGE_LIMIT must be between 1 and {MAX_HISTORY_PAGE_LIMIT}, got {limit}");
    }
    Ok(limit)
}
