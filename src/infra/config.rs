//! Centralized configuration (environment variables + defaults).

use anyhow::{anyhow, Context};
use std::net::SocketAddr;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// Base URL advertised as the service's online resource.
    pub public_url: String,
    pub db_max_connections: u32,
    /// Accept any dotted integer triple as VERSION.
    pub legacy_version_negotiation: bool,
    /// Rows buffered per open cursor.
    pub cursor_buffer: usize,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", name, v)),
        None => Ok(default),
    }
}

fn flag(name: &str) -> anyhow::Result<bool> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("{} must be a boolean, got '{}'", name, v)),
        },
    }
}

/// Adds `http://` when the value carries no scheme and drops a trailing slash.
pub fn normalize_public_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

impl Settings {
    /// Reads the process environment; call `dotenv::dotenv()` first to pick up `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = var("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
        let bind_addr = parsed("WFS_BIND_ADDR", DEFAULT_BIND_ADDR.parse::<SocketAddr>()?)?;
        let public_url = normalize_public_url(&var("WFS_PUBLIC_URL").unwrap_or_else(|| DEFAULT_PUBLIC_URL.into()));
        let db_max_connections = parsed("WFS_DB_MAX_CONNECTIONS", 5u32)?.max(1);
        let cursor_buffer = parsed("WFS_CURSOR_BUFFER", 64usize)?.max(1);

        Ok(Self {
            database_url,
            bind_addr,
            public_url,
            db_max_connections,
            legacy_version_negotiation: flag("WFS_LEGACY_VERSION_NEGOTIATION")?,
            cursor_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_gains_a_scheme() {
        assert_eq!(normalize_public_url("maps.example.org/"), "http://maps.example.org");
        assert_eq!(normalize_public_url("https://maps.example.org"), "https://maps.example.org");
    }
}
