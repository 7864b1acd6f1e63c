use crate::counter::DEFAULT_WINDOW_SECS;
use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_TABLE_NAME: &str = "VisitCounter";
pub const DEFAULT_PORT: u16 = 7071;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Azure,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent credentials are not fatal at startup; requests report a
    /// configuration error instead.
    pub connection_string: Option<String>,
    pub table_name: String,
    pub window: chrono::Duration,
    pub store_timeout: Duration,
    pub backend: StoreBackend,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let window_secs: i64 = match get("VISIT_WINDOW_SECS") {
            Some(v) => v.parse().context("VISIT_WINDOW_SECS must be an integer")?,
            None => DEFAULT_WINDOW_SECS,
        };
        if window_secs < 0 {
            bail!("VISIT_WINDOW_SECS must not be negative");
        }

        let timeout_secs: u64 = match get("STORE_TIMEOUT_SECS") {
            Some(v) => v.parse().context("STORE_TIMEOUT_SECS must be an integer")?,
            None => DEFAULT_STORE_TIMEOUT_SECS,
        };

        let backend = match get("STORE_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => StoreBackend::Azure,
            Some(b) if b == "azure" => StoreBackend::Azure,
            Some(b) if b == "memory" => StoreBackend::Memory,
            Some(other) => bail!("Unknown STORE_BACKEND '{}'", other),
        };

        let port = match get("FUNCTIONS_CUSTOMHANDLER_PORT").or_else(|| get("PORT")) {
            Some(v) => v.parse().context("Port must be a number")?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            connection_string: get("COSMOS_CONNECTION_STRING"),
            table_name: get("TABLE_NAME").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
            window: chrono::Duration::seconds(window_secs),
            store_timeout: Duration::from_secs(timeout_secs),
            backend,
            port,
        })
    }
}
