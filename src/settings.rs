use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHAT_ENDPOINT: &str = "https://loreal-worker.salbrecht-228.workers.dev/chat";
pub const DEFAULT_CATALOG_SOURCE: &str = "data/products.json";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// One layer of configuration. Every field is optional so layers can be
/// stacked; see [`resolve_effective_settings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettingsLayer {
    pub chat_endpoint: Option<String>,
    pub catalog_source: Option<String>,
    pub database_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl SettingsLayer {
    pub fn from_env() -> Self {
        Self {
            chat_endpoint: std::env::var("ADVISOR_CHAT_ENDPOINT").ok(),
            catalog_source: std::env::var("ADVISOR_CATALOG").ok(),
            database_url: std::env::var("ADVISOR_DATABASE_URL").ok(),
            request_timeout_secs: std::env::var("ADVISOR_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            chat_endpoint: Some(DEFAULT_CHAT_ENDPOINT.into()),
            catalog_source: Some(DEFAULT_CATALOG_SOURCE.into()),
            database_url: None,
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvisorSettings {
    pub chat_endpoint: String,
    pub catalog_source: String,
    /// `None` means the per-user data directory, see [`default_database_url`].
    pub database_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl AdvisorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Request-level (CLI) values win over the environment, which wins over
/// built-in defaults.
pub fn resolve_effective_settings(
    defaults: &SettingsLayer,
    env: &SettingsLayer,
    cli: &SettingsLayer,
) -> AdvisorSettings {
    let chat_endpoint = cli
        .chat_endpoint
        .clone()
        .or_else(|| env.chat_endpoint.clone())
        .or_else(|| defaults.chat_endpoint.clone())
        .unwrap_or_else(|| DEFAULT_CHAT_ENDPOINT.into());

    let catalog_source = cli
        .catalog_source
        .clone()
        .or_else(|| env.catalog_source.clone())
        .or_else(|| defaults.catalog_source.clone())
        .unwrap_or_else(|| DEFAULT_CATALOG_SOURCE.into());

    let database_url = cli
        .database_url
        .clone()
        .or_else(|| env.database_url.clone())
        .or_else(|| defaults.database_url.clone());

    let request_timeout_secs = cli
        .request_timeout_secs
        .or(env.request_timeout_secs)
        .or(defaults.request_timeout_secs)
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

    AdvisorSettings {
        chat_endpoint,
        catalog_source,
        database_url,
        request_timeout_secs,
    }
}

pub fn default_database_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("routine_advisor");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("advisor.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}
