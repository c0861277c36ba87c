//! Environment-driven configuration (spec §4.11, grounded on
//! `app/config.py` + `app/core/config.py`'s `_env_bool`/`_norm`/`_validate`
//! helpers).

use std::env;

/// Which credential the source CRM client authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCrmAuthMode {
    /// A long-lived token, read once at startup.
    Llt,
    /// A static API key.
    ApiKey,
}

impl SourceCrmAuthMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "llt" => Some(Self::Llt),
            "api_key" => Some(Self::ApiKey),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid SOURCE_CRM_AUTH_MODE: {0:?} (expected \"llt\" or \"api_key\")")]
    InvalidAuthMode(String),
}

/// Process-wide settings, loaded once at startup. Mirrors the original's
/// dataclass-of-env-vars shape; nothing here is refreshable at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub directory_rpm: u32,
    pub directory_group_name: Option<String>,
    pub auto_merge_duplicates: bool,
    pub webhook_secret: String,
    pub debug_secret: String,
    pub source_crm_base_url: String,
    pub source_crm_auth_mode: SourceCrmAuthMode,
    pub db_path: String,
    pub queue_batch_size: u32,
}

fn norm(raw: Option<String>) -> String {
    raw.unwrap_or_default().trim().to_string()
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load from the process environment. Never panics; an invalid
    /// `SOURCE_CRM_AUTH_MODE` is reported as [`ConfigError`], matching the
    /// original's `_validate` strictness — the caller (the daemon) decides
    /// whether to refuse to start.
    pub fn from_env() -> Result<Self, ConfigError> {
        let auth_mode_raw = norm(env::var("SOURCE_CRM_AUTH_MODE").ok()).to_lowercase();
        let source_crm_auth_mode = SourceCrmAuthMode::parse(&auth_mode_raw)
            .ok_or_else(|| ConfigError::InvalidAuthMode(auth_mode_raw.clone()))?;

        let group_name = norm(env::var("DIRECTORY_GROUP_NAME").ok());

        Ok(Self {
            directory_rpm: env_u32("DIRECTORY_RPM", 20),
            directory_group_name: if group_name.is_empty() { None } else { Some(group_name) },
            auto_merge_duplicates: env_bool("AUTO_MERGE_DUPLICATES", true),
            webhook_secret: norm(env::var("WEBHOOK_SECRET").ok()),
            debug_secret: norm(env::var("DEBUG_SECRET").ok()),
            source_crm_base_url: {
                let url = norm(env::var("SOURCE_CRM_BASE_URL").ok());
                if url.is_empty() {
                    "https://example.amocrm.ru".to_string()
                } else {
                    url
                }
            },
            source_crm_auth_mode,
            db_path: {
                let path = norm(env::var("DB_PATH").ok());
                if path.is_empty() { "./contact-sync.db".to_string() } else { path }
            },
            queue_batch_size: env_u32("QUEUE_BATCH_SIZE", 20),
        })
    }
}
