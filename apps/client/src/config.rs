use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{AppError, AppResult};

pub const DEFAULT_LIKE_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_STORY_POLL_SECS: u64 = 60;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const DEFAULT_FEED_PAGE_SIZE: u32 = 50;
pub const DEFAULT_NOTIFICATION_LIMIT: u32 = 50;
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 5;
pub const STORY_TTL_HOURS: i64 = 24;
pub const CACHE_TTL_HOURS: i64 = 24;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: usize = 50 * 1024 * 1024;

/// Knobs of the per-feature sync loops.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub like_debounce: Duration,
    pub story_poll_interval: Duration,
    pub history_limit: u32,
    pub feed_page_size: u32,
    pub notification_limit: u32,
    /// Rejected sends after which a queued message is no longer retried.
    pub max_send_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            like_debounce: Duration::from_millis(DEFAULT_LIKE_DEBOUNCE_MS),
            story_poll_interval: Duration::from_secs(DEFAULT_STORY_POLL_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
            notification_limit: DEFAULT_NOTIFICATION_LIMIT,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: Url,
    pub anon_key: String,
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let raw_url = var("SOCIALCHAT_URL")
            .ok_or_else(|| AppError::validation("Missing SOCIALCHAT_URL"))?;
        let backend_url = Url::parse(raw_url.trim())?;
        if !matches!(backend_url.scheme(), "http" | "https") {
            return Err(AppError::validation("SOCIALCHAT_URL must be http or https"));
        }

        let anon_key = var("SOCIALCHAT_ANON_KEY")
            .ok_or_else(|| AppError::validation("Missing SOCIALCHAT_ANON_KEY"))?;

        let data_dir = var("SOCIALCHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".socialchat"));

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            like_debounce: Duration::from_millis(parse_number(
                var("SOCIALCHAT_LIKE_DEBOUNCE_MS"),
                "SOCIALCHAT_LIKE_DEBOUNCE_MS",
                DEFAULT_LIKE_DEBOUNCE_MS,
            )?),
            story_poll_interval: Duration::from_secs(parse_number(
                var("SOCIALCHAT_STORY_POLL_SECS"),
                "SOCIALCHAT_STORY_POLL_SECS",
                DEFAULT_STORY_POLL_SECS,
            )?),
            history_limit: parse_number(
                var("SOCIALCHAT_HISTORY_LIMIT"),
                "SOCIALCHAT_HISTORY_LIMIT",
                DEFAULT_HISTORY_LIMIT,
            )?,
            feed_page_size: parse_number(
                var("SOCIALCHAT_FEED_PAGE_SIZE"),
                "SOCIALCHAT_FEED_PAGE_SIZE",
                DEFAULT_FEED_PAGE_SIZE,
            )?,
            max_send_attempts: parse_number(
                var("SOCIALCHAT_MAX_SEND_ATTEMPTS"),
                "SOCIALCHAT_MAX_SEND_ATTEMPTS",
                DEFAULT_MAX_SEND_ATTEMPTS,
            )?,
            ..defaults
        };

        Ok(Self {
            backend_url,
            anon_key: anon_key.trim().to_string(),
            data_dir,
            sync,
            email: var("SOCIALCHAT_EMAIL"),
            password: var("SOCIALCHAT_PASSWORD"),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("local.sqlite")
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, name: &str, default: T) -> AppResult<T> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::validation(format!("Invalid {}: {}", name, value))),
    }
}
