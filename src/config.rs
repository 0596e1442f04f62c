use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::{KeywordSet, DEFAULT_MIN_MESSAGE_LENGTH};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Chats and keywords come from this file; no duplicate store.
    #[default]
    Static,
    /// Remote Supabase (PostgREST) tables.
    Supabase,
    /// Local SQLite database.
    Sqlite,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Static => write!(f, "static"),
            BackendKind::Supabase => write!(f, "supabase"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Upper bound for a single chat metadata lookup
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of leads being checked/delivered at the same time
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default)]
    pub chats: Vec<String>,
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub keywords: KeywordSet,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub supabase_key: String,
    /// Insert delivered leads into the `leads` table (Supabase only; the
    /// SQLite backend always records them).
    #[serde(default)]
    pub record_leads: bool,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

fn default_metadata_timeout_secs() -> u64 {
    5
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    16
}

fn default_min_message_length() -> usize {
    DEFAULT_MIN_MESSAGE_LENGTH
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_db_path() -> PathBuf {
    PathBuf::from("lead-monitor.db")
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_webhook_timeout_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            chats: Vec::new(),
            min_message_length: default_min_message_length(),
            refresh_interval_secs: default_refresh_interval_secs(),
            keywords: KeywordSet::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            supabase_url: String::new(),
            supabase_key: String::new(),
            record_leads: false,
            database_path: default_db_path(),
        }
    }
}

impl Config {
    /// Load the config file (if present), apply environment overrides and
    /// validate. Any error here aborts startup before connecting anywhere.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.monitor.keywords = config.monitor.keywords.normalized();
        Ok(config)
    }

    /// Override credentials and endpoints from the environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| lookup(*k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        if let Some(token) = get(&["TELEGRAM_BOT_TOKEN"]) {
            self.telegram.bot_token = token;
        }
        if let Some(url) = get(&["WEBHOOK_URL", "N8N_WEBHOOK_URL", "N8N_WEBHOOK"]) {
            self.webhook.url = url;
        }
        if let Some(url) = get(&["SUPABASE_URL"]) {
            self.backend.supabase_url = url;
        }
        if let Some(key) = get(&["SUPABASE_KEY"]) {
            self.backend.supabase_key = key;
        }
        if let Some(path) = get(&["LEAD_MONITOR_DB"]) {
            self.backend.database_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            bail!("Telegram bot token is not set (TELEGRAM_BOT_TOKEN or [telegram] bot_token)");
        }
        if self.webhook.url.is_empty() {
            bail!("Webhook URL is not set (WEBHOOK_URL or [webhook] url)");
        }
        if !(self.webhook.url.starts_with("http://") || self.webhook.url.starts_with("https://")) {
            bail!("Webhook URL must be http(s): {}", self.webhook.url);
        }
        if self.webhook.timeout_secs == 0 || self.telegram.metadata_timeout_secs == 0 {
            bail!("Timeouts must be greater than zero");
        }
        if self.webhook.max_in_flight == 0 {
            bail!("[webhook] max_in_flight must be greater than zero");
        }
        if self.monitor.refresh_interval_secs == 0 {
            bail!("[monitor] refresh_interval_secs must be greater than zero");
        }
        if self.backend.kind == BackendKind::Supabase
            && (self.backend.supabase_url.is_empty() || self.backend.supabase_key.is_empty())
        {
            bail!("Supabase backend requires SUPABASE_URL and SUPABASE_KEY");
        }
        Ok(())
    }

    /// Webhook URL shortened for log output.
    pub fn webhook_display(&self) -> String {
        let short: String = self.webhook.url.chars().take(30).collect();
        format!("{}...", short)
    }
}
