pub mod sqlite;
pub mod supabase;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::classifier::KeywordSet;
use crate::config::{BackendKind, Config};
use crate::lead::Lead;

pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

/// One row of the keywords table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeywordRow {
    pub word: String,
    pub category: String,
}

/// Source of monitoring configuration and store of delivered leads.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the data can change at runtime and needs periodic refresh.
    fn is_dynamic(&self) -> bool {
        true
    }

    /// Usernames of active monitored chats.
    async fn load_chats(&self) -> Result<Vec<String>>;

    /// Active keywords with their category.
    async fn load_keywords(&self) -> Result<Vec<KeywordRow>>;

    /// Free-form key/value settings.
    async fn load_settings(&self) -> Result<HashMap<String, String>>;

    /// Whether a lead for this chat/message was already recorded.
    ///
    /// This is a point-in-time lookup. It does not claim the message, so two
    /// concurrent callers can both see `false`.
    async fn is_duplicate(&self, chat: &str, message_id: i32) -> Result<bool>;

    /// Best-effort bookkeeping after a successful delivery: record the lead
    /// (where the backend keeps leads) and bump the per-chat counter.
    async fn record_lead(&self, lead: &Lead) -> Result<()>;
}

/// Build the backend selected in the config.
pub async fn from_config(config: &Config) -> Result<Arc<dyn ConfigBackend>> {
    let backend: Arc<dyn ConfigBackend> = match config.backend.kind {
        BackendKind::Static => Arc::new(StaticBackend::from_config(config)),
        BackendKind::Supabase => Arc::new(SupabaseStore::new(&config.backend)?),
        BackendKind::Sqlite => {
            let store = SqliteStore::open(&config.backend.database_path)?;
            store.seed_if_empty(&config.monitor).await?;
            Arc::new(store)
        }
    };

    info!("Using {} backend", backend.kind());
    Ok(backend)
}

/// Chats, keywords and settings fixed at startup from the config file.
pub struct StaticBackend {
    chats: Vec<String>,
    keywords: KeywordSet,
    settings: HashMap<String, String>,
}

impl StaticBackend {
    pub fn new(chats: Vec<String>, keywords: KeywordSet, min_message_length: usize) -> Self {
        let mut settings = HashMap::new();
        settings.insert(
            "min_message_length".to_string(),
            min_message_length.to_string(),
        );
        Self {
            chats,
            keywords,
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.monitor.chats.clone(),
            config.monitor.keywords.clone(),
            config.monitor.min_message_length,
        )
    }
}

#[async_trait]
impl ConfigBackend for StaticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Static
    }

    fn is_dynamic(&self) -> bool {
        false
    }

    async fn load_chats(&self) -> Result<Vec<String>> {
        Ok(self.chats.clone())
    }

    async fn load_keywords(&self) -> Result<Vec<KeywordRow>> {
        Ok(keyword_rows(&self.keywords))
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>> {
        Ok(self.settings.clone())
    }

    async fn is_duplicate(&self, _chat: &str, _message_id: i32) -> Result<bool> {
        Ok(false)
    }

    async fn record_lead(&self, _lead: &Lead) -> Result<()> {
        Ok(())
    }
}

/// Flatten a keyword set into table rows.
pub fn keyword_rows(keywords: &KeywordSet) -> Vec<KeywordRow> {
    let rows = |words: &[String], category: &str| {
        words
            .iter()
            .map(|word| KeywordRow {
                word: word.clone(),
                category: category.to_string(),
            })
            .collect::<Vec<_>>()
    };

    let mut out = rows(&keywords.rent, "rent");
    out.extend(rows(&keywords.buy, "buy"));
    out.extend(rows(&keywords.property, "property"));
    out
}
