use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{ConfigBackend, KeywordRow};
use crate::classifier::{KeywordCategory, KeywordSet};
use crate::platform;

/// One consistent view of the monitoring configuration.
///
/// Snapshots are never mutated; a refresh builds a new one and swaps it in,
/// so a reader holding an `Arc<Snapshot>` always sees chats, keywords and
/// settings from the same load.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub chats: Vec<String>,
    pub keywords: KeywordSet,
    pub settings: HashMap<String, String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Used when the `min_message_length` setting is missing or invalid
    pub default_min_length: usize,
}

impl Snapshot {
    pub fn new(chats: Vec<String>, keywords: KeywordSet, default_min_length: usize) -> Self {
        Self {
            chats,
            keywords,
            settings: HashMap::new(),
            refreshed_at: None,
            default_min_length,
        }
    }

    pub fn is_monitored(&self, username: &str) -> bool {
        platform::is_monitored(username, &self.chats)
    }

    pub fn min_message_length(&self) -> usize {
        match self.settings.get("min_message_length") {
            Some(raw) => raw.trim().trim_matches('"').parse().unwrap_or_else(|_| {
                warn!(
                    "Invalid min_message_length setting {:?}, using {}",
                    raw, self.default_min_length
                );
                self.default_min_length
            }),
            None => self.default_min_length,
        }
    }
}

/// Holder of the current [`Snapshot`]. Cheap to clone; all clones observe the
/// same swaps.
#[derive(Clone)]
pub struct ConfigCache {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl ConfigCache {
    pub fn new(initial: Snapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot. Take it once per message and use it throughout.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Reload everything from the backend and swap it in as one unit.
    ///
    /// On failure the previous snapshot stays in place and the error is
    /// logged; the next scheduled tick tries again.
    pub async fn refresh(&self, backend: &dyn ConfigBackend) -> bool {
        match self.load(backend).await {
            Ok(snapshot) => {
                if snapshot.chats.is_empty() {
                    warn!("No chats to monitor! Add chats to the backend.");
                }
                if snapshot.keywords.is_empty() {
                    warn!("No keywords loaded, no message will be classified as a lead");
                }
                info!(
                    "Cache refreshed: {} chats, {} keywords",
                    snapshot.chats.len(),
                    snapshot.keywords.len()
                );
                self.tx.send_replace(Arc::new(snapshot));
                true
            }
            Err(e) => {
                error!("Failed to refresh cache: {:#}", e);
                false
            }
        }
    }

    async fn load(&self, backend: &dyn ConfigBackend) -> Result<Snapshot> {
        let (chats, rows, settings) = futures::try_join!(
            backend.load_chats(),
            backend.load_keywords(),
            backend.load_settings(),
        )?;

        Ok(Snapshot {
            chats,
            keywords: keywords_from_rows(rows),
            settings,
            refreshed_at: Some(Utc::now()),
            default_min_length: self.tx.borrow().default_min_length,
        })
    }
}

/// Build a keyword set from table rows, skipping unknown categories.
pub fn keywords_from_rows(rows: Vec<KeywordRow>) -> KeywordSet {
    let mut keywords = KeywordSet::empty();
    for row in rows {
        match KeywordCategory::parse(&row.category) {
            Some(category) => keywords.push(category, &row.word),
            None => warn!(
                "Skipping keyword {:?} with unknown category {:?}",
                row.word, row.category
            ),
        }
    }
    keywords
}
