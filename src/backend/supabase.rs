use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ConfigBackend, KeywordRow};
use crate::config::{BackendConfig, BackendKind};
use crate::lead::Lead;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChatRow {
    username: String,
}

#[derive(Debug, Deserialize)]
struct SettingRow {
    key: String,
    value: Value,
}

/// Supabase tables accessed through the PostgREST API.
pub struct SupabaseStore {
    client: reqwest::Client,
    rest_url: String,
    api_key: String,
    record_leads: bool,
}

impl SupabaseStore {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build Supabase HTTP client")?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", config.supabase_url.trim_end_matches('/')),
            api_key: config.supabase_key.clone(),
            record_leads: config.record_leads,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        debug!("Querying Supabase table {}", table);

        let response = self
            .request(reqwest::Method::GET, table)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to query Supabase table {}", table))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("Supabase error on {} ({}): {}", table, status, error_body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Supabase rows from {}", table))
    }

    async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "leads")
            .header("Prefer", "return=minimal")
            .json(&json!({
                "chat_username": lead.chat_key(),
                "message_id": lead.message_id,
                "text": lead.text,
                "message_link": lead.message_link,
            }))
            .send()
            .await
            .context("Failed to insert lead into Supabase")?;

        let status = response.status();
        // 409: unique violation, another writer already recorded it
        if !status.is_success() && status != StatusCode::CONFLICT {
            let error_body = response.text().await.unwrap_or_default();
            bail!("Supabase lead insert failed ({}): {}", status, error_body);
        }
        Ok(())
    }

    async fn increment_chat_leads(&self, chat: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "rpc/increment_chat_leads")
            .json(&json!({ "chat_name": chat }))
            .send()
            .await
            .context("Failed to call increment_chat_leads")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("increment_chat_leads is not defined, skipping");
            return Ok(());
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("increment_chat_leads failed ({}): {}", status, error_body);
        }
        Ok(())
    }
}

/// Settings values are JSON in the table; plain strings are taken as-is,
/// anything else uses its JSON text.
fn setting_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl ConfigBackend for SupabaseStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Supabase
    }

    async fn load_chats(&self) -> Result<Vec<String>> {
        let rows: Vec<ChatRow> = self
            .select(
                "monitored_chats",
                &[("select", "username"), ("is_active", "eq.true")],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.username).collect())
    }

    async fn load_keywords(&self) -> Result<Vec<KeywordRow>> {
        self.select(
            "keywords",
            &[("select", "word,category"), ("is_active", "eq.true")],
        )
        .await
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<SettingRow> = self.select("settings", &[("select", "key,value")]).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.key, setting_value(r.value)))
            .collect())
    }

    async fn is_duplicate(&self, chat: &str, message_id: i32) -> Result<bool> {
        let chat_filter = format!("eq.{}", chat);
        let id_filter = format!("eq.{}", message_id);
        let rows: Vec<Value> = self
            .select(
                "leads",
                &[
                    ("select", "id"),
                    ("chat_username", chat_filter.as_str()),
                    ("message_id", id_filter.as_str()),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn record_lead(&self, lead: &Lead) -> Result<()> {
        if self.record_leads {
            self.insert_lead(lead).await?;
        }
        self.increment_chat_leads(lead.chat_key()).await
    }
}
