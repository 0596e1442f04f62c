use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::Classification;
use crate::platform::IncomingMessage;

/// Kind of chat a message was posted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Channel,
    Supergroup,
    Group,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub title: String,
    pub username: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChatKind>,
}

/// Sender fields. All `None` when the message has no user behind it
/// (anonymous admins, channel posts, service actors).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: Option<u64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// A message that passed classification, in the exact shape POSTed to the
/// webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub message_id: i32,
    pub text: String,
    pub date: DateTime<Utc>,
    pub chat: ChatInfo,
    pub sender: SenderInfo,
    pub keyword_analysis: Classification,
    pub message_link: Option<String>,
}

impl Lead {
    pub fn new(message: IncomingMessage, keyword_analysis: Classification) -> Self {
        let message_link = message
            .chat
            .username
            .as_deref()
            .map(|username| message_link(username, message.message_id));

        Self {
            message_id: message.message_id,
            text: message.text,
            date: message.date,
            chat: message.chat,
            sender: message.sender,
            keyword_analysis,
            message_link,
        }
    }

    /// Key used for duplicate suppression: the chat username when public,
    /// otherwise the title.
    pub fn chat_key(&self) -> &str {
        self.chat.username.as_deref().unwrap_or(&self.chat.title)
    }

    /// First `max_chars` characters of the text, for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut preview: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().count() > max_chars {
            preview.push_str("...");
        }
        preview
    }
}

/// Canonical public permalink of a message.
pub fn message_link(username: &str, message_id: i32) -> String {
    format!(
        "https://t.me/{}/{}",
        username.trim_start_matches('@'),
        message_id
    )
}
