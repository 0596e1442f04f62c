pub mod telegram;

use chrono::{DateTime, Utc};

use crate::lead::{ChatInfo, SenderInfo};

/// A text message received from a monitored chat, with chat and sender
/// metadata already resolved.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform-specific numeric chat id
    pub chat_id: i64,
    pub message_id: i32,
    pub text: String,
    pub date: DateTime<Utc>,
    pub chat: ChatInfo,
    pub sender: SenderInfo,
}

/// Case-insensitive membership test for chat usernames, ignoring a leading `@`.
pub fn is_monitored(username: &str, monitored: &[String]) -> bool {
    let username = username.trim_start_matches('@');
    monitored
        .iter()
        .any(|m| m.trim_start_matches('@').eq_ignore_ascii_case(username))
}
