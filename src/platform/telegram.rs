use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use teloxide::prelude::*;
use teloxide::types::{Chat, Recipient};
use tracing::{debug, info, warn};

use crate::cache::Snapshot;
use crate::error::StageError;
use crate::lead::{ChatInfo, ChatKind, SenderInfo};
use crate::pipeline::Pipeline;
use crate::platform::IncomingMessage;

/// Shared handler state injected into the dispatcher.
#[derive(Clone)]
struct Adapter {
    pipeline: Pipeline,
    metadata_timeout: Duration,
}

/// A message from a monitored chat, paired with the snapshot it was admitted
/// against so the whole pipeline sees one configuration.
#[derive(Clone)]
struct Monitored {
    msg: Message,
    snapshot: Arc<Snapshot>,
}

/// Run the Telegram event source until the dispatcher stops
pub async fn run(bot: Bot, pipeline: Pipeline, metadata_timeout: Duration) -> Result<()> {
    info!("Starting Telegram listener...");

    let groups = pipeline.clone();
    let channels = pipeline.clone();

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_map(move |msg: Message| admit(msg, groups.snapshot()))
                .endpoint(handle_message),
        )
        .branch(
            Update::filter_channel_post()
                .filter_map(move |msg: Message| admit(msg, channels.snapshot()))
                .endpoint(handle_message),
        );

    let adapter = Adapter {
        pipeline,
        metadata_timeout,
    };

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![adapter])
        .default_handler(|upd| async move {
            debug!("Ignored update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Log each monitored chat and whether the bot can see it.
pub async fn verify_chats(bot: &Bot, chats: &[String], timeout: Duration) {
    info!("Monitoring {} chats:", chats.len());

    for chat in chats {
        let username = format!("@{}", chat.trim_start_matches('@'));
        let lookup = bot.get_chat(Recipient::ChannelUsername(username.clone()));

        let result = match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::from(e)),
            Err(_) => Err(anyhow!("getChat timed out after {:?}", timeout)),
        };

        match result {
            Ok(()) => info!("  - {}", username),
            Err(e) => warn!("  - {} cannot be resolved: {}", username, StageError::Metadata(e)),
        }
    }
}

/// Keep only messages with text or a caption from monitored, non-private
/// chats.
fn admit(msg: Message, snapshot: Arc<Snapshot>) -> Option<Monitored> {
    if msg.chat.is_private() {
        return None;
    }
    let username = msg.chat.username()?;
    if !snapshot.is_monitored(username) {
        return None;
    }
    message_text(&msg)?;
    Some(Monitored { msg, snapshot })
}

async fn handle_message(bot: Bot, monitored: Monitored, adapter: Adapter) -> ResponseResult<()> {
    let Monitored { msg, snapshot } = monitored;
    let Some(mut incoming) = normalize(&msg) else {
        return Ok(());
    };

    if msg.chat.title().is_none() {
        incoming.chat.title = resolve_title(&bot, &msg.chat, adapter.metadata_timeout).await;
    }

    // Delivery runs in its own task, which logs its own failures
    let _ = adapter.pipeline.process(incoming, &snapshot);
    Ok(())
}

/// Look the chat title up when the update did not carry one.
async fn resolve_title(bot: &Bot, chat: &Chat, timeout: Duration) -> String {
    let lookup = bot.get_chat(chat.id);
    let result = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(full)) => full
            .title()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("chat {} has no title", chat.id)),
        Ok(Err(e)) => Err(anyhow::Error::from(e)),
        Err(_) => Err(anyhow!("getChat timed out after {:?}", timeout)),
    };

    result.unwrap_or_else(|e| {
        let fallback = fallback_title(chat);
        warn!("{}; using {:?}", StageError::Metadata(e), fallback);
        fallback
    })
}

fn fallback_title(chat: &Chat) -> String {
    chat.title()
        .or_else(|| chat.username())
        .map(str::to_string)
        .unwrap_or_else(|| chat.id.to_string())
}

/// Message text, or the caption of a media post.
fn message_text(msg: &Message) -> Option<&str> {
    msg.text().or_else(|| msg.caption())
}

/// Convert a Telegram message into the platform-neutral shape.
fn normalize(msg: &Message) -> Option<IncomingMessage> {
    let text = message_text(msg)?.to_string();

    Some(IncomingMessage {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0,
        text,
        date: msg.date,
        chat: ChatInfo {
            title: fallback_title(&msg.chat),
            username: msg.chat.username().map(str::to_string),
            kind: Some(chat_kind(&msg.chat)),
        },
        sender: sender_info(msg),
    })
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_channel() {
        ChatKind::Channel
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else if chat.is_group() {
        ChatKind::Group
    } else {
        ChatKind::Unknown
    }
}

/// Posts on behalf of a chat (anonymous admins, linked channels) carry a
/// placeholder user in `from`; those are reported as an unknown sender.
fn sender_info(msg: &Message) -> SenderInfo {
    if msg.sender_chat.is_some() {
        return SenderInfo::default();
    }
    match &msg.from {
        Some(user) => SenderInfo {
            id: Some(user.id.0),
            first_name: Some(user.first_name.clone()),
            last_name: user.last_name.clone(),
            username: user.username.clone(),
        },
        None => SenderInfo::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KeywordSet;
    use serde_json::{json, Value};

    fn message(chat: Value, extra: Value) -> Message {
        let mut raw = json!({
            "message_id": 42,
            "date": 1736937000,
            "chat": chat,
        });
        if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                raw.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(raw).unwrap()
    }

    fn supergroup() -> Value {
        json!({
            "id": -1001234567890i64,
            "title": "Pattaya Rent",
            "username": "pattaya_arenda",
            "type": "supergroup"
        })
    }

    fn snapshot() -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            vec!["Pattaya_Arenda".to_string()],
            KeywordSet::empty(),
            20,
        ))
    }

    #[test]
    fn test_normalize_group_message() {
        let msg = message(
            supergroup(),
            json!({
                "from": {
                    "id": 7,
                    "is_bot": false,
                    "first_name": "Ivan",
                    "username": "ivan_p"
                },
                "text": "Ищу снять квартиру в Паттайе на месяц"
            }),
        );

        let incoming = normalize(&msg).unwrap();
        assert_eq!(incoming.chat_id, -1001234567890);
        assert_eq!(incoming.message_id, 42);
        assert_eq!(incoming.chat.title, "Pattaya Rent");
        assert_eq!(incoming.chat.username.as_deref(), Some("pattaya_arenda"));
        assert_eq!(incoming.chat.kind, Some(ChatKind::Supergroup));
        assert_eq!(incoming.sender.id, Some(7));
        assert_eq!(incoming.sender.first_name.as_deref(), Some("Ivan"));
        assert_eq!(incoming.sender.last_name, None);
        assert_eq!(incoming.date.timestamp(), 1736937000);
    }

    #[test]
    fn test_channel_post_has_no_sender() {
        let msg = message(
            json!({
                "id": -1009876543210i64,
                "title": "Pattaya Realty",
                "username": "pattaya_realty",
                "type": "channel"
            }),
            json!({ "text": "Сдам квартиру у моря, студия 30м2" }),
        );

        let incoming = normalize(&msg).unwrap();
        assert_eq!(incoming.chat.kind, Some(ChatKind::Channel));
        assert_eq!(incoming.sender.id, None);
        assert_eq!(incoming.sender.first_name, None);
    }

    #[test]
    fn test_admit_filters_chats() {
        let text = json!({ "text": "Сниму квартиру на месяц, бюджет 20к" });

        assert!(admit(message(supergroup(), text.clone()), snapshot()).is_some());

        let other = json!({
            "id": -1005555,
            "title": "Bangkok Chat",
            "username": "bangkok_chat",
            "type": "supergroup"
        });
        assert!(admit(message(other, text.clone()), snapshot()).is_none());

        let private = json!({
            "id": 7,
            "first_name": "Ivan",
            "username": "pattaya_arenda",
            "type": "private"
        });
        assert!(admit(message(private, text), snapshot()).is_none());
    }

    #[test]
    fn test_anonymous_admin_has_no_sender() {
        let msg = message(
            supergroup(),
            json!({
                "from": {
                    "id": 1087968824,
                    "is_bot": true,
                    "first_name": "Group",
                    "username": "GroupAnonymousBot"
                },
                "sender_chat": supergroup(),
                "text": "Сдаю комнату в кондо на Пратамнаке"
            }),
        );

        let incoming = normalize(&msg).unwrap();
        assert_eq!(incoming.sender, SenderInfo::default());
        assert_eq!(incoming.chat.title, "Pattaya Rent");
    }

    #[test]
    fn test_fallback_title_order() {
        let named: Chat = serde_json::from_value(json!({
            "id": 7,
            "first_name": "Ivan",
            "username": "no_title_chat",
            "type": "private"
        }))
        .unwrap();
        assert_eq!(fallback_title(&named), "no_title_chat");

        let bare: Chat = serde_json::from_value(json!({
            "id": 7,
            "first_name": "Ivan",
            "type": "private"
        }))
        .unwrap();
        assert_eq!(fallback_title(&bare), "7");

        let titled: Chat = serde_json::from_value(supergroup()).unwrap();
        assert_eq!(fallback_title(&titled), "Pattaya Rent");
    }

    #[test]
    fn test_caption_is_message_text() {
        let captioned = json!({
            "photo": [{
                "file_id": "AgAD",
                "file_unique_id": "AQAD",
                "width": 90,
                "height": 90
            }],
            "caption": "Сдам студию в Джомтьене на долгосрок"
        });
        let msg = message(supergroup(), captioned);

        assert!(admit(msg.clone(), snapshot()).is_some());
        let incoming = normalize(&msg).unwrap();
        assert_eq!(incoming.text, "Сдам студию в Джомтьене на долгосрок");
    }

    #[test]
    fn test_admit_requires_text() {
        let photo = json!({
            "photo": [{
                "file_id": "AgAD",
                "file_unique_id": "AQAD",
                "width": 90,
                "height": 90
            }]
        });
        assert!(admit(message(supergroup(), photo), snapshot()).is_none());
    }
}
