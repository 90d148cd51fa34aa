use crate::traits::ChannelAdapter;
use crate::types::{DeliveryId, OutboundMessage};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use sb_core::{CredentialStore, Disconnect, InboundEvent, Participant, SessionLifecycle};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE_URL: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;

/// Who the bot is, as reported by `getMe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramBotProfile {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TelegramOffset {
    offset: i64,
}

pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base_url: String,
    bot_token: String,
    state: Option<CredentialStore>,
    offset: Mutex<Option<i64>>,
    profile: Mutex<Option<TelegramBotProfile>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            return Err(anyhow!("telegram bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base_url: TELEGRAM_API_BASE_URL.to_string(),
            bot_token: bot_token.to_string(),
            state: None,
            offset: Mutex::new(None),
            profile: Mutex::new(None),
        })
    }

    pub fn with_api_base_url(mut self, api_base_url: &str) -> Self {
        self.api_base_url = api_base_url.trim().trim_end_matches('/').to_string();
        self
    }

    /// Persists the update offset so a restart does not replay updates.
    pub fn with_state_store(mut self, store: CredentialStore) -> Self {
        self.state = Some(store);
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base_url, self.bot_token, method
        ))?)
    }

    fn cached_profile(&self) -> Option<TelegramBotProfile> {
        self.profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Fetches (once) and caches the bot's own profile.
    pub async fn fetch_profile(&self) -> Result<TelegramBotProfile> {
        if let Some(profile) = self.cached_profile() {
            return Ok(profile);
        }
        let response = self.http.get(self.api_url("getMe")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("telegram getMe failed: status={status} body={body}"));
        }
        let parsed: TelegramResponse<TelegramUser> = response.json().await?;
        let user = parsed
            .result
            .ok_or_else(|| anyhow!("telegram getMe returned no user"))?;
        let profile = TelegramBotProfile {
            id: user.id,
            username: user.username,
        };
        *self
            .profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(profile.clone());
        tracing::info!(bot_id = profile.id, username = ?profile.username, "telegram bot profile loaded");
        Ok(profile)
    }

    async fn current_offset(&self) -> i64 {
        let cached = *self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(offset) = cached {
            return offset;
        }
        let stored = match &self.state {
            Some(store) => match store.load_json::<TelegramOffset>().await {
                Ok(stored) => stored.map(|stored| stored.offset),
                Err(error) => {
                    tracing::warn!(%error, "failed to read telegram offset");
                    None
                }
            },
            None => None,
        };
        let offset = stored.unwrap_or(0);
        *self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(offset);
        offset
    }

    fn remember_offset(&self, offset: i64) {
        *self
            .offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(offset);
        if let Some(store) = &self.state {
            if let Err(error) = store.save_json(&TelegramOffset { offset }) {
                tracing::warn!(%error, "failed to queue telegram offset save");
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = TELEGRAM_CHANNEL_ID))]
    async fn run_session(
        &self,
        tx: &mpsc::Sender<InboundEvent>,
        lifecycle: &SessionLifecycle,
    ) -> Result<Disconnect> {
        let profile = self.fetch_profile().await?;
        let mut offset = self.current_offset().await;

        loop {
            let request = self
                .http
                .get(self.api_url("getUpdates")?)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send();
            let response = tokio::select! {
                _ = lifecycle.shutdown().cancelled() => return Ok(Disconnect::retry("shutdown")),
                response = request => response?,
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                return Ok(disconnect_for_status(status, &body));
            }

            let parsed: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
            lifecycle.on_connected();

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            let before = offset;
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(event) = build_message_event(&update, &profile) {
                    tx.send(event)
                        .await
                        .map_err(|e| anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
            if offset != before {
                self.remember_offset(offset);
            }
        }
    }

    async fn send(&self, recipient: &str, message: OutboundMessage) -> Result<DeliveryId> {
        let mut body = serde_json::json!({
            "chat_id": recipient,
            "text": message.content,
        });
        if let Some(reply_to) = message
            .reply_to
            .as_ref()
            .and_then(|id| id.as_str().parse::<i64>().ok())
        {
            body["reply_to_message_id"] = serde_json::json!(reply_to);
            body["allow_sending_without_reply"] = serde_json::json!(true);
        }
        let resp = self
            .http
            .post(self.api_url("sendMessage")?)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow!("telegram send failed: status={status} body={text}"));
        }
        let parsed: TelegramResponse<TelegramSentMessage> = resp.json().await?;
        let message_id = parsed
            .result
            .map(|sent| sent.message_id.to_string())
            .unwrap_or_default();
        Ok(DeliveryId::new(message_id))
    }
}

fn disconnect_for_status(status: StatusCode, body: &str) -> Disconnect {
    let reason = format!("telegram getUpdates failed: status={status} body={body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            Disconnect::terminal(reason)
        }
        _ => Disconnect::retry(reason),
    }
}

fn build_message_event(update: &TelegramUpdate, profile: &TelegramBotProfile) -> Option<InboundEvent> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let raw_text = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .unwrap_or_default();
    let text = raw_text.trim().to_string();
    let has_media = message.has_non_text_payload();
    if text.is_empty() && !has_media {
        return None;
    }

    let sender = message
        .from
        .as_ref()
        .map(|user| Participant::new(user.id.to_string()))
        .unwrap_or_else(|| Participant::new(format!("chat:{}", chat.id)));
    let event_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{}", update.update_id));
    let is_group = chat.r#type != "private";

    let entities = if message.text.is_some() {
        &message.entities
    } else {
        &message.caption_entities
    };
    let native_mentions: Vec<String> = entities
        .iter()
        .filter_map(|entity| mention_target(raw_text, entity, profile))
        .collect();

    let reply_to_sender = message
        .reply_to_message
        .as_ref()
        .and_then(|reply| reply.from.as_ref())
        .map(|user| Participant::new(user.id.to_string()));

    Some(InboundEvent {
        channel: TELEGRAM_CHANNEL_ID.into(),
        event_id: event_id.into(),
        conversation_key: chat.id.to_string(),
        sender,
        text,
        timestamp: message
            .date
            .and_then(|date| DateTime::from_timestamp(date, 0))
            .unwrap_or_else(Utc::now),
        native_mentions: (!native_mentions.is_empty()).then_some(native_mentions),
        reply_to_sender,
        is_group,
        group_id: is_group.then(|| chat.id.to_string()),
        has_media,
    })
}

/// Address a mention entity refers to. `@username` mentions of the bot map to
/// its numeric id; other usernames are kept verbatim.
fn mention_target(
    text: &str,
    entity: &TelegramEntity,
    profile: &TelegramBotProfile,
) -> Option<String> {
    match entity.r#type.as_str() {
        "text_mention" => entity.user.as_ref().map(|user| user.id.to_string()),
        "mention" => {
            let handle = utf16_slice(text, entity.offset, entity.length)?;
            let username = handle.trim_start_matches('@');
            let is_bot = profile
                .username
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(username));
            Some(if is_bot {
                profile.id.to_string()
            } else {
                handle
            })
        }
        _ => None,
    }
}

// Entity offsets are in UTF-16 code units.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    String::from_utf16(units.get(offset..end)?).ok()
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    entities: Vec<TelegramEntity>,
    #[serde(default)]
    caption_entities: Vec<TelegramEntity>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    animation: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
    #[serde(default)]
    video_note: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramEntity {
    r#type: String,
    offset: usize,
    length: usize,
    #[serde(default)]
    user: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.animation.is_some()
            || self.audio.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.voice.is_some()
            || self.video_note.is_some()
    }
}
