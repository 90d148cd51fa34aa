use crate::traits::ChannelAdapter;
use crate::types::{DeliveryId, OutboundMessage};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{StatusCode, Url};
use sb_core::address::AddressScheme;
use sb_core::{
    CredentialStore, Disconnect, InboundEvent, LinkedIdLookup, Participant, SessionLifecycle,
    sleep_with_cancel,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SIGNAL_CHANNEL_ID: &str = "signal";
const CONTACTS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct SignalApi {
    http: reqwest::Client,
    api_base_url: String,
    account: String,
    api_token: Option<String>,
    receive_timeout_seconds: u64,
}

enum Poll {
    Envelopes(Vec<SignalEnvelope>),
    Rejected(String),
}

impl SignalApi {
    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.api_base_url, path))
            .map_err(|e| anyhow!("invalid signal API URL path {path:?}: {e}"))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn receive_once(&self) -> Result<Poll> {
        let url = self.api_url(&format!("/v1/receive/{}", self.account))?;
        let response = self
            .authorized_request(self.http.get(url))
            .query(&[("timeout", self.receive_timeout_seconds)])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Ok(Poll::Rejected(format!("signal rejected credentials: status={status} body={body}")));
        }
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("signal receive failed: status={status} body={body}"));
        }
        Ok(Poll::Envelopes(parse_signal_receive_payload(body)))
    }

    async fn contacts(&self) -> Result<serde_json::Value> {
        let url = self.api_url(&format!("/v1/contacts/{}", self.account))?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("signal contacts failed: status={status} body={body}"));
        }
        Ok(body)
    }
}

/// The signal-cli contact list, consulted for linked ids no message has
/// disclosed yet.
pub struct SignalContactDirectory {
    api: SignalApi,
    scheme: AddressScheme,
    entries: DashMap<String, String>,
    last_refresh: tokio::sync::Mutex<Option<Instant>>,
}

impl SignalContactDirectory {
    async fn refresh_if_stale(&self) {
        let mut last_refresh = self.last_refresh.lock().await;
        if last_refresh.is_some_and(|at| at.elapsed() < CONTACTS_REFRESH_INTERVAL) {
            return;
        }
        *last_refresh = Some(Instant::now());
        match self.api.contacts().await {
            Ok(body) => {
                let pairs = parse_contacts(&body, &self.scheme);
                tracing::debug!(contacts = pairs.len(), "signal contacts refreshed");
                for (linked, number) in pairs {
                    self.entries.insert(linked, number);
                }
            }
            Err(error) => tracing::warn!(%error, "signal contacts refresh failed"),
        }
    }
}

#[async_trait]
impl LinkedIdLookup for SignalContactDirectory {
    async fn real_address_for(&self, linked_id: &str) -> Option<String> {
        if let Some(number) = self.entries.get(linked_id) {
            return Some(number.value().clone());
        }
        self.refresh_if_stale().await;
        self.entries.get(linked_id).map(|entry| entry.value().clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SignalCursor {
    cursor_millis: i64,
}

pub struct SignalAdapter {
    api: SignalApi,
    scheme: AddressScheme,
    poll_interval: Duration,
    start_from_latest: bool,
    state: Option<CredentialStore>,
    cursor: Mutex<Option<i64>>,
    directory: Arc<SignalContactDirectory>,
}

impl SignalAdapter {
    pub fn new(api_base_url: &str, account: &str) -> Result<Self> {
        let api_base_url = normalize_signal_api_base_url(api_base_url)?;
        let account = account.trim();
        if account.is_empty() {
            return Err(anyhow!("signal account is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let api = SignalApi {
            http,
            api_base_url,
            account: account.to_string(),
            api_token: None,
            receive_timeout_seconds: 5,
        };
        let scheme = AddressScheme::default();
        Ok(Self {
            directory: Arc::new(directory_for(&api, &scheme)),
            api,
            scheme,
            poll_interval: Duration::from_millis(3000),
            start_from_latest: true,
            state: None,
            cursor: Mutex::new(None),
        })
    }

    pub fn with_api_token(mut self, api_token: Option<String>) -> Self {
        self.api.api_token = api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self.directory = Arc::new(directory_for(&self.api, &self.scheme));
        self
    }

    pub fn with_linked_domain(mut self, linked_domain: &str) -> Self {
        self.scheme = AddressScheme::new(linked_domain);
        self.directory = Arc::new(directory_for(&self.api, &self.scheme));
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_start_from_latest(mut self, start_from_latest: bool) -> Self {
        self.start_from_latest = start_from_latest;
        self
    }

    pub fn with_receive_timeout_seconds(mut self, receive_timeout_seconds: u64) -> Self {
        self.api.receive_timeout_seconds = receive_timeout_seconds.max(1);
        self
    }

    /// Persists the receive cursor so a restart does not replay history.
    pub fn with_state_store(mut self, store: CredentialStore) -> Self {
        self.state = Some(store);
        self
    }

    fn current_cursor(&self) -> Option<i64> {
        *self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn stored_cursor(&self) -> Option<i64> {
        let store = self.state.as_ref()?;
        match store.load_json::<SignalCursor>().await {
            Ok(cursor) => cursor.map(|cursor| cursor.cursor_millis),
            Err(error) => {
                tracing::warn!(%error, "failed to read signal cursor");
                None
            }
        }
    }

    fn remember_cursor(&self, cursor_millis: i64) {
        *self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cursor_millis);
        if let Some(store) = &self.state {
            if let Err(error) = store.save_json(&SignalCursor { cursor_millis }) {
                tracing::warn!(%error, "failed to queue signal cursor save");
            }
        }
    }

    async fn initial_cursor(&self, lifecycle: &SessionLifecycle) -> Result<Option<Poll>> {
        if self.current_cursor().is_some() {
            return Ok(None);
        }
        if let Some(stored) = self.stored_cursor().await {
            *self
                .cursor
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stored);
            tracing::info!(cursor_millis = stored, "signal adapter restored cursor");
            return Ok(None);
        }
        if !self.start_from_latest {
            return Ok(None);
        }
        match self.api.receive_once().await? {
            Poll::Envelopes(seed) => {
                lifecycle.on_connected();
                if let Some(newest) = seed.iter().filter_map(envelope_timestamp_millis).max() {
                    self.remember_cursor(newest);
                }
                tracing::info!(cursor_millis = ?self.current_cursor(), "signal adapter seeded cursor");
                Ok(None)
            }
            rejected => Ok(Some(rejected)),
        }
    }
}

fn directory_for(api: &SignalApi, scheme: &AddressScheme) -> SignalContactDirectory {
    SignalContactDirectory {
        api: api.clone(),
        scheme: scheme.clone(),
        entries: DashMap::new(),
        last_refresh: tokio::sync::Mutex::new(None),
    }
}

#[async_trait]
impl ChannelAdapter for SignalAdapter {
    fn channel_id(&self) -> &str {
        SIGNAL_CHANNEL_ID
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = SIGNAL_CHANNEL_ID))]
    async fn run_session(
        &self,
        tx: &mpsc::Sender<InboundEvent>,
        lifecycle: &SessionLifecycle,
    ) -> Result<Disconnect> {
        if let Some(Poll::Rejected(reason)) = self.initial_cursor(lifecycle).await? {
            return Ok(Disconnect::terminal(reason));
        }

        loop {
            let envelopes = match self.api.receive_once().await? {
                Poll::Envelopes(envelopes) => envelopes,
                Poll::Rejected(reason) => return Ok(Disconnect::terminal(reason)),
            };
            lifecycle.on_connected();

            let cursor = self.current_cursor();
            let mut newest_seen = cursor;
            let mut emitted = 0usize;

            for envelope in envelopes {
                let timestamp_millis = envelope_timestamp_millis(&envelope)
                    .unwrap_or_else(|| Utc::now().timestamp_millis());

                if cursor.is_some_and(|cursor| timestamp_millis <= cursor) {
                    continue;
                }

                if let Some(event) = convert_signal_envelope(&envelope, timestamp_millis, &self.scheme)
                {
                    tx.send(event)
                        .await
                        .map_err(|e| anyhow!("signal inbound queue closed: {e}"))?;
                    emitted += 1;
                }

                match newest_seen {
                    Some(current) if current >= timestamp_millis => {}
                    _ => newest_seen = Some(timestamp_millis),
                }
            }

            if let Some(newest) = newest_seen.filter(|newest| Some(*newest) != cursor) {
                self.remember_cursor(newest);
            }
            tracing::debug!(emitted, cursor_millis = ?newest_seen, "signal poll cycle complete");

            if sleep_with_cancel(self.poll_interval, lifecycle.shutdown())
                .await
                .is_err()
            {
                return Ok(Disconnect::retry("shutdown"));
            }
        }
    }

    async fn send(&self, recipient: &str, message: OutboundMessage) -> Result<DeliveryId> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(anyhow!(
                "recipient (signal phone number or group:<group_id>) is required"
            ));
        }
        if self.scheme.is_linked(recipient) {
            return Err(anyhow!("refusing to send to unresolved linked id {recipient}"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.api.api_url("/v2/send")?;
        let mut payload = serde_json::json!({
            "number": self.api.account,
            "message": text,
        });
        if let Some(group_id) = recipient
            .strip_prefix("group:")
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            payload["groupId"] = serde_json::json!(group_id);
        } else {
            payload["recipients"] = serde_json::json!([recipient]);
        }

        let response = self
            .api
            .authorized_request(self.api.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("signal send failed: status={status} body={body}"));
        }
        Ok(DeliveryId::new(
            send_timestamp(&body).unwrap_or_else(|| Utc::now().timestamp_millis().to_string()),
        ))
    }

    fn linked_id_lookup(&self) -> Option<Arc<dyn LinkedIdLookup>> {
        Some(self.directory.clone())
    }
}

fn normalize_signal_api_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("signal api_base_url is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid signal api_base_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid signal api_base_url scheme: {other} (expected http or https)"
        )),
    }
}

fn parse_signal_receive_payload(body: serde_json::Value) -> Vec<SignalEnvelope> {
    match body {
        serde_json::Value::Array(values) => values
            .into_iter()
            .filter_map(extract_signal_envelope)
            .collect(),
        serde_json::Value::Object(map) => {
            if let Some(messages) = map.get("messages").and_then(|value| value.as_array()) {
                return messages
                    .iter()
                    .cloned()
                    .filter_map(extract_signal_envelope)
                    .collect();
            }
            extract_signal_envelope(serde_json::Value::Object(map))
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

fn extract_signal_envelope(raw: serde_json::Value) -> Option<SignalEnvelope> {
    let envelope_value = match raw.get("envelope") {
        Some(envelope) => envelope.clone(),
        None => raw,
    };
    serde_json::from_value(envelope_value).ok()
}

fn parse_contacts(body: &serde_json::Value, scheme: &AddressScheme) -> Vec<(String, String)> {
    body.as_array()
        .into_iter()
        .flatten()
        .filter_map(|contact| {
            let uuid = contact.get("uuid")?.as_str().and_then(clean)?;
            let number = contact.get("number")?.as_str().and_then(clean)?;
            Some((scheme.linked(uuid), number.to_string()))
        })
        .collect()
}

fn send_timestamp(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("timestamp")? {
        serde_json::Value::String(timestamp) => Some(timestamp.clone()),
        serde_json::Value::Number(timestamp) => Some(timestamp.to_string()),
        _ => None,
    }
}

fn envelope_timestamp_millis(envelope: &SignalEnvelope) -> Option<i64> {
    envelope.timestamp.or_else(|| {
        envelope
            .data_message
            .as_ref()
            .and_then(|message| message.timestamp)
    })
}

fn convert_signal_envelope(
    envelope: &SignalEnvelope,
    timestamp_millis: i64,
    scheme: &AddressScheme,
) -> Option<InboundEvent> {
    let data_message = envelope.data_message.as_ref()?;
    if data_message.reaction.is_some() {
        return None;
    }
    let sender = participant(
        envelope.source_number.as_deref(),
        envelope.source_uuid.as_deref(),
        envelope.source.as_deref(),
        scheme,
    )?;

    let text = data_message
        .message
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let has_media = !data_message.attachments.is_empty();
    if text.is_empty() && !has_media {
        return None;
    }

    let group_id = data_message
        .group_info
        .as_ref()
        .and_then(|info| info.group_id.as_deref())
        .and_then(clean)
        .map(ToOwned::to_owned);
    let conversation_key = match &group_id {
        Some(group_id) => format!("group:{group_id}"),
        None => sender.address.clone(),
    };

    let native_mentions: Vec<String> = data_message
        .mentions
        .iter()
        .flat_map(|mention| {
            let number = mention.number.as_deref().and_then(clean).map(ToOwned::to_owned);
            let linked = mention.uuid.as_deref().and_then(clean).map(|uuid| scheme.linked(uuid));
            number.into_iter().chain(linked)
        })
        .collect();

    let reply_to_sender = data_message.quote.as_ref().and_then(|quote| {
        participant(
            quote.author_number.as_deref(),
            quote.author_uuid.as_deref(),
            quote.author.as_deref(),
            scheme,
        )
    });

    Some(InboundEvent {
        channel: SIGNAL_CHANNEL_ID.into(),
        event_id: format!("{timestamp_millis}-{}", sender.address).into(),
        conversation_key,
        is_group: group_id.is_some(),
        group_id,
        text,
        timestamp: DateTime::from_timestamp_millis(timestamp_millis).unwrap_or_else(Utc::now),
        native_mentions: (!native_mentions.is_empty()).then_some(native_mentions),
        reply_to_sender,
        has_media,
        sender,
    })
}

/// Builds a participant from whichever of number and uuid the payload
/// carries. A uuid-only participant is addressed by its linked id.
fn participant(
    number: Option<&str>,
    uuid: Option<&str>,
    legacy: Option<&str>,
    scheme: &AddressScheme,
) -> Option<Participant> {
    let legacy = legacy.and_then(clean);
    let number = number
        .and_then(clean)
        .or_else(|| legacy.filter(|value| value.starts_with('+')));
    let linked = uuid
        .and_then(clean)
        .or_else(|| legacy.filter(|value| !value.starts_with('+')))
        .map(|uuid| scheme.linked(uuid));

    match (number, linked) {
        (Some(number), linked) => {
            let participant = Participant::new(number).with_phone(number);
            Some(match linked {
                Some(linked) => participant.with_linked_id(linked),
                None => participant,
            })
        }
        (None, Some(linked)) => Some(Participant::new(linked.clone()).with_linked_id(linked)),
        (None, None) => None,
    }
}

fn clean(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalEnvelope {
    source: Option<String>,
    source_number: Option<String>,
    source_uuid: Option<String>,
    timestamp: Option<i64>,
    data_message: Option<SignalDataMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalDataMessage {
    timestamp: Option<i64>,
    message: Option<String>,
    reaction: Option<serde_json::Value>,
    group_info: Option<SignalGroupInfo>,
    mentions: Vec<SignalMention>,
    quote: Option<SignalQuote>,
    attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalGroupInfo {
    group_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalMention {
    number: Option<String>,
    uuid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SignalQuote {
    id: Option<i64>,
    author: Option<String>,
    author_number: Option<String>,
    author_uuid: Option<String>,
}
