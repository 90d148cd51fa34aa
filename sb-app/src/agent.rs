//! Hand-off of debounced batches to the conversational agent.

use crate::config::AgentConfig;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sb_core::InboundEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One debounced burst from a single sender in a single conversation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentBatch {
    pub batch_id: String,
    pub channel: String,
    pub conversation_key: String,
    pub is_group: bool,
    pub events: Vec<InboundEvent>,
}

impl AgentBatch {
    pub fn from_events(events: Vec<InboundEvent>) -> Option<Self> {
        let first = events.first()?;
        Some(Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            channel: first.channel.to_string(),
            conversation_key: first.conversation_key.clone(),
            is_group: first.is_group,
            events,
        })
    }

    /// Platform id of the newest message, for threading the reply.
    pub fn last_event_id(&self) -> Option<&sb_core::MessageId> {
        self.events.last().map(|event| &event.event_id)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub reply: Option<String>,
}

#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Returns the reply text to send back to the conversation, if any.
    async fn dispatch(&self, batch: &AgentBatch) -> Result<Option<String>>;
}

pub struct HttpAgentClient {
    http: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpAgentClient {
    pub fn new(cfg: &AgentConfig) -> Result<Self> {
        let endpoint = cfg.endpoint.trim().to_string();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| anyhow!("invalid agent.endpoint {endpoint:?}: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            auth_token: cfg
                .auth_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned),
        })
    }
}

#[async_trait]
impl AgentDispatch for HttpAgentClient {
    #[tracing::instrument(level = "info", skip_all, fields(batch_id = %batch.batch_id, events = batch.events.len()))]
    async fn dispatch(&self, batch: &AgentBatch) -> Result<Option<String>> {
        let mut request = self.http.post(&self.endpoint).json(batch);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("agent dispatch failed: status={status} body={body}"));
        }
        Ok(parse_agent_reply(&body))
    }
}

fn parse_agent_reply(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentReply>(body) {
        Ok(parsed) => parsed
            .reply
            .map(|reply| reply.trim().to_string())
            .filter(|reply| !reply.is_empty()),
        Err(error) => {
            tracing::warn!(%error, "agent response is not a JSON reply object; ignoring");
            None
        }
    }
}
