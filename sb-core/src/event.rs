//! Normalized inbound event, the single shape every adapter hands to the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ChannelId);
id_newtype!(MessageId);

/// One side of a conversation as the platform disclosed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Primary address: a real address when known, otherwise the linked id.
    pub address: String,
    #[serde(default)]
    pub linked_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Participant {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            linked_id: None,
            phone: None,
        }
    }

    pub fn with_linked_id(mut self, linked_id: impl Into<String>) -> Self {
        self.linked_id = Some(linked_id.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: ChannelId,
    pub event_id: MessageId,
    /// Stable key of the conversation: the group id for groups, the peer for
    /// direct chats. Replies are sent back to this address.
    pub conversation_key: String,
    pub sender: Participant,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Mentions the platform attached natively. `None` when the platform
    /// sent no mention list at all; `Some(vec![])` is never produced.
    #[serde(default)]
    pub native_mentions: Option<Vec<String>>,
    #[serde(default)]
    pub reply_to_sender: Option<Participant>,
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub has_media: bool,
}

impl InboundEvent {
    pub fn dedupe_key(&self) -> String {
        if self.event_id.is_empty() {
            return String::new();
        }
        format!(
            "{}:{}:{}",
            self.channel, self.conversation_key, self.event_id
        )
    }

    /// Debounce key: one buffer, and so one delivery lane, per conversation.
    pub fn debounce_key(&self) -> Option<String> {
        if self.conversation_key.is_empty() {
            return None;
        }
        Some(format!("{}:{}", self.channel, self.conversation_key))
    }

    pub fn is_command(&self) -> bool {
        self.text.trim_start().starts_with('/')
    }
}
