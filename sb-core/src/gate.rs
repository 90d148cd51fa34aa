use crate::config::RoutingConfig;
use crate::event::InboundEvent;
use crate::mention::{MentionDetector, MentionSource};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateReason {
    GroupNotAllowed,
    MentionRequired,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GroupNotAllowed => "group-not-allowed",
            Self::MentionRequired => "mention-required",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub should_process: bool,
    pub reason: Option<GateReason>,
    pub mention: Option<MentionSource>,
}

impl GateDecision {
    fn process(mention: Option<MentionSource>) -> Self {
        Self {
            should_process: true,
            reason: None,
            mention,
        }
    }

    fn reject(reason: GateReason) -> Self {
        Self {
            should_process: false,
            reason: Some(reason),
            mention: None,
        }
    }
}

/// Group allowlist plus mention requirement for one channel.
pub struct GroupGate {
    allowlist: HashMap<String, bool>,
    detector: MentionDetector,
}

impl GroupGate {
    pub fn new(cfg: &RoutingConfig) -> Self {
        let allowlist = cfg
            .groups
            .iter()
            .map(|(group_id, entry)| (group_id.clone(), entry.require_mention.unwrap_or(true)))
            .collect();
        Self {
            allowlist,
            detector: MentionDetector::new(cfg),
        }
    }

    pub fn detector(&self) -> &MentionDetector {
        &self.detector
    }

    pub fn evaluate(&self, event: &InboundEvent) -> GateDecision {
        if !event.is_group {
            return GateDecision::process(None);
        }

        let group_id = event.group_id.as_deref().unwrap_or(&event.conversation_key);
        let require_mention = if self.allowlist.is_empty() {
            true
        } else {
            match self
                .allowlist
                .get(group_id)
                .or_else(|| self.allowlist.get("*"))
            {
                Some(require_mention) => *require_mention,
                None => return GateDecision::reject(GateReason::GroupNotAllowed),
            }
        };

        if !require_mention {
            return GateDecision::process(None);
        }
        match self.detector.detect(event) {
            Some(source) => GateDecision::process(Some(source)),
            None => GateDecision::reject(GateReason::MentionRequired),
        }
    }
}
