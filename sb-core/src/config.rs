//! Configuration values consumed by the reliability layer.
//!
//! These are plain values; loading and env overrides live in `sb-app`.

use crate::backoff::BackoffPolicy;
use crate::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ReliabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.reconnect.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Zero disables expiry.
    #[serde(default = "default_dedupe_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_dedupe_max_size")]
    pub max_size: usize,
}

fn default_dedupe_ttl_ms() -> u64 {
    20 * 60 * 1000
}

fn default_dedupe_max_size() -> usize {
    5000
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_dedupe_ttl_ms(),
            max_size: default_dedupe_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Quiet window in milliseconds. Zero flushes every message immediately.
    #[serde(default)]
    pub window_ms: u64,
    /// Slash commands skip batching so they are answered on their own.
    #[serde(default = "default_true")]
    pub skip_commands: bool,
    #[serde(default = "default_true")]
    pub skip_media: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: 0,
            skip_commands: true,
            skip_media: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_ms() -> u64 {
    BackoffPolicy::default().initial_ms
}

fn default_max_ms() -> u64 {
    BackoffPolicy::default().max_ms
}

fn default_factor() -> f64 {
    BackoffPolicy::default().factor
}

fn default_jitter_fraction() -> f64 {
    BackoffPolicy::default().jitter_fraction
}

fn default_max_attempts() -> u32 {
    ReconnectPolicy::default().max_attempts
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            factor: default_factor(),
            jitter_fraction: default_jitter_fraction(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: BackoffPolicy {
                initial_ms: self.initial_ms,
                max_ms: self.max_ms,
                factor: self.factor,
                jitter_fraction: self.jitter_fraction,
            },
            max_attempts: self.max_attempts,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_ms == 0 {
            return Err(anyhow::anyhow!("reliability.reconnect.initial_ms must be > 0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(anyhow::anyhow!(
                "reliability.reconnect.max_ms must be >= initial_ms"
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(anyhow::anyhow!("reliability.reconnect.factor must be >= 1.0"));
        }
        if !self.jitter_fraction.is_finite() || !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(anyhow::anyhow!(
                "reliability.reconnect.jitter_fraction must be within [0, 1]"
            ));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("reliability.reconnect.max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Per-channel routing policy: who the bot is, and when group messages
/// reach the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// The bot's own real address on this platform.
    #[serde(default)]
    pub self_address: Option<String>,
    /// The bot's own linked identifier, when the platform assigns one.
    #[serde(default)]
    pub self_linked_id: Option<String>,
    /// E.164 form of the bot's phone number, e.g. `+15551234567`.
    #[serde(default)]
    pub self_phone: Option<String>,
    /// The bot runs on the owner's own number; native @mentions of that
    /// number are the owner talking about themselves, not addressing the bot.
    #[serde(default)]
    pub self_chat_mode: bool,
    /// Case-insensitive regular expressions that count as a mention.
    #[serde(default)]
    pub mention_patterns: Vec<String>,
    /// Group allowlist keyed by group id; `*` matches any group. Empty
    /// means every group is allowed.
    #[serde(default)]
    pub groups: HashMap<String, GroupEntry>,
    /// Domain that marks linked identifiers (`<id>@<domain>`).
    #[serde(default = "default_linked_domain")]
    pub linked_domain: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            self_address: None,
            self_linked_id: None,
            self_phone: None,
            self_chat_mode: false,
            mention_patterns: Vec::new(),
            groups: HashMap::new(),
            linked_domain: default_linked_domain(),
        }
    }
}

pub(crate) fn default_linked_domain() -> String {
    "lid".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupEntry {
    #[serde(default)]
    pub require_mention: Option<bool>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{ReconnectConfig, ReliabilityConfig, RoutingConfig};

    #[test]
    fn empty_tables_take_defaults() {
        let cfg: ReliabilityConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg.dedupe.ttl_ms, 1_200_000);
        assert_eq!(cfg.dedupe.max_size, 5000);
        assert_eq!(cfg.debounce.window_ms, 0);
        assert!(cfg.debounce.skip_commands);
        assert_eq!(cfg.reconnect.max_attempts, 12);
        assert!(cfg.validate().is_ok());

        let routing: RoutingConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(routing.linked_domain, "lid");
        assert!(routing.groups.is_empty());
        assert_eq!(RoutingConfig::default().linked_domain, "lid");
    }

    #[test]
    fn reconnect_validation_rejects_nonsense() {
        let mut cfg = ReconnectConfig::default();
        cfg.factor = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = ReconnectConfig::default();
        cfg.max_ms = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = ReconnectConfig::default();
        cfg.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn policy_carries_every_field() {
        let cfg = ReconnectConfig {
            initial_ms: 10,
            max_ms: 20,
            factor: 1.5,
            jitter_fraction: 0.1,
            max_attempts: 4,
        };
        let policy = cfg.policy();
        assert_eq!(policy.backoff.initial_ms, 10);
        assert_eq!(policy.backoff.max_ms, 20);
        assert_eq!(policy.max_attempts, 4);
    }
}
