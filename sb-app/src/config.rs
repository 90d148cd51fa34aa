//! Switchboard configuration loader.

use sb_core::{ReliabilityConfig, RoutingConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Where per-channel state (cursors, credential blobs) is kept.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.switchboard/data".to_string()
}

fn default_inbound_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Endpoint that receives debounced batches as JSON.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_agent_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: None,
            timeout_seconds: default_agent_timeout_seconds(),
        }
    }
}

fn default_agent_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_signal_api_base_url")]
    pub api_base_url: String,
    /// The registered signal-cli account, e.g. `+15551234567`.
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_signal_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub start_from_latest: bool,
    #[serde(default = "default_signal_receive_timeout_seconds")]
    pub receive_timeout_seconds: u64,
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base_url: default_signal_api_base_url(),
            account: String::new(),
            api_token: None,
            poll_interval_ms: default_signal_poll_interval_ms(),
            start_from_latest: true,
            receive_timeout_seconds: default_signal_receive_timeout_seconds(),
            routing: RoutingConfig::default(),
        }
    }
}

fn default_signal_api_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_signal_poll_interval_ms() -> u64 {
    3000
}

fn default_signal_receive_timeout_seconds() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl SwitchboardConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml(&contents, |key| std::env::var(key).ok())
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    /// Parses, applies overrides from `env`, and validates.
    pub fn from_toml(
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut cfg: SwitchboardConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides(env);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        if let Some(v) = var("SIGNAL_ACCOUNT") {
            self.channels.signal.account = v;
            self.channels.signal.enabled = true;
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = var("SWITCHBOARD_AGENT_ENDPOINT") {
            self.agent.endpoint = v;
        }
        if let Some(v) = var("SWITCHBOARD_DATA_DIR") {
            self.general.data_dir = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.reliability.validate()?;
        if self.general.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("general.inbound_queue_capacity must be > 0"));
        }
        if self.general.data_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("general.data_dir is required"));
        }
        let any_enabled = self.channels.signal.enabled || self.channels.telegram.enabled;
        if any_enabled && self.agent.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "agent.endpoint is required when a channel is enabled"
            ));
        }
        if self.agent.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("agent.timeout_seconds must be > 0"));
        }
        let signal = &self.channels.signal;
        if signal.enabled {
            if signal.account.trim().is_empty() {
                return Err(anyhow::anyhow!("channels.signal.account is required"));
            }
            if signal.poll_interval_ms == 0 {
                return Err(anyhow::anyhow!("channels.signal.poll_interval_ms must be > 0"));
            }
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("channels.telegram.bot_token is required"));
        }
        Ok(())
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.general.data_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".switchboard").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix("~/") else {
        return Ok(PathBuf::from(trimmed));
    };
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(rest))
}

#[cfg(test)]
mod tests {
    use super::SwitchboardConfig;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_file_takes_every_default() {
        let cfg = SwitchboardConfig::from_toml("", no_env).expect("empty config is valid");
        assert_eq!(cfg.general.data_dir, "~/.switchboard/data");
        assert_eq!(cfg.reliability.dedupe.ttl_ms, 20 * 60 * 1000);
        assert_eq!(cfg.reliability.reconnect.max_attempts, 12);
        assert!(!cfg.channels.signal.enabled);
        assert_eq!(cfg.channels.signal.poll_interval_ms, 3000);
        assert_eq!(cfg.channels.telegram.routing.linked_domain, "lid");
    }

    #[test]
    fn channel_routing_tables_parse() {
        let toml = r#"
            [agent]
            endpoint = "http://127.0.0.1:9000/batches"

            [reliability.debounce]
            window_ms = 1500

            [channels.signal]
            enabled = true
            account = "+15550001111"

            [channels.signal.routing]
            self_address = "+15550001111"
            mention_patterns = ["@?switchboard"]

            [channels.signal.routing.groups."grp=="]
            require_mention = false
        "#;
        let cfg = SwitchboardConfig::from_toml(toml, no_env).expect("parse");
        assert_eq!(cfg.reliability.debounce.window_ms, 1500);
        let routing = &cfg.channels.signal.routing;
        assert_eq!(routing.mention_patterns, vec!["@?switchboard".to_string()]);
        assert_eq!(routing.groups["grp=="].require_mention, Some(false));
    }

    #[test]
    fn env_overrides_enable_channels() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("SWITCHBOARD_AGENT_ENDPOINT", "http://agent.local/batch"),
            ("SWITCHBOARD_DATA_DIR", "/var/lib/switchboard"),
            ("SIGNAL_ACCOUNT", "  "),
        ]);
        let cfg = SwitchboardConfig::from_toml("", |key| env.get(key).map(|v| v.to_string()))
            .expect("overrides apply");
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.channels.telegram.bot_token, "123:abc");
        assert_eq!(cfg.agent.endpoint, "http://agent.local/batch");
        assert_eq!(cfg.general.data_dir, "/var/lib/switchboard");
        assert!(!cfg.channels.signal.enabled, "blank override is ignored");
    }

    #[test]
    fn enabled_channel_requires_agent_endpoint() {
        let toml = r#"
            [channels.telegram]
            enabled = true
            bot_token = "123:abc"
        "#;
        let err = SwitchboardConfig::from_toml(toml, no_env).expect_err("must fail");
        assert!(err.to_string().contains("agent.endpoint"));
    }

    #[test]
    fn invalid_reconnect_settings_are_rejected() {
        let toml = r#"
            [reliability.reconnect]
            factor = 0.5
        "#;
        assert!(SwitchboardConfig::from_toml(toml, no_env).is_err());
    }
}
