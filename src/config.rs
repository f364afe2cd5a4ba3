//! Gateway configuration loaded from `config.json`.
//!
//! Every field has a serde default so a partial (or missing) config file
//! still yields a runnable gateway; channels stay disabled until explicitly
//! enabled.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub llm: LlmConfig,
    pub gateway: GatewaySection,
    pub channels: ChannelsConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub cron: CronConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Load from a path; a missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Config(format!("parse {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(GatewayError::Io(e)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmConfig {
    /// Provider kind: "openai", "openrouter", "ollama", "anthropic".
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            max_tokens: 8192,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySection {
    /// HTTP listen address for the Slack Events API endpoint.
    pub listen: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8791".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelsConfig {
    pub discord: DiscordConfig,
    pub slack: SlackConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscordConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlackConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub signing_secret: String,
    /// HTTP path of the events endpoint.
    pub events_path: String,
    /// Bot user id, used to strip leading mentions and detect self-messages.
    pub bot_id: String,
    pub dm_enabled: bool,
    /// "open", "mention" or "allowlist".
    pub group_policy: String,
    pub group_allowlist: Vec<String>,
    pub allow_from: Vec<String>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            signing_secret: String::new(),
            events_path: "/slack/events".into(),
            bot_id: String::new(),
            dm_enabled: true,
            group_policy: "open".into(),
            group_allowlist: Vec::new(),
            allow_from: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub base_url: String,
    pub poll_timeout_sec: u64,
    pub workers: usize,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub max_iters: usize,
    /// Max session messages included in the prompt.
    pub history_window: usize,
    /// Message count above which consolidation kicks in.
    pub memory_window: usize,
    pub restrict_to_workspace: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iters: 20,
            history_window: 50,
            memory_window: 50,
            restrict_to_workspace: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    pub web: WebToolsConfig,
    pub exec_timeout_sec: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            web: WebToolsConfig::default(),
            exec_timeout_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebToolsConfig {
    pub brave_api_key: String,
    /// Domain patterns allowed for web_fetch; unset means allow all.
    pub allowed_domains: Option<Vec<String>>,
    pub blocked_domains: Vec<String>,
    pub fetch_timeout_sec: u64,
    pub max_response_bytes: u64,
}

impl Default for WebToolsConfig {
    fn default() -> Self {
        Self {
            brave_api_key: String::new(),
            allowed_domains: None,
            blocked_domains: Vec::new(),
            fetch_timeout_sec: 30,
            max_response_bytes: 4 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronConfig {
    pub enabled: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_sec: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = Config::default();
        assert_eq!(cfg.agent.max_iters, 20);
        assert_eq!(cfg.agent.memory_window, 50);
        assert!(cfg.cron.enabled);
        assert!(!cfg.heartbeat.enabled);
        assert_eq!(cfg.channels.slack.events_path, "/slack/events");
        assert!(cfg.channels.slack.dm_enabled);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let raw = r#"{ "channels": { "telegram": { "enabled": true, "token": "t" } } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.channels.telegram.token, "t");
        assert_eq!(cfg.tools.exec_timeout_sec, 60);
        assert_eq!(cfg.llm.max_tokens, 8192);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.gateway.listen, "127.0.0.1:8791");
    }
}
