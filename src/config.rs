//! Daemon configuration: TOML file with env-var overrides for secrets.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub redis_url: Option<String>,
    pub scheduler: SchedulerConfig,
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    pub tools: ToolServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently tracked sessions.
    pub max_active_sessions: usize,
    pub tick_interval_ms: u64,
    pub idle_timeout_secs: u64,
    /// How long eviction waits for a cancelled session before aborting it.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 10,
            tick_interval_ms: 300,
            idle_timeout_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    pub url: String,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8765/mcp".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply env overrides. A missing file yields
    /// the defaults so the daemon can run from env alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(url) = std::env::var("MCP_SERVER_URL") {
            self.tools.url = url;
        }
    }

    pub fn redis_url(&self) -> &str {
        self.redis_url.as_deref().unwrap_or("redis://127.0.0.1/")
    }
}
