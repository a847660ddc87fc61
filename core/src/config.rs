//! Settings loaded once at startup from settings.json and passed down explicitly.
//! KOOK credentials, completion backend, per-channel policy, conversation flags, server and log.
//! Any problem here is fatal: the process does not start without a usable channel list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_KOOK_API_BASE: &str = "https://www.kookapp.cn/api/v3";
const DEFAULT_COMPLETION_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Env fallbacks for secrets left empty in the settings file.
pub const KOOK_TOKEN_ENV: &str = "YUI_KOOK_TOKEN";
pub const COMPLETION_API_KEY_ENV: &str = "YUI_COMPLETION_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Whole settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kook: KookConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KookConfig {
    #[serde(default)]
    pub token: String,
    /// When set, webhook events carrying a different `verify_token` are rejected.
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default = "default_kook_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Rolling window of user/assistant messages kept per channel (persona excluded).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Backend-owned history timeout, independent of the per-channel binding limit.
    #[serde(default = "default_backend_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// One configured channel. Channels absent from this list are never serviced.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub one_to_one: bool,
    /// Idle budget of a one-to-one binding. 0 disables automatic expiry.
    #[serde(default = "default_max_service_secs")]
    pub max_service_secs: u64,
    #[serde(default = "default_max_reply_tokens")]
    pub max_reply_tokens: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Whether a persona command counts as activity for the idle monitor.
    #[serde(default)]
    pub persona_resets_idle: bool,
    /// Append "`token:IN,OUT`" to answers.
    #[serde(default = "default_true")]
    pub show_token_usage: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_kook_api_base() -> String {
    DEFAULT_KOOK_API_BASE.to_string()
}

fn default_completion_base_url() -> String {
    DEFAULT_COMPLETION_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_history_limit() -> usize {
    16
}

fn default_backend_idle_timeout_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_service_secs() -> u64 {
    300
}

fn default_max_reply_tokens() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5182
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_completion_base_url(),
            model: default_model(),
            history_limit: default_history_limit(),
            idle_timeout_secs: default_backend_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            persona_resets_idle: false,
            show_token_usage: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Read, parse and validate the settings file. Empty secrets fall back to env vars.
pub fn load_settings_from(path: &Path) -> Result<Config, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_settings(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.apply_env_fallbacks(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Parse settings JSON without validation (used by the loader and tests).
pub fn parse_settings(data: &str) -> Result<Config, serde_json::Error> {
    serde_json::from_str(data)
}

impl Config {
    fn apply_env_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.kook.token.trim().is_empty() {
            if let Some(token) = lookup(KOOK_TOKEN_ENV).filter(|s| !s.trim().is_empty()) {
                self.kook.token = token;
            }
        }
        if self.completion.api_key.trim().is_empty() {
            if let Some(key) = lookup(COMPLETION_API_KEY_ENV).filter(|s| !s.trim().is_empty()) {
                self.completion.api_key = key;
            }
        }
    }

    /// Startup checks; every failure here stops the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kook.token.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "kook.token is empty (set it or {})",
                KOOK_TOKEN_ENV
            )));
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("channels list is empty".into()));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            let id = channel.id.trim();
            if id.is_empty() {
                return Err(ConfigError::Invalid("channel with empty id".into()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate channel id {}", id)));
            }
        }
        if self.completion.history_limit == 0 {
            return Err(ConfigError::Invalid("completion.history_limit must be > 0".into()));
        }
        Ok(())
    }
}
