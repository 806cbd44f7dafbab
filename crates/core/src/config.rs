use std::env;
use std::fs;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub sweeps: SweepConfig,
    pub channels: ChannelsConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    /// Ordered fallback chain; the first entry is the primary model.
    pub candidates: Vec<String>,
    pub timeout_secs: u64,
    pub max_attempts_per_candidate: u32,
    pub backoff_base_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub dead_letter_interval_secs: u64,
    pub escalation_expiry_interval_secs: u64,
    pub approval_expiry_interval_secs: u64,
    pub approval_ttl_hours: i64,
}

/// Outbound provider endpoints per customer channel. A channel with no
/// endpoint configured cannot deliver; inbound still works.
#[derive(Clone, Debug, Default)]
pub struct ChannelsConfig {
    pub whatsapp_endpoint: Option<String>,
    pub whatsapp_token: Option<SecretString>,
    pub sms_endpoint: Option<String>,
    pub sms_token: Option<SecretString>,
    pub email_endpoint: Option<String>,
    pub email_from: Option<String>,
    pub web_chat_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    /// Chat-provider webhook for escalation messages with quick actions.
    pub chat_webhook_url: Option<String>,
    pub chat_token: Option<SecretString>,
    pub push_endpoint: Option<String>,
    pub push_token: Option<SecretString>,
    pub email_endpoint: Option<String>,
    pub email_from: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl ModelProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub model_provider: Option<ModelProvider>,
    pub model_candidates: Option<Vec<String>>,
    pub model_api_key: Option<String>,
    pub chat_webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://liaison.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            model: ModelConfig {
                provider: ModelProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                candidates: vec!["llama3.1".to_string()],
                timeout_secs: 30,
                max_attempts_per_candidate: 3,
                backoff_base_ms: 500,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1:8088".to_string(),
                health_check_port: 8089,
                graceful_shutdown_secs: 10,
            },
            sweeps: SweepConfig {
                dead_letter_interval_secs: 300,
                escalation_expiry_interval_secs: 60,
                approval_expiry_interval_secs: 300,
                approval_ttl_hours: 24,
            },
            channels: ChannelsConfig::default(),
            notifications: NotificationConfig {
                chat_webhook_url: None,
                chat_token: None,
                push_endpoint: None,
                push_token: None,
                email_endpoint: None,
                email_from: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

/// TOML file shape; every field optional so partial files compose with
/// the defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database: Option<FileDatabase>,
    model: Option<FileModel>,
    server: Option<FileServer>,
    sweeps: Option<FileSweeps>,
    channels: Option<FileChannels>,
    notifications: Option<FileNotifications>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
struct FileChannels {
    whatsapp_endpoint: Option<String>,
    whatsapp_token: Option<String>,
    sms_endpoint: Option<String>,
    sms_token: Option<String>,
    email_endpoint: Option<String>,
    email_from: Option<String>,
    web_chat_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileDatabase {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileModel {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    candidates: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    max_attempts_per_candidate: Option<u32>,
    backoff_base_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileServer {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSweeps {
    dead_letter_interval_secs: Option<u64>,
    escalation_expiry_interval_secs: Option<u64>,
    approval_expiry_interval_secs: Option<u64>,
    approval_ttl_hours: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileNotifications {
    chat_webhook_url: Option<String>,
    chat_token: Option<String>,
    push_endpoint: Option<String>,
    push_token: Option<String>,
    email_endpoint: Option<String>,
    email_from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = options
            .config_path
            .clone()
            .or_else(|| env::var("LIAISON_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = path {
            if path.exists() {
                let raw = fs::read_to_string(&path)
                    .map_err(|source| ConfigError::ReadFile { path: path.clone(), source })?;
                let file: FileConfig = toml::from_str(&raw)
                    .map_err(|source| ConfigError::ParseFile { path: path.clone(), source })?;
                config.apply_file(file);
            } else if options.require_file {
                return Err(ConfigError::MissingConfigFile(path));
            }
        }

        config.apply_env()?;
        config.apply_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(database) = file.database {
            merge(&mut self.database.url, database.url);
            merge(&mut self.database.max_connections, database.max_connections);
            merge(&mut self.database.timeout_secs, database.timeout_secs);
        }
        if let Some(model) = file.model {
            if let Some(provider) = model.provider.as_deref().and_then(ModelProvider::parse) {
                self.model.provider = provider;
            }
            if let Some(api_key) = model.api_key {
                self.model.api_key = Some(api_key.into());
            }
            if model.base_url.is_some() {
                self.model.base_url = model.base_url;
            }
            merge(&mut self.model.candidates, model.candidates);
            merge(&mut self.model.timeout_secs, model.timeout_secs);
            merge(
                &mut self.model.max_attempts_per_candidate,
                model.max_attempts_per_candidate,
            );
            merge(&mut self.model.backoff_base_ms, model.backoff_base_ms);
        }
        if let Some(server) = file.server {
            merge(&mut self.server.bind_address, server.bind_address);
            merge(&mut self.server.health_check_port, server.health_check_port);
            merge(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }
        if let Some(sweeps) = file.sweeps {
            merge(&mut self.sweeps.dead_letter_interval_secs, sweeps.dead_letter_interval_secs);
            merge(
                &mut self.sweeps.escalation_expiry_interval_secs,
                sweeps.escalation_expiry_interval_secs,
            );
            merge(
                &mut self.sweeps.approval_expiry_interval_secs,
                sweeps.approval_expiry_interval_secs,
            );
            merge(&mut self.sweeps.approval_ttl_hours, sweeps.approval_ttl_hours);
        }
        if let Some(channels) = file.channels {
            if channels.whatsapp_endpoint.is_some() {
                self.channels.whatsapp_endpoint = channels.whatsapp_endpoint;
            }
            if let Some(token) = channels.whatsapp_token {
                self.channels.whatsapp_token = Some(token.into());
            }
            if channels.sms_endpoint.is_some() {
                self.channels.sms_endpoint = channels.sms_endpoint;
            }
            if let Some(token) = channels.sms_token {
                self.channels.sms_token = Some(token.into());
            }
            if channels.email_endpoint.is_some() {
                self.channels.email_endpoint = channels.email_endpoint;
            }
            if channels.email_from.is_some() {
                self.channels.email_from = channels.email_from;
            }
            if channels.web_chat_endpoint.is_some() {
                self.channels.web_chat_endpoint = channels.web_chat_endpoint;
            }
        }
        if let Some(notifications) = file.notifications {
            if notifications.chat_webhook_url.is_some() {
                self.notifications.chat_webhook_url = notifications.chat_webhook_url;
            }
            if let Some(token) = notifications.chat_token {
                self.notifications.chat_token = Some(token.into());
            }
            if notifications.push_endpoint.is_some() {
                self.notifications.push_endpoint = notifications.push_endpoint;
            }
            if let Some(token) = notifications.push_token {
                self.notifications.push_token = Some(token.into());
            }
            if notifications.email_endpoint.is_some() {
                self.notifications.email_endpoint = notifications.email_endpoint;
            }
            if notifications.email_from.is_some() {
                self.notifications.email_from = notifications.email_from;
            }
        }
        if let Some(logging) = file.logging {
            merge(&mut self.logging.level, logging.level);
            if let Some(format) = logging.format.as_deref().and_then(LogFormat::parse) {
                self.logging.format = format;
            }
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("LIAISON_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("LIAISON_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("LIAISON_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format).ok_or_else(|| {
                ConfigError::InvalidEnvOverride { key: "LIAISON_LOG_FORMAT".into(), value: format }
            })?;
        }
        if let Ok(provider) = env::var("LIAISON_MODEL_PROVIDER") {
            self.model.provider = ModelProvider::parse(&provider).ok_or_else(|| {
                ConfigError::InvalidEnvOverride {
                    key: "LIAISON_MODEL_PROVIDER".into(),
                    value: provider,
                }
            })?;
        }
        if let Ok(api_key) = env::var("LIAISON_MODEL_API_KEY") {
            self.model.api_key = Some(api_key.into());
        }
        if let Ok(candidates) = env::var("LIAISON_MODEL_CANDIDATES") {
            self.model.candidates =
                candidates.split(',').map(|model| model.trim().to_string()).collect();
        }
        if let Ok(url) = env::var("LIAISON_CHAT_WEBHOOK_URL") {
            self.notifications.chat_webhook_url = Some(url);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        merge(&mut self.database.url, overrides.database_url);
        merge(&mut self.logging.level, overrides.log_level);
        if let Some(provider) = overrides.model_provider {
            self.model.provider = provider;
        }
        merge(&mut self.model.candidates, overrides.model_candidates);
        if let Some(api_key) = overrides.model_api_key {
            self.model.api_key = Some(api_key.into());
        }
        if overrides.chat_webhook_url.is_some() {
            self.notifications.chat_webhook_url = overrides.chat_webhook_url;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".into()));
        }
        if self.model.candidates.is_empty() {
            return Err(ConfigError::Validation(
                "model.candidates must list at least one model".into(),
            ));
        }
        if self.model.max_attempts_per_candidate == 0 {
            return Err(ConfigError::Validation(
                "model.max_attempts_per_candidate must be at least 1".into(),
            ));
        }
        if matches!(self.model.provider, ModelProvider::OpenAi | ModelProvider::Anthropic)
            && self.model.api_key.is_none()
        {
            return Err(ConfigError::Validation(
                "model.api_key is required for hosted providers".into(),
            ));
        }
        Ok(())
    }
}

fn merge<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ConfigOverrides, LoadOptions, ModelProvider};

    #[test]
    fn defaults_validate_and_use_local_provider() {
        let config = AppConfig::load(LoadOptions::default()).expect("defaults should load");
        assert_eq!(config.model.provider, ModelProvider::Ollama);
        assert_eq!(config.sweeps.dead_letter_interval_secs, 300);
        assert_eq!(config.model.candidates, vec!["llama3.1".to_string()]);
    }

    #[test]
    fn overrides_take_precedence_over_defaults() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                model_candidates: Some(vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]),
                model_provider: Some(ModelProvider::OpenAi),
                model_api_key: Some("sk-test".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.model.candidates.len(), 2);
    }

    #[test]
    fn hosted_provider_without_api_key_fails_validation() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                model_provider: Some(ModelProvider::Anthropic),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        let message = result.err().expect("validation error").to_string();
        assert!(message.contains("api_key"));
    }

    #[test]
    fn empty_candidate_list_fails_validation() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                model_candidates: Some(Vec::new()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        assert!(result.is_err());
    }
}
