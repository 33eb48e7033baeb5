use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("invalid bind address {0}")]
    InvalidBind(String),
}

/// Effective control-plane configuration.
///
/// Sources, lowest precedence first: built-in defaults, the TOML file named by
/// `PODGATE_CONFIG`, then individual environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub app_name: String,
    pub bind: String,
    pub port: u16,
    pub state_dir: PathBuf,
    pub http_concurrency: usize,
    pub queue: QueueConfig,
    pub presence: PresenceConfig,
    pub idle: IdleConfig,
    pub inference: InferenceConfig,
    pub pod: PodConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Global cap on queued + running items.
    pub max_size: usize,
    pub worker_tick_ms: u64,
    pub history_limit: usize,
    pub error_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    pub shutdown_after_secs: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    pub default_system_prompt: String,
    pub default_temperature: f64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub pod_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the remote token verifier (`{url}/auth/v1/user`).
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// token -> user id
    pub static_tokens: BTreeMap<String, String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            app_name: "control-plane".into(),
            bind: "127.0.0.1".into(),
            port: 8080,
            state_dir: PathBuf::from("state"),
            http_concurrency: 256,
            queue: QueueConfig::default(),
            presence: PresenceConfig::default(),
            idle: IdleConfig::default(),
            inference: InferenceConfig::default(),
            pod: PodConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            worker_tick_ms: 700,
            history_limit: 20,
            error_max_chars: 500,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { window_secs: 120 }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            shutdown_after_secs: 900,
            check_interval_secs: 60,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            model: "local-model".into(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            default_temperature: 0.7,
            request_timeout_secs: 120,
        }
    }
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.runpod.io/graphql".into(),
            api_key: None,
            pod_id: None,
        }
    }
}

impl ControlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = match lookup("PODGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_overrides(&lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded control-plane config file");
        Ok(cfg)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        set_string(lookup, "PUBLIC_APP_NAME", &mut self.app_name);
        set_string(lookup, "PODGATE_BIND", &mut self.bind);
        set_parsed(lookup, "PORT", &mut self.port)?;
        if let Some(dir) = lookup("PODGATE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        set_parsed(lookup, "PODGATE_HTTP_MAX_CONC", &mut self.http_concurrency)?;

        set_parsed(lookup, "MAX_QUEUE_SIZE", &mut self.queue.max_size)?;
        set_parsed(lookup, "PODGATE_WORKER_TICK_MS", &mut self.queue.worker_tick_ms)?;
        set_parsed(lookup, "PODGATE_HISTORY_LIMIT", &mut self.queue.history_limit)?;
        set_parsed(lookup, "PODGATE_ERROR_MAX_CHARS", &mut self.queue.error_max_chars)?;

        set_parsed(lookup, "PRESENCE_ACTIVE_SECONDS", &mut self.presence.window_secs)?;

        set_parsed(
            lookup,
            "IDLE_SHUTDOWN_SECONDS",
            &mut self.idle.shutdown_after_secs,
        )?;
        set_parsed(
            lookup,
            "PODGATE_IDLE_CHECK_SECS",
            &mut self.idle.check_interval_secs,
        )?;

        set_string(lookup, "LLAMA_BASE_URL", &mut self.inference.base_url);
        set_string(lookup, "PODGATE_MODEL", &mut self.inference.model);
        set_string(
            lookup,
            "PODGATE_DEFAULT_SYSTEM_PROMPT",
            &mut self.inference.default_system_prompt,
        );
        set_parsed(
            lookup,
            "PODGATE_DEFAULT_TEMPERATURE",
            &mut self.inference.default_temperature,
        )?;
        set_parsed(
            lookup,
            "PODGATE_HTTP_TIMEOUT_SECS",
            &mut self.inference.request_timeout_secs,
        )?;

        set_string(lookup, "RUNPOD_API_BASE", &mut self.pod.api_base);
        set_opt_string(lookup, "RUNPOD_API_KEY", &mut self.pod.api_key);
        set_opt_string(lookup, "RUNPOD_POD_ID", &mut self.pod.pod_id);

        set_opt_string(lookup, "PODGATE_AUTH_URL", &mut self.auth.url);
        set_opt_string(lookup, "PODGATE_AUTH_API_KEY", &mut self.auth.api_key);
        if let Some(raw) = lookup("PODGATE_STATIC_TOKENS") {
            self.auth.static_tokens = parse_static_tokens(&raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 5] = [
            ("MAX_QUEUE_SIZE", self.queue.max_size as u64),
            ("PODGATE_WORKER_TICK_MS", self.queue.worker_tick_ms),
            ("PODGATE_IDLE_CHECK_SECS", self.idle.check_interval_secs),
            ("PODGATE_HTTP_MAX_CONC", self.http_concurrency as u64),
            ("PODGATE_HTTP_TIMEOUT_SECS", self.inference.request_timeout_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { key });
            }
        }
        if !(0.0..=2.0).contains(&self.inference.default_temperature) {
            return Err(ConfigError::Invalid {
                key: "PODGATE_DEFAULT_TEMPERATURE",
                value: self.inference.default_temperature.to_string(),
            });
        }
        if self.pod.api_key.is_none() || self.pod.pod_id.is_none() {
            warn!("RUNPOD_API_KEY or RUNPOD_POD_ID not set; pod control calls will fail");
        }
        Ok(())
    }

    pub fn addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.queue.worker_tick_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.request_timeout_secs)
    }
}

fn set_string<F>(lookup: &F, key: &str, slot: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(key) {
        *slot = v;
    }
}

fn set_opt_string<F>(lookup: &F, key: &str, slot: &mut Option<String>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(key) {
        *slot = Some(v);
    }
}

fn set_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw })?;
    }
    Ok(())
}

/// `token=user,token2=user2`
fn parse_static_tokens(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                out.insert(token.trim().to_string(), user.trim().to_string());
            }
            _ => {
                return Err(ConfigError::Invalid {
                    key: "PODGATE_STATIC_TOKENS",
                    value: pair.to_string(),
                })
            }
        }
    }
    Ok(out)
}
