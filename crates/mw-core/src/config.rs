use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("schema validation failed: {0}")]
    Schema(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub liveness: LivenessConfig,
    pub stream: StreamConfig,
    pub notify: NotifyConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the HTTP service binds to.
    pub bind: String,
    pub port: u16,
    /// Per-topic broadcast ring size of the in-process bus.
    pub bus_capacity: usize,
    /// Seconds background tasks get to finish after shutdown is requested.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8095,
            bus_capacity: 256,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the SQLite database.
    pub state_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: "state".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct LivenessConfig {
    /// Heartbeat write period.
    pub period_secs: u64,
    /// Age after which the worker counts as offline; must exceed the period.
    pub stale_after_secs: u64,
    /// Overrides the `<host>:<pid>` identity written with each beat.
    pub process_identity: Option<String>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            period_secs: 30,
            stale_after_secs: 90,
            process_identity: None,
        }
    }
}

impl LivenessConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct StreamConfig {
    pub default_min_interval_ms: u64,
    pub min_interval_floor_ms: u64,
    pub min_interval_ceiling_ms: u64,
    pub default_max_rows: u32,
    pub max_rows_cap: u32,
    pub keepalive_secs: u64,
    /// Reconnect delay hint sent in the stream preamble.
    pub retry_ms: u64,
    /// Optional hard cap on one session's lifetime.
    pub max_session_secs: Option<u64>,
    /// Frames buffered per client before the session waits on the transport.
    pub frame_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_min_interval_ms: 1000,
            min_interval_floor_ms: 100,
            min_interval_ceiling_ms: 10_000,
            default_max_rows: 100,
            max_rows_cap: 500,
            keepalive_secs: 25,
            retry_ms: 3000,
            max_session_secs: None,
            frame_buffer: 16,
        }
    }
}

impl StreamConfig {
    /// Requested push interval clamped into the configured range.
    pub fn clamp_interval(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_min_interval_ms)
            .clamp(self.min_interval_floor_ms, self.min_interval_ceiling_ms);
        Duration::from_millis(ms)
    }

    /// Requested row limit clamped into `1..=max_rows_cap`.
    pub fn clamp_rows(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_max_rows)
            .clamp(1, self.max_rows_cap.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn max_session(&self) -> Option<Duration> {
        self.max_session_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct NotifyConfig {
    /// At most one publish-failure warning per this many seconds.
    pub cooldown_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { cooldown_secs: 10 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run the heartbeat publisher inside the server process.
    pub embedded: bool,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value =
        serde_json::to_value(&raw).map_err(|e| ConfigError::Schema(e.to_string()))?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigError::Schema(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&content)
}

/// Resolve configuration the way both binaries do: `MW_CONFIG`, then
/// `mirrorwatch.toml` in the working directory, then defaults; environment
/// overrides are applied last.
pub fn load_from_env() -> Result<Config, ConfigError> {
    let mut cfg = match discovered_config_path() {
        Some(path) => {
            let cfg = load_config(&path)?;
            info!(path = %path.display(), "loaded configuration");
            cfg
        }
        None => Config::default(),
    };
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

fn discovered_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("MW_CONFIG") {
        if !explicit.trim().is_empty() {
            return Some(PathBuf::from(explicit));
        }
    }
    let local = PathBuf::from("mirrorwatch.toml");
    local.exists().then_some(local)
}

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = std::env::var("MW_PORT")
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(bind) = std::env::var("MW_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("MW_STATE_DIR") {
            if !dir.trim().is_empty() {
                self.store.state_dir = dir;
            }
        }
        if let Ok(id) = std::env::var("MW_PROCESS_ID") {
            if !id.trim().is_empty() {
                self.liveness.process_identity = Some(id);
            }
        }
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.liveness;
        if l.period_secs == 0 {
            return Err(ConfigError::Invalid(
                "liveness.period_secs must be positive".into(),
            ));
        }
        if l.stale_after_secs <= l.period_secs {
            return Err(ConfigError::Invalid(format!(
                "liveness.stale_after_secs ({}) must exceed liveness.period_secs ({})",
                l.stale_after_secs, l.period_secs
            )));
        }
        let s = &self.stream;
        if s.min_interval_floor_ms == 0 || s.min_interval_floor_ms > s.min_interval_ceiling_ms {
            return Err(ConfigError::Invalid(
                "stream interval bounds must satisfy 0 < floor <= ceiling".into(),
            ));
        }
        if s.keepalive_secs == 0 {
            return Err(ConfigError::Invalid(
                "stream.keepalive_secs must be positive".into(),
            ));
        }
        if s.frame_buffer == 0 {
            return Err(ConfigError::Invalid(
                "stream.frame_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.store.state_dir)
    }
}
