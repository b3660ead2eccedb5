//! Terminal configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/attendance-terminal/terminal.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `device.id`
//! - `auth.access_key_file`
//! - `broker.host`
//!
//! The `[api]` section is optional; without it the backend request/response
//! channel is disabled.
//!
//! # Secret files
//! The access key and the optional broker password are read from files
//! holding the raw value on a single line; trimmed on read.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use at_protocol::BrokerEndpoint;

use crate::api::DEFAULT_API_TIMEOUT;
use crate::context::DeviceIdentity;
use crate::storage::StorageMode;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/attendance-terminal/terminal.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub schema_version: u32,
    pub device: DeviceConfig,
    /// The access key (read from the key file, not the file path).
    pub access_key: String,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub update: UpdateConfig,
    pub credentials: CredentialsConfig,
    pub time: TimeConfig,
    pub api: Option<ApiConfig>,
}

impl TerminalConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device.id.clone(),
            access_key: self.access_key.clone(),
            namespace: self.device.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub namespace: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub reconnect_cooldown: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub inbound_budget: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(10_000),
            send_timeout: Duration::from_millis(5_000),
            inbound_budget: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl BrokerConfig {
    pub fn endpoint(&self, client_id: String) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            client_id,
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: self.keep_alive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub log_path: PathBuf,
    pub temp_path: PathBuf,
    pub batch_max: usize,
    pub fallback_capacity: usize,
    pub mode: StorageMode,
}

impl QueueConfig {
    /// Defaults rooted at `log_path`, with the temp log beside it.
    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        let log_path = log_path.into();
        Self {
            temp_path: log_path.with_extension("tmp"),
            log_path,
            batch_max: 50,
            fallback_capacity: 256,
            mode: StorageMode::Durable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfig {
    pub slot_path: PathBuf,
    pub min_size: u64,
    pub max_size: u64,
    pub chunk_size: usize,
    pub request_timeout: Duration,
    pub restart_grace: Duration,
    pub auto_apply: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            slot_path: PathBuf::from("/var/lib/attendance-terminal/firmware.bin"),
            min_size: 100_000,
            max_size: 2_000_000,
            chunk_size: 1024,
            request_timeout: Duration::from_millis(30_000),
            restart_grace: Duration::from_millis(1_000),
            auto_apply: true,
        }
    }
}

impl UpdateConfig {
    pub fn limits(&self) -> at_updater::UpdateLimits {
        at_updater::UpdateLimits {
            min_size: self.min_size,
            max_size: self.max_size,
            chunk_size: self.chunk_size,
            request_timeout: self.request_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialsConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct TimeConfig {
    pub ntp_server: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    device: Option<RawDeviceConfig>,
    auth: Option<RawAuthConfig>,
    broker: Option<RawBrokerConfig>,
    session: Option<RawSessionConfig>,
    queue: Option<RawQueueConfig>,
    update: Option<RawUpdateConfig>,
    credentials: Option<RawCredentialsConfig>,
    time: Option<RawTimeConfig>,
    api: Option<RawApiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    id: Option<String>,
    namespace: Option<String>,
    firmware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    access_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password_file: Option<String>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSessionConfig {
    reconnect_cooldown_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    inbound_budget_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawQueueConfig {
    log_path: Option<String>,
    temp_path: Option<String>,
    batch_max: Option<usize>,
    fallback_capacity: Option<usize>,
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUpdateConfig {
    slot_path: Option<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    chunk_size: Option<usize>,
    request_timeout_ms: Option<u64>,
    restart_grace_ms: Option<u64>,
    auto_apply: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawCredentialsConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimeConfig {
    ntp_server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawApiConfig {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load terminal config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<TerminalConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load terminal config from the default path.
pub fn load_config() -> Result<TerminalConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load terminal config from a TOML string. Secret file paths in the TOML
/// are read directly.
pub fn load_config_from_str(toml_str: &str) -> Result<TerminalConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    // Device identity
    let raw_device = raw
        .device
        .ok_or_else(|| ConfigError::MissingField("device".to_owned()))?;
    let id = raw_device
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("device.id".to_owned()))?;
    let device = DeviceConfig {
        id,
        namespace: raw_device
            .namespace
            .unwrap_or_else(|| "fitinfinity".to_owned()),
        firmware_version: raw_device
            .firmware_version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_owned()),
    };

    // Auth
    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let key_file = raw_auth
        .access_key_file
        .ok_or_else(|| ConfigError::MissingField("auth.access_key_file".to_owned()))?;
    let access_key = read_secret_file(&key_file, "access key")?;

    // Broker
    let raw_broker = raw
        .broker
        .ok_or_else(|| ConfigError::MissingField("broker".to_owned()))?;
    let host = raw_broker
        .host
        .ok_or_else(|| ConfigError::MissingField("broker.host".to_owned()))?;
    let password = match raw_broker.password_file {
        Some(path) => Some(read_secret_file(&path, "broker password")?),
        None => None,
    };
    let broker = BrokerConfig {
        host,
        port: raw_broker.port.unwrap_or(1883),
        username: raw_broker.username,
        password,
        keep_alive: Duration::from_secs(raw_broker.keep_alive_secs.unwrap_or(60)),
    };

    // Session defaults
    let s = raw.session.unwrap_or_default();
    let defaults = SessionConfig::default();
    let session = SessionConfig {
        reconnect_cooldown: s
            .reconnect_cooldown_secs
            .map_or(defaults.reconnect_cooldown, Duration::from_secs),
        heartbeat_interval: s
            .heartbeat_interval_secs
            .map_or(defaults.heartbeat_interval, Duration::from_secs),
        connect_timeout: s
            .connect_timeout_ms
            .map_or(defaults.connect_timeout, Duration::from_millis),
        send_timeout: s
            .send_timeout_ms
            .map_or(defaults.send_timeout, Duration::from_millis),
        inbound_budget: s
            .inbound_budget_ms
            .map_or(defaults.inbound_budget, Duration::from_millis),
        poll_interval: s
            .poll_interval_ms
            .map_or(defaults.poll_interval, Duration::from_millis),
    };
    if session.heartbeat_interval.is_zero() {
        return Err(ConfigError::InvalidValue(
            "session.heartbeat_interval_secs must be greater than 0".to_owned(),
        ));
    }

    // Queue defaults
    let q = raw.queue.unwrap_or_default();
    let mut queue = QueueConfig::at(
        q.log_path
            .unwrap_or_else(|| "/var/lib/attendance-terminal/offline.log".to_owned()),
    );
    if let Some(temp) = q.temp_path {
        queue.temp_path = PathBuf::from(temp);
    }
    if queue.temp_path == queue.log_path {
        return Err(ConfigError::InvalidValue(
            "queue.temp_path must differ from queue.log_path".to_owned(),
        ));
    }
    // Compaction renames the temp log over the live one, which is only atomic
    // within one directory.
    if queue.temp_path.parent() != queue.log_path.parent() {
        return Err(ConfigError::InvalidValue(
            "queue.temp_path must be in the same directory as queue.log_path".to_owned(),
        ));
    }
    if let Some(n) = q.batch_max {
        if n == 0 {
            return Err(ConfigError::InvalidValue(
                "queue.batch_max must be greater than 0".to_owned(),
            ));
        }
        queue.batch_max = n;
    }
    if let Some(n) = q.fallback_capacity {
        queue.fallback_capacity = n;
    }
    if let Some(mode) = q.mode {
        queue.mode = mode.parse().map_err(ConfigError::InvalidValue)?;
    }

    // Update defaults
    let u = raw.update.unwrap_or_default();
    let ud = UpdateConfig::default();
    let update = UpdateConfig {
        slot_path: u.slot_path.map_or(ud.slot_path, PathBuf::from),
        min_size: u.min_size.unwrap_or(ud.min_size),
        max_size: u.max_size.unwrap_or(ud.max_size),
        chunk_size: u.chunk_size.unwrap_or(ud.chunk_size),
        request_timeout: u
            .request_timeout_ms
            .map_or(ud.request_timeout, Duration::from_millis),
        restart_grace: u
            .restart_grace_ms
            .map_or(ud.restart_grace, Duration::from_millis),
        auto_apply: u.auto_apply.unwrap_or(ud.auto_apply),
    };
    if update.min_size > update.max_size {
        return Err(ConfigError::InvalidValue(format!(
            "update.min_size ({}) exceeds update.max_size ({})",
            update.min_size, update.max_size
        )));
    }
    if update.chunk_size == 0 {
        return Err(ConfigError::InvalidValue(
            "update.chunk_size must be greater than 0".to_owned(),
        ));
    }

    let credentials = CredentialsConfig {
        sqlite_path: raw
            .credentials
            .and_then(|c| c.sqlite_path)
            .unwrap_or_else(|| "/var/lib/attendance-terminal/credentials.sqlite3".to_owned()),
    };

    let time = TimeConfig {
        ntp_server: raw
            .time
            .and_then(|t| t.ntp_server)
            .unwrap_or_else(|| "pool.ntp.org".to_owned()),
    };

    let api = match raw.api {
        None => None,
        Some(a) => {
            let base_url = a
                .base_url
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingField("api.base_url".to_owned()))?;
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue(format!(
                    "api.base_url must be an http:// or https:// URL, got {base_url:?}"
                )));
            }
            Some(ApiConfig {
                base_url,
                timeout: a
                    .timeout_ms
                    .map_or(DEFAULT_API_TIMEOUT, Duration::from_millis),
            })
        }
    };

    Ok(TerminalConfig {
        schema_version,
        device,
        access_key,
        broker,
        session,
        queue,
        update,
        credentials,
        time,
        api,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Secret file reader
// ---------------------------------------------------------------------------

fn read_secret_file(path: &str, what: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading {what} file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
