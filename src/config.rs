use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lower bound for the idle timeout accepted from the admin API
pub const MIN_IDLE_TIMEOUT_SECS: i64 = 60;
/// Upper bound for the idle timeout (24 hours)
pub const MAX_IDLE_TIMEOUT_SECS: i64 = 86_400;
pub const MIN_POLL_INTERVAL_SECS: i64 = 1;
pub const MAX_POLL_INTERVAL_SECS: i64 = 300;
pub const MIN_STARTUP_TIMEOUT_SECS: i64 = 5;
pub const MAX_STARTUP_TIMEOUT_SECS: i64 = 3_600;

/// Global configuration loaded from the TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and admin settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Timeouts and intervals driving the lifecycle
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// The managed backend
    pub target: TargetConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8188)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API and event stream
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Admin bind address (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Bearer token required for admin write operations.
    /// When unset, write operations are open to anyone who can reach the admin port.
    pub admin_token: Option<String>,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// JSON file where runtime settings changed through the admin API are kept
    pub state_file: Option<String>,

    /// Number of activity log entries retained (default: 100)
    #[serde(default = "default_activity_log_size")]
    pub activity_log_size: usize,

    /// Interval between status pushes on the event stream, in milliseconds
    #[serde(default = "default_push_interval")]
    pub push_interval_ms: u64,

    /// Stop the target when idlegate itself shuts down (default: true)
    #[serde(default = "default_true")]
    pub stop_target_on_exit: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_bind: default_admin_bind(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            state_file: None,
            activity_log_size: default_activity_log_size(),
            push_interval_ms: default_push_interval(),
            stop_target_on_exit: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds without traffic before the target is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between idle monitor ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds a start may take before it is aborted
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Start the target automatically when proxied traffic arrives
    #[serde(default = "default_true")]
    pub auto_start_enabled: bool,

    /// Readiness probe interval during startup in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Seconds to wait for in-flight requests before stopping
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Max seconds to wait for the backend to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            poll_interval_secs: default_poll_interval(),
            startup_timeout_secs: default_startup_timeout(),
            auto_start_enabled: true,
            probe_interval_ms: default_probe_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            drain_timeout_secs: default_drain_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LifecycleConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Target type: local process or Docker container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Local process spawned directly (default)
    #[default]
    Local,
    /// Docker container managed via Docker API
    Docker,
}

/// Configuration for the managed backend
///
/// # Security Warning
///
/// For local targets, `command` and `args` allow arbitrary command execution.
/// Configuration files must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Target type: "local" (default) or "docker"
    #[serde(default, rename = "type")]
    pub target_type: TargetType,

    /// Display name for local targets, container name for Docker targets
    pub name: Option<String>,

    // === Local process fields ===
    /// Command to execute. When `args` is empty the command is split like a shell would.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    // === Docker-specific fields ===
    /// Image used to create the container when it does not exist yet
    pub image: Option<String>,

    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,

    /// Docker network for a newly created container
    pub network: Option<String>,

    /// Request all GPUs for a newly created container
    #[serde(default)]
    pub gpus: bool,

    // === Common fields ===
    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Host the backend is reachable on (default: 127.0.0.1)
    #[serde(default = "default_target_host")]
    pub host: String,

    /// Port the backend listens on
    pub port: u16,

    /// Readiness endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Optional queue endpoint reporting `queue_running` / `queue_pending` jobs
    pub queue_path: Option<String>,

    /// Path prefix removed from proxied requests before forwarding
    pub strip_prefix: Option<String>,
}

impl TargetConfig {
    /// Create a local target config with defaults
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            target_type: TargetType::Local,
            name: None,
            command: Some(command.to_string()),
            args: Vec::new(),
            working_dir: None,
            image: None,
            docker_host: None,
            network: None,
            gpus: false,
            env: HashMap::new(),
            host: default_target_host(),
            port,
            health_path: default_health_path(),
            queue_path: None,
            strip_prefix: None,
        }
    }

    /// Create a Docker target config for an existing or image-backed container
    pub fn docker(container_name: &str, port: u16) -> Self {
        Self {
            target_type: TargetType::Docker,
            name: Some(container_name.to_string()),
            command: None,
            ..Self::local("", port)
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Name used for status display and, for Docker, the container name
    pub fn default_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        match self.target_type {
            TargetType::Docker => "idlegate-backend".to_string(),
            TargetType::Local => self
                .command
                .as_deref()
                .and_then(|c| c.split_whitespace().next())
                .and_then(|c| Path::new(c).file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "backend".to_string()),
        }
    }

    /// Base URL of the backend
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Validate the target configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.target_type {
            TargetType::Local => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err("local target requires 'command' field".to_string());
                }
            }
            TargetType::Docker => {
                if self.image.is_none() && self.name.is_none() {
                    return Err(
                        "Docker target requires 'name' (existing container) or 'image'".to_string(),
                    );
                }
            }
        }

        if self.port == 0 {
            return Err("target 'port' must be greater than 0".to_string());
        }

        if !self.health_path.starts_with('/') {
            return Err("target 'health_path' must start with '/'".to_string());
        }

        if let Some(ref prefix) = self.strip_prefix {
            if !prefix.starts_with('/') || prefix.ends_with('/') {
                return Err("target 'strip_prefix' must start with '/' and not end with '/'".to_string());
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8188
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_activity_log_size() -> usize {
    100
}

fn default_push_interval() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_poll_interval() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    120 // model loading is slow
}

fn default_probe_interval() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    1800 // generation jobs can run for a long time
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.target.validate() {
            errors.push(e);
        }

        if let Err(e) = RuntimeSettings::from_config(self).validate() {
            errors.push(format!("lifecycle: {}", e));
        }

        if self.lifecycle.probe_interval_ms == 0 {
            errors.push("lifecycle: 'probe_interval_ms' must be greater than 0".to_string());
        }

        if self.server.activity_log_size == 0 {
            errors.push("server: 'activity_log_size' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Rejected settings update. The stored settings are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("no configuration updates provided")]
    Empty,
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
    #[error("invalid target name '{0}': use letters, digits, '_', '.' or '-'")]
    InvalidTargetName(String),
    #[error("cannot change the target while it is {0}")]
    TargetActive(String),
}

/// Settings that can change while idlegate is running.
///
/// Every reader goes through [`SharedSettings`] so an update applies on the
/// next use without restarting anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub idle_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub auto_start_enabled: bool,
    pub target_name: String,
}

pub type SharedSettings = Arc<RwLock<RuntimeSettings>>;

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout_secs: config.lifecycle.idle_timeout_secs,
            poll_interval_secs: config.lifecycle.poll_interval_secs,
            startup_timeout_secs: config.lifecycle.startup_timeout_secs,
            auto_start_enabled: config.lifecycle.auto_start_enabled,
            target_name: config.target.default_name(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        check_range(
            "idle_timeout_secs",
            self.idle_timeout_secs as i64,
            MIN_IDLE_TIMEOUT_SECS,
            MAX_IDLE_TIMEOUT_SECS,
        )?;
        check_range(
            "poll_interval_secs",
            self.poll_interval_secs as i64,
            MIN_POLL_INTERVAL_SECS,
            MAX_POLL_INTERVAL_SECS,
        )?;
        check_range(
            "startup_timeout_secs",
            self.startup_timeout_secs as i64,
            MIN_STARTUP_TIMEOUT_SECS,
            MAX_STARTUP_TIMEOUT_SECS,
        )?;
        validate_target_name(&self.target_name)
    }

    /// Produce the settings resulting from `update`, or the reason it was rejected
    pub fn merged(&self, update: &SettingsUpdate) -> Result<RuntimeSettings, ConfigValidationError> {
        if update.is_empty() {
            return Err(ConfigValidationError::Empty);
        }

        let mut next = self.clone();
        if let Some(v) = update.idle_timeout_secs {
            check_range("idle_timeout_secs", v, MIN_IDLE_TIMEOUT_SECS, MAX_IDLE_TIMEOUT_SECS)?;
            next.idle_timeout_secs = v as u64;
        }
        if let Some(v) = update.poll_interval_secs {
            check_range("poll_interval_secs", v, MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)?;
            next.poll_interval_secs = v as u64;
        }
        if let Some(v) = update.startup_timeout_secs {
            check_range(
                "startup_timeout_secs",
                v,
                MIN_STARTUP_TIMEOUT_SECS,
                MAX_STARTUP_TIMEOUT_SECS,
            )?;
            next.startup_timeout_secs = v as u64;
        }
        if let Some(v) = update.auto_start_enabled {
            next.auto_start_enabled = v;
        }
        if let Some(ref name) = update.target_name {
            validate_target_name(name)?;
            next.target_name = name.clone();
        }
        Ok(next)
    }
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigValidationError> {
    if value < min || value > max {
        return Err(ConfigValidationError::OutOfRange { field, min, max, value });
    }
    Ok(())
}

fn validate_target_name(name: &str) -> Result<(), ConfigValidationError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigValidationError::InvalidTargetName(name.to_string()))
    }
}

/// Partial update accepted by `PUT /api/config`.
///
/// Numbers are signed so that negative input reaches validation instead of
/// failing deserialization with a less helpful message.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub idle_timeout_secs: Option<i64>,
    pub poll_interval_secs: Option<i64>,
    pub startup_timeout_secs: Option<i64>,
    pub auto_start_enabled: Option<bool>,
    pub target_name: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.idle_timeout_secs.is_none()
            && self.poll_interval_secs.is_none()
            && self.startup_timeout_secs.is_none()
            && self.auto_start_enabled.is_none()
            && self.target_name.is_none()
    }

    /// Whether applying this update would change the target identity
    pub fn changes_target(&self, current: &RuntimeSettings) -> bool {
        self.target_name
            .as_deref()
            .is_some_and(|name| name != current.target_name)
    }
}

/// Owner of the runtime settings and their optional on-disk copy
pub struct SettingsStore {
    settings: SharedSettings,
    state_file: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(settings: RuntimeSettings, state_file: Option<PathBuf>) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            state_file,
        }
    }

    /// Build the store from the config file, overlaying any persisted settings
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let state_file = config.server.state_file.as_ref().map(PathBuf::from);
        let mut settings = RuntimeSettings::from_config(config);

        if let Some(ref path) = state_file {
            match load_state(path) {
                Ok(Some(saved)) => match saved.validate() {
                    Ok(()) => {
                        info!(path = %path.display(), "Loaded persisted runtime settings");
                        settings = saved;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Ignoring invalid persisted settings");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read persisted settings");
                }
            }
        }

        Ok(Self::new(settings, state_file))
    }

    /// Shared handle for components that read settings on every use
    pub fn shared(&self) -> SharedSettings {
        Arc::clone(&self.settings)
    }

    pub fn get(&self) -> RuntimeSettings {
        self.settings.read().clone()
    }

    /// Validate and apply an update, persisting it when a state file is configured
    pub fn update(&self, update: &SettingsUpdate) -> Result<RuntimeSettings, ConfigValidationError> {
        let next = {
            let mut guard = self.settings.write();
            let next = guard.merged(update)?;
            *guard = next.clone();
            next
        };

        self.persist(&next);
        Ok(next)
    }

    fn persist(&self, settings: &RuntimeSettings) {
        if let Some(ref path) = self.state_file {
            if let Err(e) = save_state(path, settings) {
                warn!(path = %path.display(), error = %e, "Failed to persist runtime settings");
            }
        }
    }
}

fn load_state(path: &Path) -> anyhow::Result<Option<RuntimeSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write settings atomically: temp file in the same directory, then rename
fn save_state(path: &Path, settings: &RuntimeSettings) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut file = tempfile::NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut file, settings)?;
    file.write_all(b"\n")?;
    file.persist(path)?;
    Ok(())
}
