//! TOML Configuration File Support
//!
//! Centralized configuration loading for the switchboard, from a TOML file at
//! `$XDG_CONFIG_HOME/switchboard/config.toml` or an explicit path.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied through [`ConfigOverrides`])
//! 2. Environment variables (`SWITCHBOARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! socket_path = "/run/user/1000/switchboard/switchboard.sock"
//! signing_key_env = "SWITCHBOARD_SIGNING_KEY"
//!
//! [session]
//! heartbeat_interval_ms = 15000
//! max_streams_per_session = 64
//!
//! [governor]
//! admission_timeout = 250
//! aimd = { alpha = 1.0, beta = 0.5, min_ceiling = 0.5 }
//!
//! [scheduler]
//! weights = { gold = 6, silver = 3, bronze = 1 }
//!
//! [escalation]
//! agreement_threshold = 0.5
//! max_escalations = 1
//!
//! [[adapters]]
//! id = "fast"
//! capabilities = { model = "small", usd_per_1k_output = 0.5, quality_prior = 0.75 }
//! behavior = { response = "pong", confidence = 0.9 }
//!
//! [[rules]]
//! name = "review"
//! task_types = ["code_generation"]
//! eligible_adapters = ["fast", "careful"]
//! escalation_adapter = "expert"
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::ScriptedAdapterConfig;
use crate::consensus::EscalationConfig;
use crate::protocol::MAX_FRAME_SIZE;
use crate::routing::{HealthConfig, PolicyRule, SelectionConfig};
use crate::scheduler::SchedulerConfig;
use crate::session::SessionConfig;
use crate::window::GovernorConfig;

/// Environment variable holding the signing key unless configured otherwise
pub const DEFAULT_SIGNING_KEY_ENV: &str = "SWITCHBOARD_SIGNING_KEY";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Unix socket path the daemon listens on
    pub socket_path: Option<String>,

    /// Environment variable holding the frame signing key
    pub signing_key_env: Option<String>,

    /// Maximum encoded frame size in bytes
    pub max_frame_size: Option<usize>,

    /// Maintenance tick interval in milliseconds
    pub maintenance_interval_ms: Option<u64>,

    /// Adapter health polling interval in milliseconds
    pub health_poll_interval_ms: Option<u64>,

    /// Per-call adapter deadline in milliseconds (task class default if unset)
    pub adapter_timeout_ms: Option<u64>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: Option<u64>,

    /// Reassembly timeout in milliseconds (defaults to the heartbeat interval)
    pub reassembly_timeout_ms: Option<u64>,

    /// Idle session expiry in seconds
    pub session_idle_timeout_secs: Option<u64>,

    /// How long ended streams are remembered, in seconds
    pub terminal_retention_secs: Option<u64>,

    /// Live streams allowed per session
    pub max_streams_per_session: Option<usize>,

    /// Content bytes per outbound data fragment
    pub max_fragment_bytes: Option<usize>,

    /// Incomplete inbound messages held per stream
    pub max_pending_messages: Option<usize>,
}

/// Top-level TOML configuration structure
///
/// Component sections (`governor`, `scheduler`, `selection`, `health`,
/// `escalation`) deserialize straight into the component configs; missing
/// keys keep their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Session configuration section
    pub session: SessionToml,

    /// Window governor section
    pub governor: Option<GovernorConfig>,

    /// QoS scheduler section
    pub scheduler: Option<SchedulerConfig>,

    /// Adapter selection section
    pub selection: Option<SelectionConfig>,

    /// Routing table health section
    pub health: Option<HealthConfig>,

    /// Consensus and escalation section
    pub escalation: Option<EscalationConfig>,

    /// Scripted adapters
    pub adapters: Vec<ScriptedAdapterConfig>,

    /// Policy rules, first match wins
    pub rules: Vec<PolicyRule>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the switchboard
///
/// Consolidates every component configuration and tracks where the values
/// came from. Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Daemon socket path
    pub socket_path: PathBuf,

    /// Environment variable holding the frame signing key
    pub signing_key_env: String,

    /// Maximum encoded frame size in bytes
    pub max_frame_size: usize,

    /// Maintenance tick interval
    pub maintenance_interval: Duration,

    /// Adapter health polling interval
    pub health_poll_interval: Duration,

    /// Per-call adapter deadline; `None` uses the task class default
    pub adapter_timeout: Option<Duration>,

    /// Session manager configuration
    pub session: SessionConfig,

    /// Window governor configuration
    pub governor: GovernorConfig,

    /// QoS scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Adapter selection configuration
    pub selection: SelectionConfig,

    /// Routing table health configuration
    pub health: HealthConfig,

    /// Consensus and escalation configuration
    pub escalation: EscalationConfig,

    /// Scripted adapters to register at startup
    pub adapters: Vec<ScriptedAdapterConfig>,

    /// Initial policy rules
    pub rules: Vec<PolicyRule>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            signing_key_env: DEFAULT_SIGNING_KEY_ENV.to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            maintenance_interval: Duration::from_millis(250),
            health_poll_interval: Duration::from_secs(5),
            adapter_timeout: None,
            session: SessionConfig::default(),
            governor: GovernorConfig::default(),
            scheduler: SchedulerConfig::default(),
            selection: SelectionConfig::default(),
            health: HealthConfig::default(),
            escalation: EscalationConfig::default(),
            adapters: Vec::new(),
            rules: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Read the signing key from the configured environment variable
    ///
    /// An unset or empty variable means frames are not signed.
    #[must_use]
    pub fn signing_key(&self) -> Option<Vec<u8>> {
        std::env::var(&self.signing_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .map(String::into_bytes)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let aimd = &self.governor.aimd;
        if !(aimd.beta > 0.0 && aimd.beta < 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "governor.aimd.beta must be in (0, 1), got {}",
                aimd.beta
            )));
        }
        if aimd.alpha <= 0.0 || aimd.min_ceiling <= 0.0 {
            return Err(ConfigError::ValidationError(
                "governor.aimd.alpha and min_ceiling must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scheduler.gold_reserved_share) {
            return Err(ConfigError::ValidationError(format!(
                "scheduler.gold_reserved_share must be in [0, 1], got {}",
                self.scheduler.gold_reserved_share
            )));
        }
        if self.scheduler.severe_threshold < self.scheduler.shed_threshold {
            return Err(ConfigError::ValidationError(
                "scheduler.severe_threshold must not be below shed_threshold".to_string(),
            ));
        }
        if self.scheduler.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_depth must be at least 1".to_string(),
            ));
        }
        if self.session.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "session.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.session.max_fragment_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_fragment_bytes must be positive".to_string(),
            ));
        }
        if self.session.max_pending_messages == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_pending_messages must be at least 1".to_string(),
            ));
        }
        if self.maintenance_interval.is_zero() || self.health_poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "server.maintenance_interval_ms and health_poll_interval_ms must be positive"
                    .to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            if !seen.insert(adapter.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "adapter '{}' declared twice",
                    adapter.id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/config.toml` or
/// `~/.config/switchboard/config.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("config.toml"))
}

/// Get the default daemon socket path
///
/// Uses `$XDG_RUNTIME_DIR/switchboard/switchboard.sock` when a runtime
/// directory exists, otherwise a directory under the system temp dir.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("switchboard")
        .join("switchboard.sock")
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration is invalid. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                adapters = config.adapters.len(),
                rules = config.rules.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SwitchboardConfig, toml: SwitchboardToml) {
    // Server settings
    if let Some(path) = toml.server.socket_path {
        config.socket_path = PathBuf::from(path);
    }
    if let Some(var) = toml.server.signing_key_env {
        config.signing_key_env = var;
    }
    if let Some(size) = toml.server.max_frame_size {
        config.max_frame_size = size;
    }
    if let Some(ms) = toml.server.maintenance_interval_ms {
        config.maintenance_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.server.health_poll_interval_ms {
        config.health_poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.server.adapter_timeout_ms {
        config.adapter_timeout = Some(Duration::from_millis(ms));
    }

    // Session settings; the reassembly timeout follows the heartbeat unless set
    if let Some(ms) = toml.session.heartbeat_interval_ms {
        config.session = config
            .session
            .clone()
            .with_heartbeat_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = toml.session.reassembly_timeout_ms {
        config.session.reassembly_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.session.session_idle_timeout_secs {
        config.session.session_idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session.terminal_retention_secs {
        config.session.terminal_retention = Duration::from_secs(secs);
    }
    if let Some(max) = toml.session.max_streams_per_session {
        config.session.max_streams_per_session = max;
    }
    if let Some(bytes) = toml.session.max_fragment_bytes {
        config.session.max_fragment_bytes = bytes;
    }
    if let Some(max) = toml.session.max_pending_messages {
        config.session.max_pending_messages = max;
    }

    // Component sections replace defaults wholesale
    if let Some(governor) = toml.governor {
        config.governor = governor;
    }
    if let Some(scheduler) = toml.scheduler {
        config.scheduler = scheduler;
    }
    if let Some(selection) = toml.selection {
        config.selection = selection;
    }
    if let Some(health) = toml.health {
        config.health = health;
    }
    if let Some(escalation) = toml.escalation {
        config.escalation = escalation;
    }

    config.adapters = toml.adapters;
    config.rules = toml.rules;
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut SwitchboardConfig) {
    if let Ok(path) = std::env::var("SWITCHBOARD_SOCKET") {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Ok(var) = std::env::var("SWITCHBOARD_SIGNING_KEY_ENV") {
        config.signing_key_env = var;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("SWITCHBOARD_HEARTBEAT_MS") {
        config.session = config
            .session
            .clone()
            .with_heartbeat_interval(Duration::from_millis(ms));
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env_parse::<usize>("SWITCHBOARD_MAX_STREAMS") {
        config.session.max_streams_per_session = max;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("SWITCHBOARD_ADMISSION_TIMEOUT_MS") {
        config.governor.admission_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env_parse::<u32>("SWITCHBOARD_MAX_ESCALATIONS") {
        config.escalation.max_escalations = max;
        config.source = ConfigSource::Env;
    }
    if let Some(size) = env_parse::<usize>("SWITCHBOARD_MAX_FRAME_SIZE") {
        config.max_frame_size = size;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,

    /// Signing key environment variable override
    pub signing_key_env: Option<String>,

    /// Heartbeat interval override (milliseconds)
    pub heartbeat_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set signing key environment variable override
    #[must_use]
    pub fn with_signing_key_env(mut self, var: String) -> Self {
        self.signing_key_env = Some(var);
        self
    }

    /// Set heartbeat interval override
    #[must_use]
    pub fn with_heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut SwitchboardConfig) {
        if self.socket_path.is_some() || self.signing_key_env.is_some() || self.heartbeat_ms.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }

        if let Some(ref var) = self.signing_key_env {
            config.signing_key_env = var.clone();
        }

        if let Some(ms) = self.heartbeat_ms {
            config.session = config
                .session
                .clone()
                .with_heartbeat_interval(Duration::from_millis(ms));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::consensus::Strategy;
    use crate::routing::TaskClass;

    /// Clean up all environment variables used by config loading.
    fn clear_config_env_vars() {
        for var in [
            "SWITCHBOARD_SOCKET",
            "SWITCHBOARD_SIGNING_KEY_ENV",
            "SWITCHBOARD_HEARTBEAT_MS",
            "SWITCHBOARD_MAX_STREAMS",
            "SWITCHBOARD_ADMISSION_TIMEOUT_MS",
            "SWITCHBOARD_MAX_ESCALATIONS",
            "SWITCHBOARD_MAX_FRAME_SIZE",
        ] {
            std::env::remove_var(var);
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = SwitchboardConfig::default();

        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.session.reassembly_timeout, Duration::from_secs(15));
        assert_eq!(config.governor.admission_timeout, Duration::from_millis(250));
        assert_eq!(config.scheduler.weights.gold, 6);
        assert_eq!(config.escalation.max_escalations, 1);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.signing_key_env, DEFAULT_SIGNING_KEY_ENV);
        assert!(config.adapters.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("switchboard/config.toml"));
        }
        assert!(default_socket_path().ends_with("switchboard/switchboard.sock"));
    }

    // =========================================================================
    // File Loading Tests
    // =========================================================================

    #[test]
    fn test_load_full_config_from_file() {
        clear_config_env_vars();
        let file = write_config(
            r#"
[server]
socket_path = "/tmp/sb-test.sock"
maintenance_interval_ms = 100
adapter_timeout_ms = 3000

[session]
heartbeat_interval_ms = 2000
max_streams_per_session = 8

[governor]
admission_timeout = 50
aimd = { alpha = 2.0, beta = 0.25, min_ceiling = 1.0 }

[escalation]
agreement_threshold = 0.4
agreement_metric = "claim_overlap"

[[adapters]]
id = "fast"
capabilities = { model = "small", quality_prior = 0.8, usd_per_1k_output = 0.5 }
behavior = { response = "pong", confidence = 0.9 }

[[rules]]
name = "review"
task_types = ["code_generation"]
eligible_adapters = ["fast"]

[rules.strategy]
kind = "two_phase_commit"
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/sb-test.sock"));
        assert_eq!(config.maintenance_interval, Duration::from_millis(100));
        assert_eq!(config.adapter_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.health_poll_interval, Duration::from_secs(5));
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.session.reassembly_timeout, Duration::from_secs(2));
        assert_eq!(config.session.max_streams_per_session, 8);
        assert_eq!(config.governor.admission_timeout, Duration::from_millis(50));
        assert!((config.governor.aimd.beta - 0.25).abs() < f64::EPSILON);
        // Keys missing from a section keep their defaults
        assert!((config.governor.update_threshold - 0.20).abs() < f64::EPSILON);
        assert!((config.escalation.agreement_threshold - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.adapters.len(), 1);
        assert_eq!(config.adapters[0].behavior.response, "pong");
        assert_eq!(config.rules[0].task_types, vec![TaskClass::CodeGeneration]);
        assert!(matches!(
            config.rules[0].strategy,
            Strategy::TwoPhaseCommit { .. }
        ));
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        clear_config_env_vars();
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/switchboard.toml"))).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let file = write_config("[session\nheartbeat_interval_ms = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_rejects_bad_beta() {
        let file = write_config("[governor]\naimd = { beta = 1.5 }\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_duplicate_adapters() {
        let mut config = SwitchboardConfig::default();
        let adapter = ScriptedAdapterConfig {
            id: "dup".to_string(),
            capabilities: Default::default(),
            behavior: Default::default(),
        };
        config.adapters = vec![adapter.clone(), adapter];
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Override Tests
    // =========================================================================

    #[test]
    fn test_cli_overrides_take_precedence() {
        let mut config = SwitchboardConfig::default();
        ConfigOverrides::new()
            .with_socket_path(PathBuf::from("/tmp/cli.sock"))
            .with_heartbeat_ms(500)
            .apply(&mut config);

        assert_eq!(config.source(), ConfigSource::Cli);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/cli.sock"));
        assert_eq!(config.session.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.session.reassembly_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = SwitchboardConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_signing_key_from_named_env() {
        let mut config = SwitchboardConfig::default();
        config.signing_key_env = "SWITCHBOARD_TEST_KEY_UNIQUE".to_string();
        std::env::remove_var("SWITCHBOARD_TEST_KEY_UNIQUE");
        assert!(config.signing_key().is_none());
        std::env::set_var("SWITCHBOARD_TEST_KEY_UNIQUE", "s3cret");
        assert_eq!(config.signing_key(), Some(b"s3cret".to_vec()));
        std::env::remove_var("SWITCHBOARD_TEST_KEY_UNIQUE");
    }
}
