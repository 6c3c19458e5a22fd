//! Configuration Module
//!
//! Provides TOML-based configuration for TideMQ with support for:
//! - Broker settings (outbound buffering, keep-alive ceiling)
//! - Session and subscription behaviour
//! - Shared subscription strategy
//! - Authentication and ACL
//! - Cluster bus and durable store selection
//! - Environment variable overrides (TIDEMQ__* prefix)

use std::collections::HashMap;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use store::{StoreBackend, StoreConfig};

mod cluster;
mod store;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker configuration
    pub broker: BrokerConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Subscription index configuration
    pub subscription: SubscriptionConfig,
    /// Shared subscription configuration
    pub shared: SharedConfig,
    /// Retained message configuration
    pub retain: RetainConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// ACL configuration
    pub acl: AclConfig,
    /// Cluster bus configuration
    pub cluster: ClusterConfig,
    /// Durable store configuration
    pub store: StoreConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-connection outbound packet channel capacity.
    /// Packets queue here until the transport writes them to the client.
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
    /// Upper bound for a client's requested keep-alive, in seconds (0 = no bound)
    #[serde(default)]
    pub max_keep_alive: u16,
}

fn default_outbound_channel_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: default_outbound_channel_capacity(),
            max_keep_alive: 0,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prefix for server-generated client identifiers
    #[serde(default = "default_generated_id_prefix")]
    pub generated_id_prefix: String,
}

fn default_generated_id_prefix() -> String {
    "tidemq-".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            generated_id_prefix: default_generated_id_prefix(),
        }
    }
}

/// Subscription index configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Load persistent subscriptions into memory at startup and match there.
    /// When disabled, every match query reads persistent subscriptions from
    /// the store.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
        }
    }
}

/// Shared subscription member selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedStrategy {
    /// Deterministic on publisher client id, topic and group members
    #[default]
    Hash,
    /// Uniform per message
    Random,
    /// Per-topic counter modulo group size
    RoundRobin,
}

/// Shared subscription configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SharedConfig {
    pub strategy: SharedStrategy,
}

/// Retained message configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetainConfig {
    /// Whether retained messages are stored and replayed
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RetainConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow anonymous connections when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether ACL is enabled
    pub enabled: bool,
    /// ACL roles
    #[serde(default)]
    pub roles: Vec<AclRole>,
    /// Default permissions for users without explicit role (including anonymous)
    #[serde(default)]
    pub default: AclPermissions,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    /// Role name
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    /// Topic patterns that can be published to
    pub publish: Vec<String>,
    /// Topic patterns that can be subscribed to
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `TIDEMQ__` prefix with double underscores for nesting:
    ///    - `TIDEMQ__STORE__BACKEND=fjall` overrides `store.backend`
    ///    - `TIDEMQ__SHARED__STRATEGY=round_robin` overrides `shared.strategy`
    ///    - `TIDEMQ__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.outbound_channel_capacity", 1024)?
            .set_default("broker.max_keep_alive", 0)?
            .set_default("session.generated_id_prefix", "tidemq-")?
            .set_default("subscription.cache_enabled", true)?
            .set_default("shared.strategy", "hash")?
            .set_default("retain.enabled", true)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?
            .set_default("cluster.enabled", false)?
            .set_default("cluster.channel", "tidemq:cluster")?
            .set_default("store.backend", "memory")?
            .set_default("store.path", "./data")?
            .set_default("store.flush_interval", "1s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.outbound_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.outbound_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.cluster.enabled && self.cluster.channel.is_empty() {
            return Err(ConfigError::Validation(
                "cluster.channel is required when clustering is enabled".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Fjall && self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "store.path is required for the fjall backend".to_string(),
            ));
        }

        // Validate user password configuration
        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        }

        // Validate ACL role references
        if self.auth.enabled && self.acl.enabled {
            let role_names: std::collections::HashSet<_> =
                self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Build a role lookup map for efficient ACL checks
    pub fn build_role_map(&self) -> HashMap<String, &AclRole> {
        self.acl
            .roles
            .iter()
            .map(|role| (role.name.clone(), role))
            .collect()
    }

    /// Build a user lookup map for efficient auth checks
    pub fn build_user_map(&self) -> HashMap<String, &UserConfig> {
        self.auth
            .users
            .iter()
            .map(|user| (user.username.clone(), user))
            .collect()
    }
}
