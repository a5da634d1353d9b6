//! Server Configuration
//!
//! Configuration management for the Tollgate identity provider.
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, `config/default`, `config/local`, `TOLLGATE__*` environment variables
//! and finally CLI arguments.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use tollgate_auth::AuthConfig;
use tollgate_db::DatabaseConfig;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage configuration
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Token issuance, password hashing and bootstrap users
    #[serde(default)]
    pub auth: AuthConfig,

    /// Signing key management
    #[serde(default)]
    pub keys: KeySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deadline of calls that arrive without one, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for in-flight calls on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerSettings {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", addr, e))
    }

    /// Get the request timeout duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the shutdown timeout duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Postgres,
    /// In-process store; everything is lost on exit
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub backend: Backend,

    /// PostgreSQL URL of the master node
    #[serde(default = "default_master_url")]
    pub master_url: String,

    /// PostgreSQL URLs of read-only replicas
    #[serde(default)]
    pub replica_urls: Vec<String>,

    /// Maximum connections per node
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections per node
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            master_url: default_master_url(),
            replica_urls: Vec::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            run_migrations: true,
        }
    }
}

impl DatabaseSettings {
    pub fn pool_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            master_url: self.master_url.clone(),
            replica_urls: self.replica_urls.clone(),
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            acquire_timeout_secs: self.acquire_timeout_secs,
        }
    }
}

/// Signing key management
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySettings {
    /// Rotate the signing key this often; never when unset
    #[serde(default, with = "humantime_serde")]
    pub rotation_interval: Option<Duration>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// =============================================================================
// Default Functions
// =============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_master_url() -> String {
    "postgresql://localhost/tollgate".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl ServerConfig {
    /// Load configuration from environment and optional config file
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        // e.g. TOLLGATE__SERVER__PORT=9000
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Create a configuration for local development
    pub fn development() -> Self {
        Self {
            database: DatabaseSettings {
                backend: Backend::Memory,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
            ..Default::default()
        }
    }
}
