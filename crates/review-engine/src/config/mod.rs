use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CACHE_TTL_SECS: u64 = 120;
const DEFAULT_SCAN_SIZE_LIMIT: usize = 1 << 20;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the review service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub review: ReviewConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            review: ReviewConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Workspace selection plus snapshot cache and redaction scan limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewConfig {
    pub workspace_id: String,
    pub form_id: String,
    /// Directory for persisted snapshots; `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl: Duration,
    pub scan_size_limit: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            workspace_id: "demo-workspace".to_string(),
            form_id: "demo-form".to_string(),
            cache_dir: None,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            scan_size_limit: DEFAULT_SCAN_SIZE_LIMIT,
        }
    }
}

impl ReviewConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cache_ttl = match env::var("REVIEW_CACHE_TTL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidCacheTtl)?,
            ),
            Err(_) => defaults.cache_ttl,
        };

        let scan_size_limit = match env::var("REVIEW_SCAN_SIZE_LIMIT") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidScanLimit)?,
            Err(_) => defaults.scan_size_limit,
        };

        let cache_dir = env::var("REVIEW_CACHE_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            workspace_id: env::var("REVIEW_WORKSPACE_ID").unwrap_or(defaults.workspace_id),
            form_id: env::var("REVIEW_FORM_ID").unwrap_or(defaults.form_id),
            cache_dir,
            cache_ttl,
            scan_size_limit,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidCacheTtl,
    InvalidScanLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidCacheTtl => {
                write!(f, "REVIEW_CACHE_TTL_SECS must be a whole number of seconds")
            }
            ConfigError::InvalidScanLimit => {
                write!(f, "REVIEW_SCAN_SIZE_LIMIT must be a byte count")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidCacheTtl
            | ConfigError::InvalidScanLimit => None,
        }
    }
}
