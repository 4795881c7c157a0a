use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://mirrorwatch.db?mode=rwc";
pub const DEFAULT_DOH_ENDPOINT: &str = "https://dns.google/resolve";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_DNS_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CONCURRENCY: usize = 1;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Probe tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub doh_endpoint: String,
    pub http_timeout: Duration,
    pub dns_timeout: Duration,
    pub concurrency: usize,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub probe: ProbeConfig,
    /// Period of the built-in scheduler; `None` leaves triggering to an external caller.
    pub check_interval: Option<Duration>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let doh_endpoint =
            env::var("DOH_ENDPOINT").unwrap_or_else(|_| DEFAULT_DOH_ENDPOINT.to_string());

        let http_timeout = positive::<u64>("PROBE_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let dns_timeout = positive::<u64>("PROBE_DNS_TIMEOUT_SECS", DEFAULT_DNS_TIMEOUT_SECS)?;
        let concurrency = positive::<usize>("PROBE_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        let interval = parse_var::<u64>("HEALTH_CHECK_INTERVAL_SECS")?.unwrap_or(0);

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            probe: ProbeConfig {
                doh_endpoint,
                http_timeout: Duration::from_secs(http_timeout),
                dns_timeout: Duration::from_secs(dns_timeout),
                concurrency,
            },
            check_interval: (interval > 0).then(|| Duration::from_secs(interval)),
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        Err(_) => Ok(None),
    }
}

fn positive<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
{
    match parse_var::<T>(key)? {
        Some(value) if value <= T::default() => Err(ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        }),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { key, value } => {
                write!(f, "{key} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
