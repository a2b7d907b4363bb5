use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::workflows::permit::{ReviewPolicy, UserId};

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

/// Top-level configuration for the permit service.
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

        let payment_deadline_days = read_positive("PERMIT_PAYMENT_DEADLINE_DAYS", 7)?;
        let sweep_interval_secs = read_positive("PERMIT_SWEEP_INTERVAL_SECS", 300)?;
        let card_validity_days = read_positive("PERMIT_CARD_VALIDITY_DAYS", 365)?;
        let state_path = env::var("PERMIT_STATE_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let blob_base_url = env::var("PERMIT_BLOB_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "http://127.0.0.1:9000/permit-uploads".to_string());
        let bootstrap_admin = match env::var("PERMIT_BOOTSTRAP_ADMIN_ID") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                Uuid::parse_str(raw.trim())
                    .map(UserId)
                    .map_err(|_| ConfigError::InvalidId {
                        key: "PERMIT_BOOTSTRAP_ADMIN_ID",
                    })?,
            ),
            _ => None,
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            review: ReviewConfig {
                payment_deadline_days,
                sweep_interval_secs,
                card_validity_days,
                state_path,
                blob_base_url,
                bootstrap_admin,
            },
        })
    }
}

fn read_positive(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidNumber { key }),
        },
        Err(_) => Ok(default),
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

/// Review lifecycle dials and where the in-process ledger persists its snapshot.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub payment_deadline_days: u32,
    pub sweep_interval_secs: u32,
    pub card_validity_days: u32,
    pub state_path: Option<PathBuf>,
    /// Prefix for signed links to uploaded files.
    pub blob_base_url: String,
    /// System admin seeded on startup so roles can be assigned on a fresh ledger.
    pub bootstrap_admin: Option<UserId>,
}

impl ReviewConfig {
    pub fn policy(&self) -> ReviewPolicy {
        ReviewPolicy {
            payment_deadline_days: i64::from(self.payment_deadline_days),
            card_validity_days: i64::from(self.card_validity_days),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sweep_interval_secs))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
    InvalidId { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => {
                write!(f, "{key} must be a positive whole number")
            }
            ConfigError::InvalidId { key } => write!(f, "{key} must be a UUID"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidId { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        env::remove_var("APP_ENV");
        env::remove_var("APP_HOST");
        env::remove_var("APP_PORT");
        env::remove_var("APP_LOG_LEVEL");
        env::remove_var("PERMIT_PAYMENT_DEADLINE_DAYS");
        env::remove_var("PERMIT_SWEEP_INTERVAL_SECS");
        env::remove_var("PERMIT_CARD_VALIDITY_DAYS");
        env::remove_var("PERMIT_STATE_PATH");
        env::remove_var("PERMIT_BLOB_BASE_URL");
        env::remove_var("PERMIT_BOOTSTRAP_ADMIN_ID");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.review.payment_deadline_days, 7);
        assert_eq!(config.review.sweep_interval(), Duration::from_secs(300));
        assert!(config.review.state_path.is_none());
        assert!(config.review.blob_base_url.starts_with("http://127.0.0.1:9000"));
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn rejects_zero_deadline() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PERMIT_PAYMENT_DEADLINE_DAYS", "0");
        match AppConfig::load() {
            Err(ConfigError::InvalidNumber { key }) => {
                assert_eq!(key, "PERMIT_PAYMENT_DEADLINE_DAYS")
            }
            other => panic!("expected invalid number, got {other:?}"),
        }
        reset_env();
    }

    #[test]
    fn review_policy_carries_configured_days() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PERMIT_PAYMENT_DEADLINE_DAYS", "10");
        env::set_var("PERMIT_CARD_VALIDITY_DAYS", "180");
        let config = AppConfig::load().expect("config loads");
        let policy = config.review.policy();
        assert_eq!(policy.payment_deadline_days, 10);
        assert_eq!(policy.card_validity_days, 180);
        reset_env();
    }

    #[test]
    fn bootstrap_admin_must_be_a_uuid() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("PERMIT_BOOTSTRAP_ADMIN_ID", "root");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidId { .. })
        ));

        env::set_var(
            "PERMIT_BOOTSTRAP_ADMIN_ID",
            "6f1c1d3e-2b7a-4c1e-9a51-0e3f2b8d7c41",
        );
        let config = AppConfig::load().expect("config loads");
        assert!(config.review.bootstrap_admin.is_some());
        reset_env();
    }
}
