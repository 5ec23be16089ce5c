use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Immutable process-wide configuration, loaded once at startup.
///
/// Sources are layered: built-in defaults, then an optional `config.yaml`,
/// then environment variables with the `GROKPROXY` prefix
/// (e.g. `GROKPROXY__SERVER__PORT=8080`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::with_name(path));
            }
            None => {
                if Path::new("config.yaml").exists() {
                    builder = builder.add_source(File::with_name("config"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GROKPROXY")
                .prefix_separator("__")
                .separator("__"),
        );

        builder.build()?.try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_request")]
    pub log_request: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_request: default_log_request(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_request() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Inbound API authentication.
///
/// Keys are supplied as comma-separated plaintext and hashed at startup;
/// only the hashes are kept in memory afterwards. When `admin_api_keys` is
/// empty the regular key list also grants admin access.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: String,
    #[serde(default)]
    pub admin_api_keys: String,
}

impl AuthConfig {
    pub fn api_key_list(&self) -> Vec<String> {
        split_keys(&self.api_keys)
    }

    pub fn admin_key_list(&self) -> Vec<String> {
        let admin = split_keys(&self.admin_api_keys);
        if admin.is_empty() {
            self.api_key_list()
        } else {
            admin
        }
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://grok-proxy.db?mode=rwc".to_string(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_min_connections() -> u32 {
    10
}

fn default_max_connections() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub provider: String,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://grok.com".to_string(),
            provider: "grok".to_string(),
            attempt_timeout_seconds: default_attempt_timeout(),
            user_agents: default_user_agents(),
        }
    }
}

fn default_attempt_timeout() -> u64 {
    60
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0".to_string(),
    ]
}

/// Session pool rotation and health knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: i64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_acquire_wait")]
    pub acquire_wait_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rotation_threshold: default_rotation_threshold(),
            max_age_hours: default_max_age_hours(),
            failure_threshold: default_failure_threshold(),
            health_check_interval_seconds: default_health_check_interval(),
            acquire_wait_seconds: default_acquire_wait(),
        }
    }
}

fn default_rotation_threshold() -> i64 {
    500
}

fn default_max_age_hours() -> i64 {
    24
}

fn default_failure_threshold() -> f64 {
    0.2
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_acquire_wait() -> u64 {
    2
}

/// Retry and circuit breaker knobs for the request coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: Vec<u64>,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_window")]
    pub circuit_window_seconds: u64,
    #[serde(default = "default_circuit_recovery_timeout")]
    pub circuit_recovery_timeout_seconds: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_window_seconds: default_circuit_window(),
            circuit_recovery_timeout_seconds: default_circuit_recovery_timeout(),
        }
    }
}

impl ResilienceConfig {
    /// Backoff before retry `attempt` (0-based); the schedule saturates at
    /// its last entry.
    pub fn backoff_for_attempt(&self, attempt: usize) -> std::time::Duration {
        let secs = self
            .backoff_seconds
            .get(attempt.min(self.backoff_seconds.len().saturating_sub(1)))
            .copied()
            .unwrap_or(0);
        std::time::Duration::from_secs(secs)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_seconds() -> Vec<u64> {
    vec![2, 5, 10, 20, 30]
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_window() -> u64 {
    60
}

fn default_circuit_recovery_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    30
}
