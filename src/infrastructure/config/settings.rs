use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Shared secret expected in `X-API-Key`; unset disables the check
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Recipient directory used to expand role/group filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// JSON file holding an array of directory entries; unset means empty
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// `memory` or `redis`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_broker_prefix")]
    pub prefix: String,
    /// Total delivery attempts per pointer before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter_factor: f64,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_reconcile_grace")]
    pub reconcile_grace_seconds: u64,
    /// Dead letters kept for inspection; older ones are trimmed
    #[serde(default = "default_dead_letter_limit")]
    pub dead_letter_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Run consumer loops in this process
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Jobs processed concurrently by this process
    #[serde(default = "default_job_concurrency")]
    pub job_concurrency: usize,
    /// Concurrent provider calls per job
    #[serde(default = "default_fanout_width")]
    pub fanout_width: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// `log`, `smtp` or `http`
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls: bool,
    #[serde(default = "default_smtp_pool_size")]
    pub smtp_pool_size: u32,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_body_limit() -> usize {
    2 * 1024 * 1024 // 2 MiB, enough for ~10k recipients
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_broker_prefix() -> String {
    "ara:delivery".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_cap() -> u64 {
    300_000 // 5 minutes
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    500
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_grace() -> u64 {
    120
}

fn default_dead_letter_limit() -> usize {
    10_000
}

fn default_job_concurrency() -> usize {
    4
}

fn default_fanout_width() -> usize {
    10
}

fn default_send_timeout() -> u64 {
    15_000
}

fn default_provider_kind() -> String {
    "log".to_string()
}

fn default_from_email() -> String {
    "noreply@localhost".to_string()
}

fn default_from_name() -> String {
    "Ara".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

fn default_smtp_pool_size() -> u32 {
    10
}

fn default_api_url() -> String {
    "https://api.sendgrid.com/v3".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-delivery-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("store.backend", "memory")?
            .set_default("broker.backend", "memory")?
            .set_default("provider.kind", "log")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER__PORT, BROKER__MAX_ATTEMPTS, WORKER__FANOUT_WIDTH, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations that would make the worker loop misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.max_attempts == 0 {
            return Err(ConfigError::Message(
                "broker.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.broker.backoff_cap_ms < self.broker.backoff_base_ms {
            return Err(ConfigError::Message(
                "broker.backoff_cap_ms must be >= broker.backoff_base_ms".to_string(),
            ));
        }
        if self.worker.job_concurrency == 0 || self.worker.fanout_width == 0 {
            return Err(ConfigError::Message(
                "worker.job_concurrency and worker.fanout_width must be positive".to_string(),
            ));
        }
        if self.store.backend == "postgres" && self.database.url.is_none() {
            return Err(ConfigError::Message(
                "store.backend = postgres requires database.url".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            run_migrations: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            prefix: default_broker_prefix(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            backoff_jitter_factor: default_backoff_jitter(),
            visibility_timeout_seconds: default_visibility_timeout(),
            poll_interval_ms: default_poll_interval(),
            reconcile_interval_seconds: default_reconcile_interval(),
            reconcile_grace_seconds: default_reconcile_grace(),
            dead_letter_limit: default_dead_letter_limit(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_concurrency: default_job_concurrency(),
            fanout_width: default_fanout_width(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_tls: false,
            smtp_pool_size: default_smtp_pool_size(),
            api_url: default_api_url(),
            api_key: None,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            store: StoreConfig::default(),
            redis: RedisConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            provider: ProviderConfig::default(),
            directory: DirectoryConfig::default(),
            otel: OtelConfig::default(),
            log: LogConfig::default(),
        }
    }
}
