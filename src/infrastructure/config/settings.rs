use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub persister: PersisterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

/// Ops HTTP listener (health and metrics only)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Standalone server URL; ignored when `cluster_nodes` is set
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Seed nodes; non-empty selects cluster mode
    #[serde(default)]
    pub cluster_nodes: Vec<String>,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_delay_ms: u64,
    /// Run `CONFIG SET notify-keyspace-events` on every node at startup
    #[serde(default = "default_true")]
    pub configure_keyspace_notifications: bool,
    #[serde(default = "default_topology_refresh_interval")]
    pub topology_refresh_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// "redis" or "memory"
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Ephemeral envelopes older than this are discarded instead of delivered
    #[serde(default = "default_max_ephemeral_delay_ms")]
    pub max_ephemeral_delay_ms: u64,
    #[serde(default = "default_persist_lock_ttl")]
    pub persist_lock_ttl_seconds: u64,
    /// Queue and metadata keys expire after this long without writes
    #[serde(default = "default_queue_ttl")]
    pub queue_ttl_seconds: u64,
    #[serde(default = "default_deletion_batch_size")]
    pub deletion_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Maximum listener callbacks running at once
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersisterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "postgres" or "memory"
    #[serde(default = "default_durable_backend")]
    pub durable_backend: String,
    /// A queue becomes eligible once dirty for this long
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_seconds: u64,
    /// Queues fetched per slot per round
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds_per_sweep: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_true() -> bool {
    true
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

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_topology_refresh_interval() -> u64 {
    10
}

fn default_cache_backend() -> String {
    "redis".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_ephemeral_delay_ms() -> u64 {
    10_000
}

fn default_persist_lock_ttl() -> u64 {
    30
}

fn default_queue_ttl() -> u64 {
    2_678_400 // 31 days
}

fn default_deletion_batch_size() -> usize {
    100
}

fn default_dispatch_concurrency() -> usize {
    64
}

fn default_durable_backend() -> String {
    "postgres".to_string()
}

fn default_idle_threshold() -> u64 {
    600 // 10 minutes
}

fn default_batch_limit() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_worker_count() -> usize {
    4
}

fn default_max_rounds() -> usize {
    8
}

fn default_database_url() -> String {
    "postgres://localhost:5432/messages".to_string()
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

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-message-cache".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("redis.url", default_redis_url())?
            .set_default("cache.backend", default_cache_backend())?
            .set_default("persister.durable_backend", default_durable_backend())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA__CACHE__PAGE_SIZE, ARA__REDIS__CLUSTER_NODES=a,b, ...
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("redis.cluster_nodes"),
            );

        builder.build()?.try_deserialize()
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
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            cluster_nodes: vec![],
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial(),
            backoff_max_delay_ms: default_backoff_max(),
            configure_keyspace_notifications: default_true(),
            topology_refresh_interval_seconds: default_topology_refresh_interval(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            page_size: default_page_size(),
            max_ephemeral_delay_ms: default_max_ephemeral_delay_ms(),
            persist_lock_ttl_seconds: default_persist_lock_ttl(),
            queue_ttl_seconds: default_queue_ttl(),
            deletion_batch_size: default_deletion_batch_size(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            durable_backend: default_durable_backend(),
            idle_threshold_seconds: default_idle_threshold(),
            batch_limit: default_batch_limit(),
            sweep_interval_ms: default_sweep_interval_ms(),
            worker_count: default_worker_count(),
            max_rounds_per_sweep: default_max_rounds(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.page_size, 100);
        assert_eq!(cache.max_ephemeral_delay_ms, 10_000);
        assert_eq!(cache.persist_lock_ttl_seconds, 30);
    }

    #[test]
    fn test_persister_defaults() {
        let persister = PersisterConfig::default();
        assert_eq!(persister.idle_threshold_seconds, 600);
        assert_eq!(persister.batch_limit, 100);
        assert!(persister.enabled);
    }

    #[test]
    fn test_sections_deserialize_with_partial_input() {
        let settings: Settings = Config::builder()
            .set_default("cache.backend", "memory")
            .unwrap()
            .set_default("cache.page_size", 25)
            .unwrap()
            .set_default("redis.cluster_nodes", vec!["redis://a:7000", "redis://b:7001"])
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.cache.backend, "memory");
        assert_eq!(settings.cache.page_size, 25);
        assert_eq!(settings.cache.deletion_batch_size, 100);
        assert_eq!(settings.redis.cluster_nodes.len(), 2);
        assert_eq!(settings.server_addr(), "0.0.0.0:8081");
    }
}
