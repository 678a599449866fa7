use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the Strata proxy, loaded from
/// `records.yaml` with `STRATA_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub proxy: ListenerConfig,

    #[serde(default)]
    pub origin: OriginConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Parent proxies tried in order before surfacing 502.
    #[serde(default)]
    pub parents: Vec<String>,

    /// Prefix-rewrite remap rules, first match wins.
    #[serde(default)]
    pub remap: Vec<RemapRule>,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// HTTP listener address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,

    /// Keep-alive idle timeout for client sessions (ms). Also the drain
    /// timeout for half-closed sessions.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_no_activity_ms: u64,

    /// Per-transaction inactivity timeout (ms)
    #[serde(default = "default_inactivity_ms")]
    pub inactivity_timeout_ms: u64,

    /// Wall-clock bound for a whole transaction (ms, 0 = unbounded)
    #[serde(default)]
    pub active_timeout_ms: u64,

    /// Max idle origin sessions parked per (addr, sni, proto) key
    #[serde(default = "default_pool_size")]
    pub keepalive_pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Origin connect timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Origin response inactivity timeout (ms)
    #[serde(default = "default_origin_inactivity")]
    pub inactivity_timeout_ms: u64,

    /// Retries across parents/addresses before 502
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Largest object body accepted by the cache (bytes)
    #[serde(default = "default_max_object")]
    pub max_object_bytes: u64,

    /// Freshness fallback when the response carries no lifetime (secs)
    #[serde(default = "default_heuristic_ttl")]
    pub heuristic_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapRule {
    /// URL prefix to match, e.g. `http://public.example/`
    pub from: String,
    /// Replacement prefix, e.g. `http://origin.internal:8080/`
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Unix socket path for the JSON-RPC management interface
    #[serde(default = "default_admin_socket")]
    pub socket_path: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Session-ticket key file (generated fresh when absent)
    #[serde(default)]
    pub stek_path: Option<String>,

    #[serde(default = "default_true")]
    pub session_tickets_enabled: bool,

    /// TLS 1.3 early data cap advertised to clients
    #[serde(default = "default_max_early_data")]
    pub max_early_data: u32,
}

fn default_node_id() -> String {
    format!("strata-{}", uuid::Uuid::new_v4())
}
fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_keep_alive_ms() -> u64 {
    115_000
}
fn default_inactivity_ms() -> u64 {
    30_000
}
fn default_pool_size() -> usize {
    64
}
fn default_connect_timeout() -> u64 {
    3_000
}
fn default_origin_inactivity() -> u64 {
    30_000
}
fn default_max_attempts() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_max_object() -> u64 {
    4 * 1024 * 1024
}
fn default_heuristic_ttl() -> i64 {
    0
}
fn default_admin_socket() -> String {
    "/run/strata/admin.sock".to_string()
}
fn default_max_early_data() -> u32 {
    16384
}

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default config")
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default listener config")
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default origin config")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default cache config")
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default admin config")
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default tls config")
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("STRATA_").split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn effective_workers(&self) -> usize {
        if self.proxy.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.proxy.workers
        }
    }
}
