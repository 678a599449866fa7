use crate::config::ProxyConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A configuration record value as exposed over the management interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for RecordValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordValue::Bool(b) => write!(f, "{b}"),
            RecordValue::Int(i) => write!(f, "{i}"),
            RecordValue::Float(x) => write!(f, "{x}"),
            RecordValue::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Process-wide flat registry of dotted-name records, rebuilt on config
/// reload and swapped atomically. Readers never block.
pub struct RecordsStore {
    records: ArcSwap<HashMap<String, RecordValue>>,
}

impl RecordsStore {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self { records: ArcSwap::from_pointee(flatten(config)) }
    }

    pub fn get(&self, name: &str) -> Option<RecordValue> {
        self.records.load().get(name).cloned()
    }

    pub fn all(&self) -> Arc<HashMap<String, RecordValue>> {
        self.records.load_full()
    }

    /// Swap in a freshly loaded config.
    pub fn reload(&self, config: &ProxyConfig) {
        self.records.store(Arc::new(flatten(config)));
        tracing::info!(records = self.records.load().len(), "Records reloaded");
    }
}

fn flatten(config: &ProxyConfig) -> HashMap<String, RecordValue> {
    let mut map = HashMap::new();
    map.insert("proxy.node_id".into(), RecordValue::Str(config.node_id.clone()));
    map.insert(
        "proxy.http.server_ports".into(),
        RecordValue::Str(config.proxy.http_addr.clone()),
    );
    map.insert(
        "proxy.http.keep_alive_no_activity_timeout_in".into(),
        RecordValue::Int(config.proxy.keep_alive_no_activity_ms as i64),
    );
    map.insert(
        "proxy.http.transaction_no_activity_timeout_in".into(),
        RecordValue::Int(config.proxy.inactivity_timeout_ms as i64),
    );
    map.insert(
        "proxy.http.transaction_active_timeout_in".into(),
        RecordValue::Int(config.proxy.active_timeout_ms as i64),
    );
    map.insert(
        "proxy.http.origin_max_connections_per_host".into(),
        RecordValue::Int(config.proxy.keepalive_pool_size as i64),
    );
    map.insert(
        "proxy.http.connect_attempts_timeout".into(),
        RecordValue::Int(config.origin.connect_timeout_ms as i64),
    );
    map.insert(
        "proxy.http.connect_attempts_max_retries".into(),
        RecordValue::Int(config.origin.max_attempts as i64),
    );
    map.insert("proxy.cache.enabled".into(), RecordValue::Bool(config.cache.enabled));
    map.insert(
        "proxy.cache.max_doc_size".into(),
        RecordValue::Int(config.cache.max_object_bytes as i64),
    );
    map.insert(
        "proxy.cache.heuristic_ttl".into(),
        RecordValue::Int(config.cache.heuristic_ttl_secs),
    );
    map.insert(
        "proxy.http.parent_proxies".into(),
        RecordValue::Str(config.parents.join(";")),
    );
    map.insert(
        "proxy.ssl.session_tickets.enabled".into(),
        RecordValue::Bool(config.tls.session_tickets_enabled),
    );
    map.insert(
        "proxy.ssl.max_early_data".into(),
        RecordValue::Int(config.tls.max_early_data as i64),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reflect_config() {
        let config = ProxyConfig::default();
        let store = RecordsStore::from_config(&config);
        assert_eq!(
            store.get("proxy.http.keep_alive_no_activity_timeout_in"),
            Some(RecordValue::Int(115_000))
        );
        assert_eq!(store.get("proxy.cache.enabled"), Some(RecordValue::Bool(true)));
        assert!(store.get("proxy.no.such.record").is_none());
    }

    #[test]
    fn reload_swaps_values() {
        let mut config = ProxyConfig::default();
        let store = RecordsStore::from_config(&config);
        config.proxy.keep_alive_no_activity_ms = 1_000;
        config.parents.push("p1:3128".into());
        store.reload(&config);
        assert_eq!(
            store.get("proxy.http.keep_alive_no_activity_timeout_in"),
            Some(RecordValue::Int(1_000))
        );
        assert_eq!(
            store.get("proxy.http.parent_proxies"),
            Some(RecordValue::Str("p1:3128".into()))
        );
    }

    #[test]
    fn record_value_display() {
        assert_eq!(RecordValue::Int(42).to_string(), "42");
        assert_eq!(RecordValue::Bool(false).to_string(), "false");
        assert_eq!(RecordValue::Str("x".into()).to_string(), "x");
    }
}
