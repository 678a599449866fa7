use crate::rpc::{FnHandler, HandlerResult, RpcDispatcher, RpcError, codes};
use arc_swap::ArcSwap;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_core::{ProxyConfig, RecordsStore};

/// Handles the admin plane holds into the running server.
pub struct AdminState {
    pub drain: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
    pub records: Arc<RecordsStore>,
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub config_path: PathBuf,
}

/// Register the admin verbs the core consumes.
pub fn build_dispatcher(state: Arc<AdminState>) -> RpcDispatcher {
    let mut dispatcher = RpcDispatcher::new();

    {
        let state = Arc::clone(&state);
        dispatcher.add_method_handler(
            "admin_server_start_drain",
            Box::new(FnHandler(move |_params| start_drain(&state))),
        );
    }
    {
        let state = Arc::clone(&state);
        dispatcher.add_method_handler(
            "admin_server_stop_drain",
            Box::new(FnHandler(move |_params| stop_drain(&state))),
        );
    }
    {
        let state = Arc::clone(&state);
        dispatcher.add_method_handler(
            "admin_server_shutdown",
            Box::new(FnHandler(move |_params| {
                state.shutdown.store(true, Ordering::Relaxed);
                tracing::info!("Shutdown requested via admin interface");
                Ok(json!({}))
            })),
        );
    }
    {
        let state = Arc::clone(&state);
        dispatcher.add_method_handler(
            "admin_config_reload",
            Box::new(FnHandler(move |_params| reload_config(&state))),
        );
    }
    {
        let state = Arc::clone(&state);
        dispatcher.add_method_handler(
            "admin_lookup_records",
            Box::new(FnHandler(move |params| lookup_records(&state, params))),
        );
    }

    dispatcher
}

fn start_drain(state: &AdminState) -> HandlerResult {
    if state.drain.swap(true, Ordering::Relaxed) {
        return Err(RpcError::new(codes::SERVER + 1, "Server already draining"));
    }
    tracing::info!("Drain started via admin interface");
    Ok(json!({}))
}

fn stop_drain(state: &AdminState) -> HandlerResult {
    if !state.drain.swap(false, Ordering::Relaxed) {
        return Err(RpcError::new(codes::SERVER + 2, "Server is not draining"));
    }
    tracing::info!("Drain stopped via admin interface");
    Ok(json!({}))
}

fn reload_config(state: &AdminState) -> HandlerResult {
    match ProxyConfig::load(&state.config_path) {
        Ok(config) => {
            state.records.reload(&config);
            state.config.store(Arc::new(config));
            tracing::info!(path = %state.config_path.display(), "Config reloaded");
            Ok(json!({}))
        }
        Err(e) => Err(RpcError::new(codes::CONFIGURATION, e.to_string())),
    }
}

fn lookup_records(state: &AdminState, params: Option<Value>) -> HandlerResult {
    let names: Vec<String> = params
        .as_ref()
        .and_then(|p| p.get("records"))
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if names.is_empty() {
        return Err(RpcError::new(codes::RECORD, "No record names provided"));
    }
    let mut record_list = Vec::new();
    let mut error_list = Vec::new();
    for name in names {
        match state.records.get(&name) {
            Some(value) => record_list.push(json!({
                "record_name": name,
                "current_value": value.to_string(),
            })),
            None => error_list.push(json!({
                "code": codes::RECORD + 1,
                "message": format!("Record not found: {name}"),
            })),
        }
    }
    Ok(json!({"recordList": record_list, "errorList": error_list}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AdminState> {
        let config = ProxyConfig::default();
        Arc::new(AdminState {
            drain: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            records: Arc::new(RecordsStore::from_config(&config)),
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path: PathBuf::from("/nonexistent/records.yaml"),
        })
    }

    #[test]
    fn drain_toggles_and_rejects_double_start() {
        let s = state();
        assert!(start_drain(&s).is_ok());
        assert!(s.drain.load(Ordering::Relaxed));
        let err = start_drain(&s).unwrap_err();
        assert_eq!(err.code, codes::SERVER + 1);
        assert!(stop_drain(&s).is_ok());
        let err = stop_drain(&s).unwrap_err();
        assert_eq!(err.code, codes::SERVER + 2);
    }

    #[test]
    fn lookup_records_splits_hits_and_misses() {
        let s = state();
        let result = lookup_records(
            &s,
            Some(json!({"records": ["proxy.cache.enabled", "proxy.bogus"]})),
        )
        .unwrap();
        assert_eq!(result["recordList"].as_array().unwrap().len(), 1);
        assert_eq!(result["errorList"].as_array().unwrap().len(), 1);
        assert_eq!(result["recordList"][0]["record_name"], "proxy.cache.enabled");
    }

    #[test]
    fn lookup_records_without_names_is_a_record_error() {
        let s = state();
        let err = lookup_records(&s, None).unwrap_err();
        assert_eq!(err.code, codes::RECORD);
    }
}
