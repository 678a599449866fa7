use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Envelope validation codes. Validation is strict and consistent: a
/// non-string `jsonrpc` or `method` is a protocol error, and null or
/// empty-string ids are rejected outright.
pub mod protocol {
    pub const INVALID_VERSION: i64 = 1;
    pub const INVALID_VERSION_TYPE: i64 = 2;
    pub const MISSING_VERSION: i64 = 3;
    pub const INVALID_METHOD_TYPE: i64 = 4;
    pub const MISSING_METHOD: i64 = 5;
    pub const INVALID_PARAMS_TYPE: i64 = 6;
    pub const INVALID_ID_TYPE: i64 = 7;
    pub const NULL_ID: i64 = 8;
    pub const EXECUTION_ERROR: i64 = 9;
    pub const EMPTY_ID: i64 = 11;
}

/// Domain error ranges for handler-reported failures.
pub mod codes {
    pub const CONFIGURATION: i64 = 1;
    pub const METRIC: i64 = 1000;
    pub const RECORD: i64 = 2000;
    pub const SERVER: i64 = 3000;
    pub const STORAGE: i64 = 4000;
    pub const PLUGIN: i64 = 5000;
    pub const GENERIC: i64 = 30000;
}

/// A handler failure, surfaced inside the execution-error envelope's
/// `data` array.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

pub type HandlerResult = Result<Value, RpcError>;

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, params: Option<Value>) -> HandlerResult;
}

/// Adapter for plain synchronous handler functions.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>) -> HandlerResult + Send + Sync,
{
    async fn call(&self, params: Option<Value>) -> HandlerResult {
        (self.0)(params)
    }
}

type NotificationFn = Box<dyn Fn(Option<Value>) + Send + Sync>;

/// Method and notification registry plus the protocol engine: parses the
/// envelope, validates strictly, dispatches, and shapes replies. Batch
/// calls produce one reply per call member; notifications are silent.
#[derive(Default)]
pub struct RpcDispatcher {
    methods: HashMap<String, Box<dyn MethodHandler>>,
    notifications: HashMap<String, NotificationFn>,
}

enum Validated {
    Call { method: String, params: Option<Value>, id: Value },
    Notification { method: String, params: Option<Value> },
    Invalid(Value),
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps the existing handler) on a duplicate name.
    pub fn add_method_handler(
        &mut self,
        name: impl Into<String>,
        handler: Box<dyn MethodHandler>,
    ) -> bool {
        let name = name.into();
        if self.methods.contains_key(&name) || self.notifications.contains_key(&name) {
            return false;
        }
        self.methods.insert(name, handler);
        true
    }

    pub fn add_notification_handler(
        &mut self,
        name: impl Into<String>,
        handler: NotificationFn,
    ) -> bool {
        let name = name.into();
        if self.methods.contains_key(&name) || self.notifications.contains_key(&name) {
            return false;
        }
        self.notifications.insert(name, handler);
        true
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Process one wire message (a single request or a batch). `None` means
    /// nothing goes back (a lone notification).
    pub async fn handle_call(&self, input: &str) -> Option<String> {
        let parsed: Value = match serde_json::from_str(input) {
            Ok(v) => v,
            Err(_) => {
                return Some(
                    json!({"jsonrpc": "2.0", "error": {"code": PARSE_ERROR, "message": "Parse error"}})
                        .to_string(),
                );
            }
        };
        match parsed {
            Value::Array(items) => {
                if items.is_empty() {
                    // An empty batch is a single error object, not an array.
                    return Some(invalid_request(None).to_string());
                }
                let mut replies = Vec::new();
                for item in items {
                    if let Some(reply) = self.process_one(item).await {
                        replies.push(reply);
                    }
                }
                if replies.is_empty() {
                    None
                } else {
                    Some(Value::Array(replies).to_string())
                }
            }
            other => self.process_one(other).await.map(|v| v.to_string()),
        }
    }

    async fn process_one(&self, item: Value) -> Option<Value> {
        match validate(item) {
            Validated::Invalid(err) => Some(err),
            Validated::Notification { method, params } => {
                match self.notifications.get(&method) {
                    Some(handler) => handler(params),
                    // Unknown notifications vanish silently.
                    None => tracing::debug!(method = %method, "Unknown notification"),
                }
                None
            }
            Validated::Call { method, params, id } => {
                let Some(handler) = self.methods.get(&method) else {
                    return Some(error_reply(
                        METHOD_NOT_FOUND,
                        "Method not found",
                        None,
                        Some(id),
                    ));
                };
                match handler.call(params).await {
                    Ok(result) => {
                        Some(json!({"jsonrpc": "2.0", "result": result, "id": id}))
                    }
                    Err(e) => Some(error_reply(
                        protocol::EXECUTION_ERROR,
                        "Error during execution",
                        Some(json!([{"code": e.code, "message": e.message}])),
                        Some(id),
                    )),
                }
            }
        }
    }
}

fn error_reply(code: i64, message: &str, data: Option<Value>, id: Option<Value>) -> Value {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    let mut reply = json!({"jsonrpc": "2.0", "error": error});
    if let Some(id) = id {
        reply["id"] = id;
    }
    reply
}

fn invalid_request(id: Option<Value>) -> Value {
    error_reply(INVALID_REQUEST, "Invalid Request", None, id)
}

fn validate(item: Value) -> Validated {
    let Value::Object(obj) = item else {
        return Validated::Invalid(invalid_request(None));
    };
    if obj.is_empty() {
        return Validated::Invalid(invalid_request(None));
    }

    // The id is validated first so protocol errors can echo it.
    let id = match obj.get("id") {
        None => None,
        Some(Value::Null) => {
            return Validated::Invalid(error_reply(
                protocol::NULL_ID,
                "Use of null as id is discouraged",
                None,
                None,
            ));
        }
        Some(Value::String(s)) if s.is_empty() => {
            return Validated::Invalid(error_reply(
                protocol::EMPTY_ID,
                "Use of an empty string as id is discouraged",
                None,
                None,
            ));
        }
        Some(id @ Value::String(_)) | Some(id @ Value::Number(_)) => Some(id.clone()),
        Some(_) => {
            return Validated::Invalid(error_reply(
                protocol::INVALID_ID_TYPE,
                "Invalid id type, should be a string or a number",
                None,
                None,
            ));
        }
    };
    let fail = |code: i64, message: &str| {
        Validated::Invalid(error_reply(code, message, None, id.clone()))
    };

    match obj.get("jsonrpc") {
        None => return fail(protocol::MISSING_VERSION, "Missing version field"),
        Some(Value::String(v)) => {
            if v != "2.0" {
                return fail(protocol::INVALID_VERSION, "Invalid version, 2.0 only");
            }
        }
        Some(_) => {
            return fail(
                protocol::INVALID_VERSION_TYPE,
                "Invalid version type, should be a string",
            );
        }
    }

    let method = match obj.get("method") {
        None => return fail(protocol::MISSING_METHOD, "Missing method field"),
        Some(Value::String(m)) => m.clone(),
        Some(_) => {
            return fail(
                protocol::INVALID_METHOD_TYPE,
                "Invalid method type, should be a string",
            );
        }
    };

    let params = match obj.get("params") {
        None => None,
        Some(p @ Value::Object(_)) | Some(p @ Value::Array(_)) => Some(p.clone()),
        Some(_) => {
            return fail(
                protocol::INVALID_PARAMS_TYPE,
                "Invalid params type. A Structured value is expected",
            );
        }
    };

    match id {
        Some(id) => Validated::Call { method, params, id },
        None => Validated::Notification { method, params },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> RpcDispatcher {
        let mut d = RpcDispatcher::new();
        d.add_method_handler(
            "echo",
            Box::new(FnHandler(|params: Option<Value>| Ok(params.unwrap_or(Value::Null)))),
        );
        d
    }

    #[tokio::test]
    async fn result_reply_carries_id() {
        let d = dispatcher();
        let reply = d
            .handle_call(r#"{"jsonrpc": "2.0", "method": "echo", "params": {"a": 1}, "id": "13"}"#)
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["id"], "13");
        assert_eq!(v["result"]["a"], 1);
        assert_eq!(v["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn notification_produces_no_reply() {
        let d = dispatcher();
        let reply = d
            .handle_call(r#"{"jsonrpc": "2.0", "method": "echo", "params": {}}"#)
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut d = dispatcher();
        let added = d.add_method_handler("echo", Box::new(FnHandler(|_| Ok(Value::Null))));
        assert!(!added);
    }

    #[tokio::test]
    async fn number_ids_are_accepted() {
        let d = dispatcher();
        let reply = d
            .handle_call(r#"{"jsonrpc": "2.0", "method": "echo", "id": 42}"#)
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["id"], 42);
    }

    #[tokio::test]
    async fn boolean_id_is_a_type_error() {
        let d = dispatcher();
        let reply = d
            .handle_call(r#"{"jsonrpc": "2.0", "method": "echo", "id": true}"#)
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["error"]["code"], protocol::INVALID_ID_TYPE);
    }

    #[tokio::test]
    async fn non_structured_params_are_rejected() {
        let d = dispatcher();
        let reply = d
            .handle_call(r#"{"jsonrpc": "2.0", "method": "echo", "params": 5, "id": "1"}"#)
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["error"]["code"], protocol::INVALID_PARAMS_TYPE);
    }
}
