//! Wire shapes for forwarding store operations to a remote daemon.
//!
//! Only the serialization boundary lives here: a request is a method
//! name plus the task's fields with the hook flattened to its string id
//! and everything else in a kwargs bag. Transport is out of scope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hook::Params;

/// Remote method names a daemon matches on.
pub mod method {
    pub const ADD: &str = "tasks.add";
    pub const CALL: &str = "tasks.call";
    pub const GET: &str = "tasks.get";
    pub const IS_REGISTERED: &str = "tasks.isRegistered";
    pub const REGISTER_TIMEOUT: &str = "tasks.registerTimeout";
    pub const REMOVE: &str = "tasks.remove";
    pub const REREGISTER_TIMEOUT: &str = "tasks.reregisterTimeout";
    pub const UNREGISTER_TIMEOUT: &str = "tasks.unregisterTimeout";
}

/// One forwarded store operation.
///
/// `hook` is the flattened string id; when the original hook was a
/// persistent LRT wrapper the kwargs carry the `_lrt_hook` marker so the
/// daemon rebuilds the wrapper on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    pub tid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    /// Timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub kwargs: Params,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::LRT_HOOK_KEY;
    use serde_json::json;

    #[test]
    fn request_flattens_kwargs_next_to_the_fixed_fields() {
        let mut kwargs = Params::new();
        kwargs.insert("attempt".to_string(), json!(3));
        kwargs.insert(LRT_HOOK_KEY.to_string(), json!(true));

        let request = ProxyRequest {
            method: method::ADD.to_string(),
            tid: "job-1".to_string(),
            hook: Some("demo.hook".to_string()),
            timeout: Some(900),
            kwargs,
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["method"], json!("tasks.add"));
        assert_eq!(wire["hook"], json!("demo.hook"));
        assert_eq!(wire["attempt"], json!(3));
        assert_eq!(wire[LRT_HOOK_KEY], json!(true));

        let parsed: ProxyRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.kwargs.get("attempt"), Some(&json!(3)));
        assert_eq!(parsed.timeout, Some(900));
    }

    #[test]
    fn error_response_omits_the_result_field() {
        let response = ProxyResponse {
            result: None,
            error: Some("no such task".to_string()),
        };
        let wire = serde_json::to_value(&response).unwrap();
        assert!(wire.get("result").is_none());
        assert_eq!(wire["error"], json!("no such task"));
    }
}
