//! In-memory task record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::hook::{CLIENT_KEY, HookRef, Params, TID_KEY};

/// One scheduled unit of work.
///
/// Records created by `register_timeout` carry `rearm_timeout`; they can
/// be re-armed ("touched") instead of fired once and, in the memory
/// store, expire silently rather than dispatch.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub tid: String,
    pub hook: HookRef,
    pub params: Params,
    pub due_at: DateTime<Utc>,
    pub rearm_timeout: Option<Duration>,
}

impl TaskRecord {
    /// Build a record, embedding the tid in params under the reserved key.
    pub fn new(tid: impl Into<String>, hook: HookRef, mut params: Params, due_at: DateTime<Utc>) -> Self {
        let tid = tid.into();
        params.insert(TID_KEY.to_string(), json!(tid));
        Self {
            tid,
            hook,
            params,
            due_at,
            rearm_timeout: None,
        }
    }

    pub fn with_rearm_timeout(mut self, timeout: Duration) -> Self {
        self.rearm_timeout = Some(timeout);
        self
    }

    /// True when the stored client tag allows the caller. A record
    /// without a tag accepts everyone; a tagged record requires an equal
    /// tag in the call params.
    pub fn client_matches(&self, call_params: &Params) -> bool {
        match self.params.get(CLIENT_KEY) {
            None => true,
            Some(stored) => call_params.get(CLIENT_KEY) == Some(stored),
        }
    }
}

/// Extract the tid a `call` targets from its params.
pub fn call_target(params: &Params) -> Option<&str> {
    params.get("tid").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_embeds_tid_in_params() {
        let record = TaskRecord::new("job-1", HookRef::named("noop"), Params::new(), Utc::now());
        assert_eq!(record.params.get(TID_KEY), Some(&json!("job-1")));
        assert!(record.rearm_timeout.is_none());
    }

    #[test]
    fn client_tag_validation() {
        let mut params = Params::new();
        params.insert(CLIENT_KEY.to_string(), json!("client-a"));
        let record = TaskRecord::new("job-1", HookRef::named("noop"), params, Utc::now());

        let mut matching = Params::new();
        matching.insert(CLIENT_KEY.to_string(), json!("client-a"));
        assert!(record.client_matches(&matching));

        let mut other = Params::new();
        other.insert(CLIENT_KEY.to_string(), json!("client-b"));
        assert!(!record.client_matches(&other));
        assert!(!record.client_matches(&Params::new()));

        let untagged = TaskRecord::new("job-2", HookRef::named("noop"), Params::new(), Utc::now());
        assert!(untagged.client_matches(&Params::new()));
    }
}
