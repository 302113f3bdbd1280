use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// A stored record is missing its hook or params and is never
    /// dispatched silently.
    #[error("task record is unsupported (missing hook or params)")]
    UnsupportedTask,

    /// Unknown TID. Store chains treat this as "not mine, try next".
    #[error("no task registered for tid={0}")]
    NotFound(String),

    #[error("no hook registered for name={0}")]
    HookNotFound(String),

    #[error("hook execution failed: {0}")]
    HookFailed(String),

    #[error("duplicate hook registration for name={0}")]
    DuplicateHook(String),

    /// Operation against a store or dispatcher that is not running.
    #[error("store is not running")]
    Stopped,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("params serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
