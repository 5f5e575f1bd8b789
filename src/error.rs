use std::path::PathBuf;
use std::process::ExitCode;

/// Errors that abort the daemon before (or instead of) entering the loop.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsafe name {0:?}")]
    UnsafeName(String),

    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),

    #[error("path {path} escapes base directory {base}")]
    PathEscape { path: PathBuf, base: PathBuf },

    #[error("{program} not found on PATH")]
    ProviderNotFound { program: String },

    #[error("{program} timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("{program} failed (exit {code}): {message}")]
    ProviderFailed {
        program: String,
        code: i32,
        message: String,
    },
}

impl BridgeError {
    /// The daemon contract is exit 0 on clean shutdown and exit 1 on any
    /// configuration or fatal startup error.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(1)
    }
}
