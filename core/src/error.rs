use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayErr>;

#[derive(Error, Debug)]
pub enum GatewayErr {
    #[error("failed to spawn agent subprocess: {0}")]
    Spawn(#[source] io::Error),

    #[error("agent handshake failed: {0}")]
    Handshake(String),

    #[error("request `{method}` timed out")]
    RequestTimeout { method: String },

    /// The agent subprocess exited or its channels were torn down.
    #[error("agent connection closed")]
    AgentClosed,

    #[error("agent returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no session with id: {0}")]
    SessionNotFound(String),

    #[error("unknown approval id: {0}")]
    UnknownApproval(String),

    #[error("approval {0} does not belong to this session")]
    ApprovalSessionMismatch(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Stable summary derivation for process-error records. Matching is
/// case-insensitive over the raw details.
pub fn classify_error_summary(details: &str) -> String {
    let lowered = details.to_lowercase();
    if lowered.contains("401") || lowered.contains("invalid_api_key") {
        "鉴权失败：API Key 无效".to_string()
    } else if lowered.contains("timeout") {
        "请求超时".to_string()
    } else {
        "Codex 进程错误".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classifies_auth_failures() {
        assert_eq!(
            classify_error_summary("ERROR http 401 Unauthorized: invalid_api_key"),
            "鉴权失败：API Key 无效"
        );
        assert_eq!(
            classify_error_summary("Invalid_API_Key rejected upstream"),
            "鉴权失败：API Key 无效"
        );
    }

    #[test]
    fn classifies_timeouts() {
        assert_eq!(classify_error_summary("request Timeout after 60s"), "请求超时");
    }

    #[test]
    fn falls_back_to_generic_process_error() {
        assert_eq!(classify_error_summary("segfault"), "Codex 进程错误");
    }
}
