use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

/// Exit status a POSIX shell reports when the command cannot be found.
pub const EXIT_COMMAND_NOT_FOUND: i64 = 127;
/// Exit status a POSIX shell reports when the command exists but cannot run.
pub const EXIT_PERMISSION_DENIED: i64 = 126;

/// Classification of terminal failures, used to pick the message shown to the
/// user and to decide whether the next candidate command is worth trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Peer disconnected or sent a close frame. Never reported to the user.
    TransportClosed,
    CommandNotFound,
    PermissionDenied,
    Timeout,
    /// The container, pod or host could not be reached at all.
    TargetUnavailable,
    /// Malformed control traffic that survived tolerant decoding.
    ProtocolError,
    Failed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransportClosed => "transport_closed",
            ErrorKind::CommandNotFound => "command_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TargetUnavailable => "target_unavailable",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Failed => "failed",
        }
    }

    /// Failures specific to one candidate command. Another command may still
    /// work, so the attempt loop moves on instead of giving up.
    pub fn is_candidate_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::CommandNotFound
                | ErrorKind::PermissionDenied
                | ErrorKind::Timeout
                | ErrorKind::Failed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a remote executor while starting or streaming a command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command terminated with exit code {code}")]
    Exited { code: i64 },
    #[error("operation timed out")]
    Timeout,
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),
    #[error("terminal transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Exited { code } => classify_exit_code(*code),
            ExecError::Timeout => ErrorKind::Timeout,
            ExecError::TargetUnavailable(_) => ErrorKind::TargetUnavailable,
            ExecError::Transport(_) => ErrorKind::TransportClosed,
            ExecError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::CommandNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::UnexpectedEof => ErrorKind::TransportClosed,
                _ => classify_message(&e.to_string()),
            },
            ExecError::Other(message) => classify_message(message),
        }
    }
}

impl From<SessionError> for ExecError {
    fn from(err: SessionError) -> Self {
        ExecError::Transport(err.to_string())
    }
}

pub fn classify_exit_code(code: i64) -> ErrorKind {
    match code {
        EXIT_COMMAND_NOT_FOUND => ErrorKind::CommandNotFound,
        EXIT_PERMISSION_DENIED => ErrorKind::PermissionDenied,
        _ => ErrorKind::Failed,
    }
}

/// Best-effort classification of backend error text. Backends surface most
/// start failures as free-form strings (OCI runtime messages, API errors).
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("executable file not found")
        || has("command not found")
        || has("no such file or directory")
        || has("not found in path")
        || has("exit code 127")
    {
        ErrorKind::CommandNotFound
    } else if has("permission denied") || has("operation not permitted") || has("exit code 126")
    {
        ErrorKind::PermissionDenied
    } else if has("deadline exceeded") || has("timed out") || has("timeout") {
        ErrorKind::Timeout
    } else if has("no such container")
        || has("container not found")
        || has("pod not found")
        || has("is not running")
        || has("connection refused")
        || has("no route to host")
        || has("unreachable")
    {
        ErrorKind::TargetUnavailable
    } else if has("connection reset") || has("broken pipe") || has("session closed") {
        ErrorKind::TransportClosed
    } else {
        ErrorKind::Failed
    }
}

/// Errors surfaced by the terminal session adapter.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("terminal session closed")]
    Closed,
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by the HTTP surface before the WebSocket is upgraded.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RelayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let body = serde_json::json!({ "code": code, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
