use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for the HTTP handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message, so handlers can return
/// `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or incomplete request.
    InvalidRequest(String),
    /// 400 - No SSH client stored under the given id.
    UnknownSshClient(String),
    /// 500 - Dial or authentication against the SSH host failed.
    SshConnectFailed(String),
    /// 500 - Download could not be served.
    DownloadFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownSshClient(_) => StatusCode::BAD_REQUEST,
            ApiError::SshConnectFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DownloadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::UnknownSshClient(_) => "unknown_ssh_client",
            ApiError::SshConnectFailed(_) => "ssh_connect_failed",
            ApiError::DownloadFailed(_) => "download_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::UnknownSshClient(id) => format!("Invalid SSH client ID: {}.", id),
            ApiError::SshConnectFailed(detail) => format!("SSH connection failed: {}.", detail),
            ApiError::DownloadFailed(detail) => format!("Download failed: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
