//! Tool host error type: one taxonomy shared by the descriptor store, the
//! process supervisor and the orchestration facade. The control API maps each
//! variant onto an HTTP status code.

use axum::http::StatusCode;

/// Errors surfaced by tool lifecycle operations.
///
/// None of these are fatal to the host process; every variant is reportable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("No available port")]
    NoAvailablePort,

    #[error("Failed to start: {0}")]
    FailedToStart(String),

    #[error("Health check failed")]
    HealthCheckFailed,

    #[error("No running process for tool '{0}'")]
    ProcessNotFound(String),

    #[error("Tool '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("Installation failed: {0}")]
    InstallationFailed(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Manifest '{0}' not found")]
    ManifestNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ToolError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor(reason.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ManifestNotFound(_) | Self::ProcessNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyInstalled(_) => StatusCode::CONFLICT,
            Self::NoAvailablePort => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
            Self::HealthCheckFailed => StatusCode::GATEWAY_TIMEOUT,
            Self::FailedToStart(_) | Self::InstallationFailed(_) | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoAvailablePort => "NO_AVAILABLE_PORT",
            Self::FailedToStart(_) => "FAILED_TO_START",
            Self::HealthCheckFailed => "HEALTH_CHECK_FAILED",
            Self::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Self::AlreadyInstalled(_) => "ALREADY_INSTALLED",
            Self::InstallationFailed(_) => "INSTALLATION_FAILED",
            Self::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            Self::ManifestNotFound(_) => "MANIFEST_NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Message suitable for showing to the person who asked for the operation.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoAvailablePort => {
                "No free port was found for this tool. Stop another tool or widen its port range.".to_string()
            }
            Self::FailedToStart(cause) => {
                format!("The tool could not be launched: {}", cause)
            }
            Self::HealthCheckFailed => {
                "The tool started but never answered its health check. Check its logs and try again.".to_string()
            }
            Self::ProcessNotFound(id) => format!("'{}' is not running.", id),
            Self::AlreadyInstalled(id) => format!("'{}' is already installed.", id),
            Self::InstallationFailed(output) => {
                if output.trim().is_empty() {
                    "Installation failed without any output.".to_string()
                } else {
                    format!("Installation failed:\n{}", output.trim_end())
                }
            }
            Self::InvalidDescriptor(reason) => format!("The tool description is invalid: {}", reason),
            Self::ManifestNotFound(id) => format!("No tool named '{}' is known.", id),
            Self::Storage(msg) => format!("Could not read or write tool data: {}", msg),
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
            "message": self.user_message(),
        })
    }
}

impl axum::response::IntoResponse for ToolError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
