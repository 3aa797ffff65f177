use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorCode {
    Network,
    Protocol,
    Auth,
    Storage,
    Validation,
    Internal,
}

/// Error surfaced to callers and, via toasts, to the user. `message` is
/// safe to show; `details` carries the raw cause for logs.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{message}")]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

pub type AppResult<T> = Result<T, AppError>;

/// Error body shapes returned by the REST, auth and storage endpoints.
#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl BackendErrorBody {
    fn text(self) -> Option<String> {
        self.message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
            .filter(|m| !m.trim().is_empty())
    }
}

impl AppError {
    pub fn new(code: AppErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            trace_id: Some(crate::observability::trace_id().to_string()),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Protocol, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Auth, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Storage, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Internal, message)
    }

    /// The request never reached the backend and may be replayed once
    /// connectivity returns.
    pub fn is_network(&self) -> bool {
        self.code == AppErrorCode::Network
    }

    /// Maps a non-success HTTP status. The backend's own message, when the
    /// body carries one, becomes the user-facing text.
    pub fn from_status(status: u16, context: &str, body: String) -> Self {
        let backend_message = serde_json::from_str::<BackendErrorBody>(&body)
            .ok()
            .and_then(BackendErrorBody::text);

        let (code, fallback) = match status {
            401 | 403 => (AppErrorCode::Auth, "not authorized".to_string()),
            400 | 404 | 409 | 413 | 415 | 422 => {
                (AppErrorCode::Validation, "rejected by backend".to_string())
            }
            500..=599 => (AppErrorCode::Network, "backend unavailable".to_string()),
            _ => (AppErrorCode::Protocol, format!("unsupported status {}", status)),
        };
        let message = match (code, backend_message) {
            // 5xx text is not meant for users.
            (AppErrorCode::Network, _) | (_, None) => format!("{}: {}", context, fallback),
            (_, Some(text)) => text,
        };

        let err = AppError::new(code, message);
        if body.is_empty() {
            err
        } else {
            err.with_details(body)
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return AppError::protocol("Invalid response body").with_details(value.to_string());
        }
        AppError::network("Network request failed").with_details(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::protocol("Invalid JSON payload").with_details(value.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::storage("Local database failure").with_details(value.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::storage("Local file access failed").with_details(value.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(value: url::ParseError) -> Self {
        AppError::validation("Invalid URL").with_details(value.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(value: validator::ValidationErrors) -> Self {
        let first = value
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid {}", field))
                })
            })
            .next();
        AppError::validation(first.unwrap_or_else(|| "Invalid input".to_string()))
            .with_details(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::network("Realtime connection failed").with_details(value.to_string())
    }
}

impl From<crate::messaging::error::MessagingError> for AppError {
    fn from(value: crate::messaging::error::MessagingError) -> Self {
        AppError::storage("Message queue unavailable").with_details(value.to_string())
    }
}
