use std::any::Any;

use axum::Json;
use axum::body::Body;
use axum::http::{Response as HttpResponse, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Message used when an error carries no usable text.
pub const GENERIC_ERROR_MESSAGE: &str = "Erro interno";

/// Application-wide error types with appropriate HTTP status codes.
///
/// Handlers (including externally mounted API modules) return this type.
/// The response it produces is completed by the error normalizer middleware,
/// which adds the request's correlation id and, outside production, the
/// diagnostic `stack` field.
#[derive(Error, Debug)]
pub enum AppError {
    /// An error with an explicitly declared HTTP status.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Unexpected failure; the message is shown, the cause chain is the stack.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// Build an error with a declared status, e.g. `AppError::status(418, "teapot")`.
    ///
    /// Codes outside the valid HTTP range fall back to 500.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        AppError::Status {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: message.into(),
        }
    }

    /// Build an internal error from a plain message.
    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal(anyhow::Error::msg(message.into()))
    }

    /// HTTP status to respond with: the declared one, else 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Status { status, .. } => *status,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed in the `erro` field.
    fn client_message(&self) -> String {
        let message = match self {
            AppError::Status { message, .. } => message.clone(),
            AppError::BadRequest(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::Internal(e) => e.to_string(),
            // Configuration details stay server-side
            AppError::ConfigError(_) => String::new(),
        };

        if message.trim().is_empty() {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            message
        }
    }

    /// Diagnostic trace: the full cause chain (and backtrace when captured).
    fn diagnostic(&self) -> String {
        match self {
            AppError::Internal(e) => format!("{e:?}"),
            other => format!("{other:?}"),
        }
    }
}

/// Uniform JSON error envelope.
///
/// `requestId` is always present (possibly `null`); `stack` only outside
/// production.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub erro: String,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    pub fn new(erro: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            erro: erro.into(),
            request_id,
            stack: None,
        }
    }
}

/// Details of a failed request, attached to the response extensions so the
/// error normalizer can rebuild the body with request-scoped information.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub status: StatusCode,
    pub message: String,
    pub stack: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log the full error details server-side for debugging
        if status.is_server_error() {
            tracing::error!(error = ?self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let report = ErrorReport {
            status,
            message: self.client_message(),
            stack: self.diagnostic(),
        };

        let mut response =
            (status, Json(ErrorBody::new(report.message.clone(), None))).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

/// Turn a caught handler panic into an internal error response.
///
/// Used with `tower_http::catch_panic::CatchPanicLayer::custom`.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> HttpResponse<Body> {
    let detail = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        GENERIC_ERROR_MESSAGE.to_string()
    };

    AppError::internal(detail).into_response()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
