//! Error normalization.
//!
//! Handlers fail by returning [`crate::AppError`] (or by panicking, which the
//! catch-panic layer turns into one). Either way the response carries an
//! [`ErrorReport`] extension. Failures produced outside the handler body,
//! such as extractor rejections for malformed JSON or an oversized body, come
//! back as plain-text 4xx/5xx responses; their text becomes the message.
//! This middleware rewrites both kinds into the uniform envelope:
//!
//! ```json
//! { "erro": "teapot", "requestId": "abc-123", "stack": "..." }
//! ```
//!
//! `stack` is only emitted when [`ErrorPolicy::expose_stack`] is set, which is
//! decided once from the configured environment. Error responses that are
//! already JSON (the 404 fallback, for instance) pass through untouched.

use axum::Json;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::request_id::RequestIdExt;
use crate::config::Config;
use crate::error::{ErrorBody, ErrorReport, GENERIC_ERROR_MESSAGE};
use crate::metrics;

/// Largest rejection body read back as the error message.
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Whether error bodies include diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub expose_stack: bool,
}

impl ErrorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            expose_stack: config.environment.exposes_stack_traces(),
        }
    }
}

/// Rewrites failed responses into the error envelope.
pub async fn normalize_errors(
    State(policy): State<ErrorPolicy>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req.request_id().map(str::to_owned);
    let response = next.run(req).await;

    if let Some(report) = response.extensions().get::<ErrorReport>().cloned() {
        return envelope(policy, request_id, report, response.headers());
    }

    if !is_unreported_error(&response) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let text = to_bytes(body, MAX_REJECTION_BODY)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_owned())
        .unwrap_or_default();
    debug!(
        status = parts.status.as_u16(),
        message = %text,
        "Request rejected outside the handler"
    );

    envelope(
        policy,
        request_id,
        rejection_report(parts.status, text),
        &parts.headers,
    )
}

/// A failed response that no `AppError` produced and that is not JSON yet.
fn is_unreported_error(response: &Response) -> bool {
    let status = response.status();
    (status.is_client_error() || status.is_server_error()) && !is_json(response.headers())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

fn rejection_report(status: StatusCode, text: String) -> ErrorReport {
    let stack = format!("{status}: {text}");
    let message = if text.is_empty() {
        GENERIC_ERROR_MESSAGE.to_string()
    } else {
        text
    };

    ErrorReport {
        status,
        message,
        stack,
    }
}

fn envelope(
    policy: ErrorPolicy,
    request_id: Option<String>,
    report: ErrorReport,
    headers: &HeaderMap,
) -> Response {
    metrics::record_error(report.status.as_u16());

    let body = ErrorBody {
        erro: report.message,
        request_id,
        stack: policy.expose_stack.then_some(report.stack),
    };

    let mut normalized = (report.status, Json(body)).into_response();

    // Keep headers set by the handler, except those describing the old body
    for (name, value) in headers {
        if name != CONTENT_TYPE && name != CONTENT_LENGTH {
            normalized.headers_mut().append(name.clone(), value.clone());
        }
    }

    normalized
}
