//! Handlers owned by the pipeline itself: the root greeting and the 404
//! fallback. Business endpoints are mounted through [`crate::routes::ApiModules`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

pub const GREETING: &str = "Olá, Sistema de Entregas da Padaria!";

pub const NOT_FOUND_MESSAGE: &str = "Rota não encontrada.";

/// `GET /`
pub async fn greeting() -> &'static str {
    GREETING
}

/// Fallback for any unmatched route.
///
/// Returns the body directly rather than an `AppError` so it carries no
/// `requestId`.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "erro": NOT_FOUND_MESSAGE })),
    )
}
