//! End-to-end tests of the request pipeline.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; timing
//! tests run on a paused clock. One test binds a real listener and talks to
//! it with `reqwest`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde_json::{Value, json};
use tower::ServiceExt;

use padaria_backend::middleware::RATE_LIMIT_MESSAGE;
use padaria_backend::{ApiModules, AppError, AppState, Config, Environment, TaskRegistry, build_router};

const TEST_PREFIX: &str = "/api/teste-protegido";

// =============================================================================
// Helpers
// =============================================================================

async fn teapot() -> Result<&'static str, AppError> {
    Err(AppError::status(418, "teapot"))
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(60)).await;
    "tarde demais"
}

async fn boom() -> &'static str {
    let missing: Option<&'static str> = None;
    missing.expect("boom")
}

async fn echo(Json(payload): Json<Value>) -> Json<Value> {
    Json(payload)
}

async fn stalled_stream() -> Body {
    Body::from_stream(stream::pending::<Result<Bytes, io::Error>>())
}

fn test_module() -> Router<AppState> {
    Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route("/eco", post(echo))
        .route("/fluxo", get(stalled_stream))
        .route("/teapot", get(teapot))
        .route("/slow", get(slow))
        .route("/panic", get(boom))
}

fn app_with(config: Config, registry: &TaskRegistry) -> (Router, AppState) {
    let state = AppState::new(config, registry).unwrap();
    let modules = ApiModules::new().mount(TEST_PREFIX, test_module()).unwrap();
    let app = build_router(state.clone(), modules).unwrap();
    (app, state)
}

fn app(config: Config) -> Router {
    app_with(config, &TaskRegistry::new()).0
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn request_with_header(uri: &str, name: &str, value: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(name, value)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn json_post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-request-id", "post-1")
        .body(body.into())
        .unwrap()
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_root_greeting() {
    let (status, _, body) = send(&app(Config::default()), get_request("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Olá, Sistema de Entregas da Padaria!".as_bytes());
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let (status, headers, body) = send(&app(Config::default()), get_request("/api/nope")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body), json!({"erro": "Rota não encontrada."}));
    // The 404 still goes through the pipeline
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(headers["x-content-type-options"], "nosniff");
}

#[tokio::test]
async fn test_unmounted_prefix_returns_404() {
    let (status, _, body) = send(&app(Config::default()), get_request("/api/padarias")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body), json!({"erro": "Rota não encontrada."}));
}

#[tokio::test]
async fn test_wrong_method_returns_404() {
    let app = app(Config::default());

    for (method, uri) in [
        (Method::POST, "/"),
        (Method::DELETE, "/api/teste-protegido/ok"),
        (Method::GET, "/api/teste-protegido/eco"),
    ] {
        let req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;

        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(json_body(&body), json!({"erro": "Rota não encontrada."}));
    }
}

// =============================================================================
// CORS
// =============================================================================

#[tokio::test]
async fn test_ngrok_origin_is_reflected() {
    let app = app(Config::default());

    for origin in ["https://abc-123.ngrok-free.app", "https://EVIL.ngrok-free.app"] {
        let (status, headers, _) = send(&app, request_with_header("/", "origin", origin)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["access-control-allow-origin"], origin);
        assert_eq!(headers["vary"], "Origin");
    }
}

#[tokio::test]
async fn test_lookalike_origin_is_denied() {
    let (_, headers, _) = send(
        &app(Config::default()),
        request_with_header("/", "origin", "https://EVIL.ngrok-free.app.attacker.com"),
    )
    .await;

    assert!(headers.get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn test_absent_origin_is_allowed() {
    let (status, headers, _) = send(&app(Config::default()), get_request("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn test_preflight_is_answered_before_rate_limiting() {
    let config = Config {
        rate_limit_max: 1,
        ..Config::default()
    };
    let app = app(config);

    for _ in 0..3 {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/teste-protegido/ok")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "authorization, x-custom")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, req).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers["access-control-allow-origin"], "http://localhost:5173");
        assert_eq!(headers["access-control-allow-headers"], "authorization, x-custom");
        assert_eq!(
            headers["access-control-allow-methods"],
            "GET,POST,PUT,PATCH,DELETE,OPTIONS"
        );
    }

    // Preflights did not consume the single allowed request
    let (status, _, _) = send(&app, get_request("/api/teste-protegido/ok")).await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_request_1001_is_rate_limited() {
    let app = app(Config::default());
    let from = |ip: &str| request_with_header("/", "x-forwarded-for", ip);

    for i in 1..=1000 {
        let (status, _, _) = send(&app, from("203.0.113.7")).await;
        assert_eq!(status, StatusCode::OK, "request #{i}");
    }

    let (status, headers, body) = send(&app, from("203.0.113.7")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(&body), json!({"erro": RATE_LIMIT_MESSAGE}));
    assert_eq!(
        RATE_LIMIT_MESSAGE,
        "Muitas requisições vindas deste IP. Tente novamente mais tarde."
    );
    assert!(headers.contains_key("retry-after"));

    // Other clients keep their own window
    let (status, _, _) = send(&app, from("198.51.100.2")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limiting_can_be_disabled() {
    let config = Config {
        rate_limit_max: 0,
        ..Config::default()
    };
    let app = app(config);

    for _ in 0..20 {
        let (status, _, _) = send(&app, get_request("/")).await;
        assert_eq!(status, StatusCode::OK);
    }
}

// =============================================================================
// Request correlation
// =============================================================================

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (_, headers, _) = send(
        &app(Config::default()),
        request_with_header("/", "x-request-id", "abc-123"),
    )
    .await;

    assert_eq!(headers["x-request-id"], "abc-123");
}

#[tokio::test]
async fn test_request_id_is_generated_per_request() {
    let app = app(Config::default());

    let (_, first, _) = send(&app, get_request("/")).await;
    let (_, second, _) = send(&app, get_request("/")).await;

    let first = first["x-request-id"].to_str().unwrap();
    let second = second["x-request-id"].to_str().unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_blank_request_id_is_replaced() {
    let (_, headers, _) = send(
        &app(Config::default()),
        request_with_header("/", "x-request-id", "   "),
    )
    .await;

    assert!(!headers["x-request-id"].to_str().unwrap().trim().is_empty());
}

// =============================================================================
// Timeout guard
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_handler_gets_503_after_deadline() {
    let app = app(Config::default());
    let started = tokio::time::Instant::now();

    let (status, headers, body) = send(
        &app,
        request_with_header("/api/teste-protegido/slow", "x-request-id", "lento-1"),
    )
    .await;

    let elapsed = started.elapsed();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        json_body(&body),
        json!({"erro": "Request timeout", "requestId": "lento-1"})
    );
    assert_eq!(headers["x-request-id"], "lento-1");
    assert!(elapsed >= Duration::from_millis(30_500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_fast_handler_is_not_interrupted() {
    let (status, _, body) = send(
        &app(Config::default()),
        get_request("/api/teste-protegido/ok"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_response_body_is_cut_at_deadline() {
    let app = app(Config::default());
    let started = tokio::time::Instant::now();

    let response = app
        .oneshot(get_request("/api/teste-protegido/fluxo"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(1));

    let result = to_bytes(response.into_body(), usize::MAX).await;
    let elapsed = started.elapsed();
    assert!(result.is_err());
    assert!(elapsed >= Duration::from_millis(30_500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_request_body_is_released_before_fallback() {
    let app = app(Config::default());
    let started = tokio::time::Instant::now();

    let stalled = Body::from_stream(stream::pending::<Result<Bytes, io::Error>>());
    let (status, _, body) = send(&app, json_post("/api/teste-protegido/eco", stalled)).await;

    let elapsed = started.elapsed();
    let body = json_body(&body);
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["requestId"], "post-1");
    assert!(body["erro"].is_string());
    assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(30_500), "{elapsed:?}");
}

// =============================================================================
// Error normalization
// =============================================================================

#[tokio::test]
async fn test_valid_json_reaches_handler() {
    let (status, _, body) = send(
        &app(Config::default()),
        json_post("/api/teste-protegido/eco", r#"{"pao": 2}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"pao": 2}));
}

#[tokio::test]
async fn test_malformed_json_gets_error_envelope() {
    let (status, headers, body) = send(
        &app(Config::default()),
        json_post("/api/teste-protegido/eco", "{oops"),
    )
    .await;

    let body = json_body(&body);
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers["content-type"], "application/json");
    assert!(
        body["erro"].as_str().unwrap().contains("JSON"),
        "{body}"
    );
    assert_eq!(body["requestId"], "post-1");
    assert!(body["stack"].is_string());
}

#[tokio::test]
async fn test_oversized_body_gets_error_envelope_without_stack_in_production() {
    let config = Config {
        environment: Environment::Production,
        ..Config::default()
    };
    let payload = format!(r#"{{"dados": "{}"}}"#, "a".repeat(2 * 1024 * 1024));

    let (status, _, body) = send(
        &app(config),
        json_post("/api/teste-protegido/eco", payload),
    )
    .await;

    let body = json_body(&body);
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["erro"].is_string());
    assert_eq!(body["requestId"], "post-1");
    assert!(body.get("stack").is_none());
}

#[tokio::test]
async fn test_handler_error_includes_stack_outside_production() {
    let (status, _, body) = send(
        &app(Config::default()),
        request_with_header("/api/teste-protegido/teapot", "x-request-id", "cha-1"),
    )
    .await;

    let body = json_body(&body);
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(body["erro"], "teapot");
    assert_eq!(body["requestId"], "cha-1");
    assert!(body["stack"].is_string());
}

#[tokio::test]
async fn test_handler_error_hides_stack_in_production() {
    let config = Config {
        environment: Environment::Production,
        ..Config::default()
    };

    let (status, _, body) = send(
        &app(config),
        request_with_header("/api/teste-protegido/teapot", "x-request-id", "cha-2"),
    )
    .await;

    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(json_body(&body), json!({"erro": "teapot", "requestId": "cha-2"}));
}

#[tokio::test]
async fn test_panic_becomes_500_with_request_id() {
    let config = Config {
        environment: Environment::Production,
        ..Config::default()
    };

    let (status, _, body) = send(
        &app(config),
        request_with_header("/api/teste-protegido/panic", "x-request-id", "pane-1"),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body), json!({"erro": "boom", "requestId": "pane-1"}));
}

// =============================================================================
// Delivery job
// =============================================================================

#[tokio::test]
async fn test_server_serves_without_delivery_task() {
    let (app, state) = app_with(Config::default(), &TaskRegistry::new());

    assert!(state.delivery_job.is_none());

    let (status, _, _) = send(&app, get_request("/")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, get_request("/api/teste-protegido/ok")).await;
    assert_eq!(status, StatusCode::OK);

    state.shutdown().await;
}

#[tokio::test]
async fn test_delivery_task_runs_at_boot_without_blocking_requests() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    {
        let calls = calls.clone();
        registry.register("gerarEntregasDoDia", move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("banco indisponível")
            }
        });
    }

    let (app, state) = app_with(Config::default(), &registry);
    let job = state.delivery_job.clone().expect("task should resolve");

    // The failing boot run does not affect request handling
    let (status, _, _) = send(&app, get_request("/")).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(5), async {
        while job.status().await.last_outcome.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(job.status().await.failures, 1);

    state.shutdown().await;
}

// =============================================================================
// Over a real socket
// =============================================================================

#[tokio::test]
async fn test_real_listener_round_trip() {
    let (app, state) = app_with(Config::default(), &TaskRegistry::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/"))
        .header("x-request-id", "rede-1")
        .header("origin", "http://127.0.0.1:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "rede-1");
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://127.0.0.1:5173"
    );
    assert_eq!(
        response.text().await.unwrap(),
        "Olá, Sistema de Entregas da Padaria!"
    );

    let response = client
        .get(format!("http://{addr}/api/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"erro": "Rota não encontrada."}));

    server.abort();
    state.shutdown().await;
}
