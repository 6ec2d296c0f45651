//! Quantum KME API Server
//!
//! HTTP surface for the key service (request / fetch / acknowledge / destroy)
//! and the encryption engine.
//!
//! Configuration (environment variables):
//!   QKME_PORT          - Listen port (default: 3000)
//!   QKME_DATA_DIR      - Persistent data directory (default: ./qkme-data)
//!   QKME_LOG_FORMAT    - "json" for structured logging, "pretty" for dev
//!   QKME_*             - Key service settings, see `KmeConfig::from_env`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use quantum_envelope::{CryptoEngine, EncryptionEnvelope, EngineError, SecurityLevel};
use quantum_kme::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct AppState {
    kme: Arc<KeyService>,
    engine: CryptoEngine,
}

type Shared = Arc<AppState>;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct KeyRequestReq {
    request_id: Option<String>,
    key_length_bits: usize,
    recipient: Option<String>,
}

#[derive(Serialize)]
struct KeyResponse {
    key_id: String,
    key: String,
    length_bytes: usize,
}

#[derive(Deserialize)]
struct AckReq {
    consumed_bytes: usize,
    message_id: Option<String>,
}

#[derive(Serialize)]
struct AckResponse {
    status: &'static str,
    consumed_bytes: usize,
    remaining_bytes: usize,
}

#[derive(Deserialize)]
struct EncryptReq {
    level: String,
    payload: String,
    recipient: Option<String>,
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct DecryptReq {
    envelope: EncryptionEnvelope,
}

#[derive(Serialize)]
struct DecryptResponse {
    plaintext: Option<String>,
    verified: bool,
    purge_required: bool,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn err(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

fn kme_err(e: KmeError) -> Response {
    let status = match &e {
        KmeError::KeyUnavailable { .. } => StatusCode::NOT_FOUND,
        KmeError::CapacityExceeded { .. }
        | KmeError::InvalidLength { .. }
        | KmeError::ConsumptionOverrun { .. } => StatusCode::BAD_REQUEST,
        KmeError::DuplicateRequest(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::NOT_FOUND {
        // The protocol surface does not reveal why a key is unavailable.
        return err(status, "key not found");
    }
    err(status, e.to_string())
}

fn engine_err(e: EngineError) -> Response {
    let status = match &e {
        EngineError::KeyUnavailable { .. } => StatusCode::NOT_FOUND,
        EngineError::KeyDestroyed => StatusCode::GONE,
        EngineError::CapacityExceeded { .. }
        | EngineError::ConsumptionOverrun
        | EngineError::UnsupportedLevel(_)
        | EngineError::MalformedEnvelope(_)
        | EngineError::AuthenticationFailed => StatusCode::BAD_REQUEST,
        EngineError::KeyService(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, e.to_string())
}

// ---------------------------------------------------------------------------
// Routes: key service protocol
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

async fn request_key(State(state): State<Shared>, Json(req): Json<KeyRequestReq>) -> Response {
    let recipient = req.recipient.as_deref();
    let result = match req.request_id {
        Some(id) => state.kme.request_key_with_id(RequestId::new(id), req.key_length_bits, recipient),
        None => state.kme.request_key(req.key_length_bits, recipient),
    };
    match result {
        Ok(delivery) => (StatusCode::CREATED, Json(delivery)).into_response(),
        Err(e) => kme_err(e),
    }
}

async fn fetch_key(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match state.kme.fetch_key(&KeyId::new(id)) {
        Ok(key) => Json(KeyResponse {
            key_id: key.key_id.to_string(),
            key: STANDARD.encode(key.as_bytes()),
            length_bytes: key.len(),
        })
        .into_response(),
        Err(e) => kme_err(e),
    }
}

async fn acknowledge(State(state): State<Shared>, Path(id): Path<String>, Json(req): Json<AckReq>) -> Response {
    match state
        .kme
        .acknowledge_usage(&KeyId::new(id), req.consumed_bytes, req.message_id.as_deref())
    {
        Ok(receipt) => Json(AckResponse {
            status: "ack",
            consumed_bytes: receipt.consumed_bytes,
            remaining_bytes: receipt.remaining_bytes,
        })
        .into_response(),
        // A rejected acknowledgement is a 400 whatever the reason.
        Err(KmeError::KeyUnavailable { reason, .. }) => {
            err(StatusCode::BAD_REQUEST, format!("key unavailable: {}", reason))
        }
        Err(e) => kme_err(e),
    }
}

async fn destroy_key(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match state.kme.destroy_key(&KeyId::new(id)) {
        Ok(()) => Json(serde_json::json!({"status": "destroyed"})).into_response(),
        Err(e) => kme_err(e),
    }
}

async fn pool_stats(State(state): State<Shared>) -> Response {
    match state.kme.pool_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => kme_err(e),
    }
}

// ---------------------------------------------------------------------------
// Routes: engine
// ---------------------------------------------------------------------------

async fn encrypt(State(state): State<Shared>, Json(req): Json<EncryptReq>) -> Response {
    let level: SecurityLevel = match req.level.parse() {
        Ok(level) => level,
        Err(_) => return err(StatusCode::BAD_REQUEST, format!("unknown level: {}", req.level)),
    };
    let payload = match STANDARD.decode(req.payload.as_bytes()) {
        Ok(p) => p,
        Err(e) => return err(StatusCode::BAD_REQUEST, format!("payload: {}", e)),
    };
    match state.engine.encrypt_for_message(
        &payload,
        level,
        req.recipient.as_deref(),
        req.message_id.as_deref(),
    ) {
        Ok(envelope) => (StatusCode::CREATED, Json(envelope)).into_response(),
        Err(e) => engine_err(e),
    }
}

async fn decrypt(State(state): State<Shared>, Json(req): Json<DecryptReq>) -> Response {
    match state.engine.decrypt(&req.envelope) {
        Ok(out) => Json(DecryptResponse {
            plaintext: out.plaintext.map(|pt| STANDARD.encode(pt)),
            verified: out.verified,
            purge_required: out.purge_required,
        })
        .into_response(),
        Err(e) => engine_err(e),
    }
}

async fn finalize(State(state): State<Shared>, Json(req): Json<DecryptReq>) -> Response {
    match state.engine.finalize_view_once(&req.envelope) {
        Ok(()) => Json(serde_json::json!({"status": "finalized"})).into_response(),
        Err(e) => engine_err(e),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn app(state: Shared) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/keys", post(request_key))
        .route("/api/v1/keys/:key_id", get(fetch_key).delete(destroy_key))
        .route("/api/v1/keys/:key_id/ack", post(acknowledge))
        .route("/api/v1/pool", get(pool_stats))
        .route("/api/v1/encrypt", post(encrypt))
        .route("/api/v1/decrypt", post(decrypt))
        .route("/api/v1/decrypt/finalize", post(finalize))
        .layer(cors)
        .with_state(state)
}

fn build_state(data_dir: &str, config: KmeConfig) -> Result<Shared, KmeError> {
    let storage = Arc::new(FileBackend::new(format!("{}/keys", data_dir))?);
    let audit_file = Arc::new(FileAuditSink::new(format!("{}/audit.jsonl", data_dir)));
    let audit = Arc::new(IntegrityChainSink::new(audit_file));

    let kme = Arc::new(KeyService::with_config(storage, audit, config));
    let engine = CryptoEngine::new(kme.clone());
    Ok(Arc::new(AppState { kme, engine }))
}

#[tokio::main]
async fn main() {
    let log_format = std::env::var("QKME_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quantum_kme_api=info,quantum_kme=info,quantum_envelope=info".into());
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).with_target(true).with_thread_ids(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let port: u16 = std::env::var("QKME_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let data_dir = std::env::var("QKME_DATA_DIR").unwrap_or_else(|_| "./qkme-data".into());

    let config = match KmeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let state = match build_state(&data_dir, config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(data_dir = %data_dir, error = %e, "failed to open key store");
            std::process::exit(1);
        }
    };
    let loaded = state.kme.entries().map(|e| e.len()).unwrap_or(0);
    tracing::info!(keys = loaded, dir = %data_dir, "loaded key store");

    let _maintenance = spawn_maintenance(state.kme.clone());

    let interval = state.kme.maintenance_interval();
    let app = app(state);

    tracing::info!(port, maintenance_secs = interval.as_secs(), "starting Quantum KME API Server");

    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let kme = Arc::new(KeyService::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryAuditSink::new()),
        ));
        let engine = CryptoEngine::new(kme.clone());
        app(Arc::new(AppState { kme, engine }))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn key_protocol_roundtrip() {
        let app = test_app();
        let (status, delivery) = call(
            &app,
            Method::POST,
            "/api/v1/keys",
            Some(serde_json::json!({"request_id": "req-1", "key_length_bits": 256})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key_id = delivery["key_id"].as_str().unwrap().to_string();
        assert!(delivery["delivery_locator"].as_str().unwrap().ends_with(&key_id));

        let (status, key) = call(&app, Method::GET, &format!("/api/v1/keys/{}", key_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(key["length_bytes"], 32);
        assert_eq!(STANDARD.decode(key["key"].as_str().unwrap()).unwrap().len(), 32);

        let ack_uri = format!("/api/v1/keys/{}/ack", key_id);
        let (status, ack) = call(&app, Method::POST, &ack_uri, Some(serde_json::json!({"consumed_bytes": 20}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "ack");
        assert_eq!(ack["remaining_bytes"], 12);

        let (status, _) = call(&app, Method::POST, &ack_uri, Some(serde_json::json!({"consumed_bytes": 13}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/keys/{}", key_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, &format!("/api/v1/keys/{}", key_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_request_is_400() {
        let app = test_app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/keys",
            Some(serde_json::json!({"key_length_bits": 4 * 1024 * 1024 * 8 + 8})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("capacity"));
    }

    #[tokio::test]
    async fn view_once_over_http() {
        let app = test_app();
        let (status, envelope) = call(
            &app,
            Method::POST,
            "/api/v1/encrypt",
            Some(serde_json::json!({"level": "otp", "payload": STANDARD.encode(b"burn after reading")})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let req = serde_json::json!({"envelope": envelope});
        let (status, out) = call(&app, Method::POST, "/api/v1/decrypt", Some(req.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["verified"], true);
        assert_eq!(out["purge_required"], true);
        assert_eq!(
            STANDARD.decode(out["plaintext"].as_str().unwrap()).unwrap(),
            b"burn after reading"
        );

        let (status, _) = call(&app, Method::POST, "/api/v1/decrypt/finalize", Some(req.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::POST, "/api/v1/decrypt", Some(req)).await;
        assert_eq!(status, StatusCode::GONE);
    }

    #[tokio::test]
    async fn pool_and_health() {
        let app = test_app();
        let (status, _) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, stats) = call(&app, Method::GET, "/api/v1/pool", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["key_count"], 0);
    }
}
